//! 1-bit landscape canvas that every screen draws onto.
//!
//! Drawing happens in the 250x122 landscape orientation the layouts are
//! designed in; `to_panel_buffer` converts to the panel's portrait RAM layout.

use crate::epd::{BUFFER_LEN, PANEL_HEIGHT, ROW_BYTES};

use core::convert::Infallible;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;

pub const WIDTH: usize = 250;
pub const HEIGHT: usize = 122;

/// `BinaryColor::On` is ink (black), `Off` is paper.
pub struct FrameBuffer {
    ink: Vec<bool>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// blank (all white) canvas
    pub fn new() -> Self {
        Self { ink: vec![false; WIDTH * HEIGHT] }
    }

    pub fn wipe(&mut self) {
        self.ink.fill(false);
    }

    #[cfg(test)]
    pub fn is_ink(&self, x: usize, y: usize) -> bool {
        x < WIDTH && y < HEIGHT && self.ink[y * WIDTH + x]
    }

    pub fn ink_count(&self) -> usize {
        self.ink.iter().filter(|&&on| on).count()
    }

    /// Pack into the panel's portrait buffer.
    ///
    /// The landscape image is turned 90 degrees counter-clockwise, so canvas
    /// `(x, y)` lands on panel column `y`, row `249 - x`. With `rotate_180`
    /// the canvas is first flipped for panels mounted upside down.
    pub fn to_panel_buffer(&self, rotate_180: bool) -> Vec<u8> {
        let mut buffer = vec![0xFF; BUFFER_LEN];
        for (index, &on) in self.ink.iter().enumerate() {
            if !on {
                continue;
            }
            let (mut x, mut y) = (index % WIDTH, index / WIDTH);
            if rotate_180 {
                x = WIDTH - 1 - x;
                y = HEIGHT - 1 - y;
            }
            let column = y;
            let row = PANEL_HEIGHT - 1 - x;
            buffer[row * ROW_BYTES + column / 8] &= !(0x80 >> (column % 8));
        }
        buffer
    }
}

impl OriginDimensions for FrameBuffer {
    fn size(&self) -> Size {
        Size::new(WIDTH as u32, HEIGHT as u32)
    }
}

impl DrawTarget for FrameBuffer {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(coord, color) in pixels {
            let (x, y) = (coord.x, coord.y);
            if x >= 0 && y >= 0 && (x as usize) < WIDTH && (y as usize) < HEIGHT {
                self.ink[y as usize * WIDTH + x as usize] = color.is_on();
            }
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.ink.fill(color.is_on());
        Ok(())
    }
}
