//! driver for the Waveshare 2.13" V4 e-paper panel (SSD1680 controller)
//!
//! the panel is 122x250 portrait; rows are 16 bytes wide, MSB first, and a
//! cleared bit is black. every call blocks on the BUSY line, so callers run
//! these off the async runtime.

use crate::hal::EpdHardware;

use anyhow::{bail, Result};

pub const PANEL_WIDTH: usize = 122;
pub const PANEL_HEIGHT: usize = 250;
pub const ROW_BYTES: usize = (PANEL_WIDTH + 7) / 8;
pub const BUFFER_LEN: usize = ROW_BYTES * PANEL_HEIGHT;

mod cmd {
    pub const DRIVER_OUTPUT: u8 = 0x01;
    pub const DEEP_SLEEP: u8 = 0x10;
    pub const DATA_ENTRY_MODE: u8 = 0x11;
    pub const SW_RESET: u8 = 0x12;
    pub const TEMP_SENSOR: u8 = 0x18;
    pub const MASTER_ACTIVATION: u8 = 0x20;
    pub const UPDATE_CONTROL_1: u8 = 0x21;
    pub const UPDATE_CONTROL_2: u8 = 0x22;
    pub const WRITE_BW_RAM: u8 = 0x24;
    pub const WRITE_BASE_RAM: u8 = 0x26;
    pub const BORDER_WAVEFORM: u8 = 0x3C;
    pub const RAM_X_WINDOW: u8 = 0x44;
    pub const RAM_Y_WINDOW: u8 = 0x45;
    pub const RAM_X_COUNTER: u8 = 0x4E;
    pub const RAM_Y_COUNTER: u8 = 0x4F;
}

/// full waveform (load LUT, refresh, power down analog)
const SEQUENCE_FULL: u8 = 0xF7;
/// partial waveform from the base image in RAM bank 2
const SEQUENCE_PARTIAL: u8 = 0xFF;

pub struct Epd2in13 {
    hal: Box<dyn EpdHardware>,
}

impl Epd2in13 {
    pub fn new(hal: Box<dyn EpdHardware>) -> Self {
        Self { hal }
    }

    /// hardware reset + controller setup for full refreshes
    pub fn init(&mut self) -> Result<()> {
        self.hal.reset()?;
        self.hal.wait_until_idle()?;
        self.hal.send_command(cmd::SW_RESET)?;
        self.hal.wait_until_idle()?;

        self.driver_output()?;
        self.command(cmd::DATA_ENTRY_MODE, &[0x03])?;
        self.set_window()?;
        self.set_cursor()?;

        self.command(cmd::BORDER_WAVEFORM, &[0x05])?;
        self.command(cmd::UPDATE_CONTROL_1, &[0x00, 0x80])?;
        // internal temperature sensor
        self.command(cmd::TEMP_SENSOR, &[0x80])?;
        self.hal.wait_until_idle()
    }

    /// full refresh; writes both RAM banks so a later partial has a base image
    pub fn display_full(&mut self, buffer: &[u8]) -> Result<()> {
        check_len(buffer)?;
        self.command(cmd::WRITE_BW_RAM, buffer)?;
        self.command(cmd::WRITE_BASE_RAM, buffer)?;
        self.activate(SEQUENCE_FULL)
    }

    pub fn display_partial(&mut self, buffer: &[u8]) -> Result<()> {
        check_len(buffer)?;
        self.hal.reset()?;

        self.command(cmd::BORDER_WAVEFORM, &[0x80])?;
        self.driver_output()?;
        self.command(cmd::DATA_ENTRY_MODE, &[0x03])?;
        self.set_window()?;
        self.set_cursor()?;

        self.command(cmd::WRITE_BW_RAM, buffer)?;
        self.activate(SEQUENCE_PARTIAL)
    }

    /// paint the whole panel white with a full refresh
    pub fn clear(&mut self) -> Result<()> {
        let white = vec![0xFF; BUFFER_LEN];
        self.display_full(&white)
    }

    /// deep sleep mode 1, then cut power; `init` is required before the next frame
    pub fn sleep(&mut self) -> Result<()> {
        self.command(cmd::DEEP_SLEEP, &[0x01])?;
        self.hal.delay_ms(100);
        self.hal.power_off()
    }

    fn command(&mut self, command: u8, data: &[u8]) -> Result<()> {
        self.hal.send_command(command)?;
        if !data.is_empty() {
            self.hal.send_data(data)?;
        }
        Ok(())
    }

    fn driver_output(&mut self) -> Result<()> {
        let last_gate = (PANEL_HEIGHT - 1) as u16;
        self.command(
            cmd::DRIVER_OUTPUT,
            &[(last_gate & 0xFF) as u8, (last_gate >> 8) as u8, 0x00],
        )
    }

    fn set_window(&mut self) -> Result<()> {
        let x_end = ((PANEL_WIDTH - 1) >> 3) as u8;
        let y_end = (PANEL_HEIGHT - 1) as u16;
        self.command(cmd::RAM_X_WINDOW, &[0x00, x_end])?;
        self.command(
            cmd::RAM_Y_WINDOW,
            &[0x00, 0x00, (y_end & 0xFF) as u8, (y_end >> 8) as u8],
        )
    }

    fn set_cursor(&mut self) -> Result<()> {
        self.command(cmd::RAM_X_COUNTER, &[0x00])?;
        self.command(cmd::RAM_Y_COUNTER, &[0x00, 0x00])
    }

    fn activate(&mut self, sequence: u8) -> Result<()> {
        self.command(cmd::UPDATE_CONTROL_2, &[sequence])?;
        self.hal.send_command(cmd::MASTER_ACTIVATION)?;
        self.hal.wait_until_idle()
    }
}

fn check_len(buffer: &[u8]) -> Result<()> {
    if buffer.len() != BUFFER_LEN {
        bail!("frame is {} bytes, panel expects {}", buffer.len(), BUFFER_LEN);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BusOp, MockHal};

    fn driver() -> (Epd2in13, MockHal) {
        let hal = MockHal::new();
        (Epd2in13::new(Box::new(hal.clone())), hal)
    }

    fn commands(hal: &MockHal) -> Vec<u8> {
        hal.ops()
            .into_iter()
            .filter_map(|op| match op {
                BusOp::Command(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffer_geometry() {
        assert_eq!(ROW_BYTES, 16);
        assert_eq!(BUFFER_LEN, 4000);
    }

    #[test]
    fn init_sequence() {
        let (mut epd, hal) = driver();
        epd.init().unwrap();

        let ops = hal.ops();
        assert_eq!(ops[0], BusOp::Reset);
        assert_eq!(
            commands(&hal),
            vec![0x12, 0x01, 0x11, 0x44, 0x45, 0x4E, 0x4F, 0x3C, 0x21, 0x18]
        );
        assert!(ops.contains(&BusOp::Data(vec![0xF9, 0x00, 0x00])));
        assert!(ops.contains(&BusOp::Data(vec![0x00, 0x00, 0xF9, 0x00])));
        assert_eq!(ops.last(), Some(&BusOp::WaitIdle));
    }

    #[test]
    fn full_refresh_writes_both_banks() {
        let (mut epd, hal) = driver();
        let frame = vec![0xAA; BUFFER_LEN];
        epd.display_full(&frame).unwrap();

        assert_eq!(commands(&hal), vec![0x24, 0x26, 0x22, 0x20]);
        let ops = hal.ops();
        assert_eq!(ops.iter().filter(|op| **op == BusOp::Data(frame.clone())).count(), 2);
        assert!(ops.contains(&BusOp::Data(vec![SEQUENCE_FULL])));
    }

    #[test]
    fn partial_refresh_only_writes_the_new_image() {
        let (mut epd, hal) = driver();
        epd.display_partial(&vec![0x00; BUFFER_LEN]).unwrap();

        let cmds = commands(&hal);
        assert!(cmds.contains(&0x24));
        assert!(!cmds.contains(&0x26));
        assert_eq!(hal.ops()[0], BusOp::Reset);
        assert!(hal.ops().contains(&BusOp::Data(vec![SEQUENCE_PARTIAL])));
    }

    #[test]
    fn clear_is_a_white_full_refresh() {
        let (mut epd, hal) = driver();
        epd.clear().unwrap();
        assert!(hal.ops().contains(&BusOp::Data(vec![0xFF; BUFFER_LEN])));
        assert_eq!(commands(&hal), vec![0x24, 0x26, 0x22, 0x20]);
    }

    #[test]
    fn sleep_powers_down() {
        let (mut epd, hal) = driver();
        epd.sleep().unwrap();
        assert_eq!(
            hal.ops(),
            vec![BusOp::Command(0x10), BusOp::Data(vec![0x01]), BusOp::PowerOff]
        );
    }

    #[test]
    fn wrong_sized_frame_is_rejected_before_touching_the_bus() {
        let (mut epd, hal) = driver();
        assert!(epd.display_full(&[0xFF; 10]).is_err());
        assert!(epd.display_partial(&[]).is_err());
        assert!(hal.ops().is_empty());
    }
}
