//! ==============================================================================
//! weather_ui.rs - split weather layout for the 250x122 canvas
//! ==============================================================================
//!
//! left half:  house outline with the interior temperature, exterior below it
//! right half: condition icon, then max/min/rain/wind lines and a wind arrow
//!
//! everything here is a pure drawing function over any 1-bit `DrawTarget`,
//! so layouts are tested against the in-memory canvas.
//!
//! ==============================================================================

use crate::domain::{ForecastSnapshot, Frame};

use embedded_graphics::mono_font::iso_8859_1::{FONT_10X20, FONT_6X10};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{
    Circle, Line, PrimitiveStyle, PrimitiveStyleBuilder, Rectangle, Triangle,
};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};

const INK: BinaryColor = BinaryColor::On;
const PAPER: BinaryColor = BinaryColor::Off;

const SPLIT_X: i32 = 125;
const CANVAS_H: i32 = 122;

// house
const HOUSE_X: i32 = 5;
const HOUSE_Y: i32 = 2;
const HOUSE_W: i32 = 110;
const HOUSE_H: i32 = 75;
const ROOF_H: i32 = 12;

// forecast column
const COLUMN_X: i32 = SPLIT_X + 8;
const ICON_CENTER: (i32, i32) = (187, 30);
const ICON_SIZE: i32 = 34;
const DATA_BLOCK_H: i32 = 52;

pub const PLACEHOLDER: &str = "---";

/// icon class derived from a met.no symbol code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherIcon {
    Sun,
    PartlyCloudy,
    Cloud,
    Sleet,
    Snow,
    Rain { heavy: bool },
    Fog,
    Unknown,
}

impl WeatherIcon {
    /// substring match; sleet and snow win over the generic "showers"
    pub fn from_symbol(code: &str) -> Self {
        if code.contains("clearsky") || code.contains("fair") {
            Self::Sun
        } else if code.contains("partlycloudy") {
            Self::PartlyCloudy
        } else if code.contains("cloudy") {
            Self::Cloud
        } else if code.contains("sleet") {
            Self::Sleet
        } else if code.contains("snow") {
            Self::Snow
        } else if code.contains("rain") || code.contains("shower") {
            Self::Rain { heavy: code.contains("heavy") }
        } else if code.contains("fog") {
            Self::Fog
        } else {
            Self::Unknown
        }
    }
}

pub fn temperature_label(value: Option<f64>) -> String {
    match value {
        Some(t) => format!("{:.0}\u{b0}C", t),
        None => PLACEHOLDER.to_string(),
    }
}

/// the four forecast lines, wind converted from m/s to km/h
pub fn data_lines(forecast: &ForecastSnapshot) -> [String; 4] {
    [
        format!("Max: {:.0}C", forecast.temperature_max),
        format!("Min: {:.0}C", forecast.temperature_min),
        format!("Rain: {:.1}mm", forecast.precipitation),
        format!("Wind: {:.0}km/h", forecast.wind_speed * 3.6),
    ]
}

/// compose the whole dashboard; the target is expected to be blank
pub fn draw_dashboard<D>(target: &mut D, frame: &Frame) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    Line::new(Point::new(SPLIT_X, 0), Point::new(SPLIT_X, CANVAS_H))
        .into_styled(PrimitiveStyle::with_stroke(INK, 2))
        .draw(target)?;

    draw_temperatures(target, frame.interior, frame.exterior)?;
    draw_forecast(target, &frame.forecast)
}

fn draw_temperatures<D>(target: &mut D, interior: Option<f64>, exterior: Option<f64>) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    Triangle::new(
        Point::new(HOUSE_X, HOUSE_Y + ROOF_H),
        Point::new(HOUSE_X + HOUSE_W / 2, HOUSE_Y),
        Point::new(HOUSE_X + HOUSE_W, HOUSE_Y + ROOF_H),
    )
    .into_styled(PrimitiveStyle::with_stroke(INK, 1))
    .draw(target)?;

    Rectangle::new(
        Point::new(HOUSE_X, HOUSE_Y + ROOF_H),
        Size::new((HOUSE_W + 1) as u32, (HOUSE_H - ROOF_H + 1) as u32),
    )
    .into_styled(PrimitiveStyle::with_stroke(INK, 2))
    .draw(target)?;

    let large = MonoTextStyle::new(&FONT_10X20, INK);
    let centered = TextStyleBuilder::new()
        .alignment(Alignment::Center)
        .baseline(Baseline::Middle)
        .build();
    let inside = Point::new(HOUSE_X + HOUSE_W / 2, HOUSE_Y + ROOF_H + (HOUSE_H - ROOF_H) / 2);
    Text::with_text_style(&temperature_label(interior), inside, large, centered).draw(target)?;

    let below = TextStyleBuilder::new()
        .alignment(Alignment::Center)
        .baseline(Baseline::Top)
        .build();
    let outside = Point::new(SPLIT_X / 2, HOUSE_Y + HOUSE_H + 5);
    Text::with_text_style(&temperature_label(exterior), outside, large, below).draw(target)?;
    Ok(())
}

fn draw_forecast<D>(target: &mut D, forecast: &ForecastSnapshot) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let (cx, cy) = ICON_CENTER;
    draw_icon(target, Point::new(cx, cy), ICON_SIZE, WeatherIcon::from_symbol(&forecast.condition))?;

    let small = MonoTextStyle::new(&FONT_6X10, INK);
    let lines = data_lines(forecast);
    let top = CANVAS_H - DATA_BLOCK_H - 2;
    let spacing = DATA_BLOCK_H / lines.len() as i32;
    for (i, line) in lines.iter().enumerate() {
        let y = top + i as i32 * spacing;
        Text::with_baseline(line, Point::new(COLUMN_X, y), small, Baseline::Top).draw(target)?;
    }

    let arrow = Point::new(COLUMN_X + 95, top + (lines.len() as i32 - 1) * spacing + 6);
    draw_wind_arrow(target, arrow, forecast.wind_direction)
}

/// filled triangle pointing along `degrees` (0 = north, 90 = east)
pub fn draw_wind_arrow<D>(target: &mut D, base: Point, degrees: f64) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    const LENGTH: f64 = 8.0;
    const HALF_BASE: f64 = 3.0;

    let angle = (degrees - 90.0).to_radians();
    let perp = angle + std::f64::consts::FRAC_PI_2;
    let tip = offset(base, LENGTH, angle);
    let left = offset(base, HALF_BASE, perp);
    let right = offset(base, -HALF_BASE, perp);

    Triangle::new(tip, left, right)
        .into_styled(PrimitiveStyle::with_fill(INK))
        .draw(target)
}

fn offset(origin: Point, distance: f64, angle: f64) -> Point {
    Point::new(
        origin.x + (distance * angle.cos()).round() as i32,
        origin.y + (distance * angle.sin()).round() as i32,
    )
}

fn segment<D>(target: &mut D, from: Point, to: Point, width: u32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    Line::new(from, to)
        .into_styled(PrimitiveStyle::with_stroke(INK, width))
        .draw(target)
}

pub fn draw_icon<D>(target: &mut D, center: Point, size: i32, icon: WeatherIcon) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    match icon {
        WeatherIcon::Sun => draw_sun(target, center, size),
        WeatherIcon::PartlyCloudy => draw_partly_cloudy(target, center, size),
        WeatherIcon::Cloud => draw_cloud(target, center, size),
        WeatherIcon::Rain { heavy } => draw_rain(target, center, size, heavy),
        WeatherIcon::Snow => draw_snow(target, center, size),
        WeatherIcon::Sleet => draw_sleet(target, center, size),
        WeatherIcon::Fog => draw_fog(target, center, size),
        WeatherIcon::Unknown => {
            let style = MonoTextStyle::new(&FONT_10X20, INK);
            let centered = TextStyleBuilder::new()
                .alignment(Alignment::Center)
                .baseline(Baseline::Middle)
                .build();
            Text::with_text_style("?", center, style, centered).draw(target)?;
            Ok(())
        }
    }
}

fn draw_sun<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let r = size / 2;
    Circle::with_center(center, (2 * r) as u32)
        .into_styled(PrimitiveStyle::with_fill(INK))
        .draw(target)?;

    let ray = f64::from(size / 3);
    let inner = f64::from(r + 2);
    for i in 0..8 {
        let angle = f64::from(i * 45).to_radians();
        segment(target, offset(center, inner, angle), offset(center, inner + ray, angle), 1)?;
    }
    Ok(())
}

/// three overlapping outlined circles over a flat base
fn draw_cloud<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let outlined = PrimitiveStyleBuilder::new()
        .stroke_color(INK)
        .stroke_width(2)
        .fill_color(PAPER)
        .build();
    let side = size / 3;
    let middle = size / 2;

    Circle::with_center(center + Point::new(-size / 2, side / 2), (2 * side) as u32)
        .into_styled(outlined)
        .draw(target)?;
    Circle::with_center(center, (2 * middle) as u32)
        .into_styled(outlined)
        .draw(target)?;
    Circle::with_center(center + Point::new(size / 2, side / 2), (2 * side) as u32)
        .into_styled(outlined)
        .draw(target)?;

    segment(
        target,
        center + Point::new(-size / 2, side),
        center + Point::new(size / 2, side),
        2,
    )
}

fn draw_partly_cloudy<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let sun = center + Point::new(-size / 3, -size / 3);
    let r = size / 4;
    Circle::with_center(sun, (2 * r) as u32)
        .into_styled(PrimitiveStyle::with_fill(INK))
        .draw(target)?;
    for step in [0, 1, 7] {
        let angle = f64::from(step * 45).to_radians();
        segment(target, offset(sun, f64::from(r), angle), offset(sun, f64::from(r + 4), angle), 1)?;
    }

    draw_cloud(target, center + Point::new(size / 6, size / 6), size * 2 / 3)
}

fn draw_rain<D>(target: &mut D, center: Point, size: i32, heavy: bool) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    draw_cloud(target, center - Point::new(0, size / 4), size)?;

    let top = center.y + size / 2;
    if heavy {
        for i in 0..5 {
            let x = center.x - size / 2 + i * (size / 4);
            segment(target, Point::new(x, top), Point::new(x, top + size / 3), 2)?;
        }
    } else {
        for i in 0..3 {
            let x = center.x - size / 3 + i * (size / 3);
            segment(target, Point::new(x, top), Point::new(x, top + size / 4), 1)?;
        }
    }
    Ok(())
}

fn draw_flake<D>(target: &mut D, at: Point, arm: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    segment(target, at + Point::new(-arm, -arm), at + Point::new(arm, arm), 1)?;
    segment(target, at + Point::new(-arm, arm), at + Point::new(arm, -arm), 1)?;
    segment(target, at + Point::new(0, -arm), at + Point::new(0, arm), 1)?;
    segment(target, at + Point::new(-arm, 0), at + Point::new(arm, 0), 1)
}

fn draw_snow<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    draw_cloud(target, center - Point::new(0, size / 4), size)?;
    let y = center.y + size / 2;
    for i in 0..3 {
        draw_flake(target, Point::new(center.x - size / 3 + i * (size / 3), y), 3)?;
    }
    Ok(())
}

/// alternating drops and small flakes
fn draw_sleet<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    draw_cloud(target, center - Point::new(0, size / 4), size)?;
    let top = center.y + size / 2;
    for i in 0..3 {
        let x = center.x - size / 3 + i * (size / 3);
        if i % 2 == 0 {
            segment(target, Point::new(x, top), Point::new(x, top + size / 4), 1)?;
        } else {
            draw_flake(target, Point::new(x, top + 2), 2)?;
        }
    }
    Ok(())
}

fn draw_fog<D>(target: &mut D, center: Point, size: i32) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    for i in 0..4 {
        let y = center.y - size / 3 + i * (size / 5);
        let inset = (i % 2) * (size / 6);
        segment(
            target,
            Point::new(center.x - size / 2 + inset, y),
            Point::new(center.x + size / 2 - inset, y),
            1,
        )?;
    }
    Ok(())
}
