//! one-shot host statistics screen (`dietpink-eink system-info`)

use chrono::{DateTime, Local};
use embedded_graphics::mono_font::iso_8859_1::{FONT_10X20, FONT_6X10};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Line, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use std::path::Path;
use sysinfo::{Disks, System};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub host_name: String,
    /// celsius, `None` where the thermal zone is not readable
    pub cpu_temp: Option<f64>,
    /// 1-minute load relative to the core count, capped at 100
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
    pub taken_at: DateTime<Local>,
}

impl SystemStats {
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        let cores = sys.cpus().len().max(1);

        let disks = Disks::new_with_refreshed_list();
        let (disk_used, disk_total) = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| (disk.total_space().saturating_sub(disk.available_space()), disk.total_space()))
            .unwrap_or((0, 0));

        Self {
            host_name: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            cpu_temp: cpu_temperature(),
            cpu_percent: load_percent(System::load_average().one, cores),
            memory_used: sys.used_memory(),
            memory_total: sys.total_memory(),
            disk_used,
            disk_total,
            uptime_secs: System::uptime(),
            taken_at: Local::now(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let temp = self
            .cpu_temp
            .map(|t| format!("{:.1}C", t))
            .unwrap_or_else(|| "N/A".to_string());
        let disk_share = if self.disk_total > 0 {
            self.disk_used as f64 / self.disk_total as f64 * 100.0
        } else {
            0.0
        };
        vec![
            format!("Host: {}", self.host_name),
            format!("Temp: {}", temp),
            format!("CPU:  {:.0}%", self.cpu_percent),
            format!("RAM:  {}/{}", human_bytes(self.memory_used), human_bytes(self.memory_total)),
            format!(
                "Disk: {}/{} ({:.0}%)",
                human_bytes(self.disk_used),
                human_bytes(self.disk_total),
                disk_share
            ),
            format!("Up:   {}", human_uptime(self.uptime_secs)),
        ]
    }
}

/// the SoC thermal zone reports millidegrees
fn cpu_temperature() -> Option<f64> {
    std::fs::read_to_string(THERMAL_ZONE)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(|milli| milli / 1000.0)
}

fn load_percent(load: f64, cores: usize) -> f64 {
    (load / cores as f64 * 100.0).clamp(0.0, 100.0)
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit >= 3 {
        format!("{:.1}{}", value, UNITS[unit])
    } else {
        format!("{:.0}{}", value, UNITS[unit])
    }
}

fn human_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let minutes = secs % 3_600 / 60;
    match (days, hours) {
        (0, 0) => format!("{}m", minutes),
        (0, _) => format!("{}h {}m", hours, minutes),
        _ => format!("{}d {}h", days, hours),
    }
}

/// black header band with title and clock, stats below, footer rule
pub fn draw<D>(target: &mut D, stats: &SystemStats) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    Rectangle::new(Point::zero(), Size::new(250, 28))
        .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
        .draw(target)?;

    let header = MonoTextStyle::new(&FONT_10X20, BinaryColor::Off);
    Text::with_baseline("System Info", Point::new(10, 4), header, Baseline::Top).draw(target)?;
    let clock = stats.taken_at.format("%H:%M").to_string();
    Text::with_baseline(&clock, Point::new(190, 4), header, Baseline::Top).draw(target)?;

    let body = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
    for (i, line) in stats.lines().iter().enumerate() {
        let y = 33 + i as i32 * 12;
        Text::with_baseline(line, Point::new(10, y), body, Baseline::Top).draw(target)?;
    }

    Line::new(Point::new(10, 108), Point::new(240, 108))
        .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
        .draw(target)?;
    let footer = TextStyleBuilder::new()
        .alignment(Alignment::Center)
        .baseline(Baseline::Top)
        .build();
    Text::with_text_style("dietpink", Point::new(125, 111), body, footer).draw(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::FrameBuffer;
    use chrono::TimeZone;

    fn sample() -> SystemStats {
        SystemStats {
            host_name: "dietpink".to_string(),
            cpu_temp: Some(47.3),
            cpu_percent: 12.0,
            memory_used: 180 * 1024 * 1024,
            memory_total: 427 * 1024 * 1024,
            disk_used: 3 * 1024 * 1024 * 1024,
            disk_total: 12 * 1024 * 1024 * 1024,
            uptime_secs: 3 * 86_400 + 4 * 3_600 + 59,
            taken_at: Local.with_ymd_and_hms(2025, 3, 14, 9, 5, 0).unwrap(),
        }
    }

    #[test]
    fn stat_lines() {
        assert_eq!(
            sample().lines(),
            vec![
                "Host: dietpink",
                "Temp: 47.3C",
                "CPU:  12%",
                "RAM:  180M/427M",
                "Disk: 3.0G/12.0G (25%)",
                "Up:   3d 4h",
            ]
        );
    }

    #[test]
    fn missing_readings_degrade() {
        let stats = SystemStats { cpu_temp: None, disk_used: 0, disk_total: 0, ..sample() };
        let lines = stats.lines();
        assert_eq!(lines[1], "Temp: N/A");
        assert_eq!(lines[4], "Disk: 0B/0B (0%)");
    }

    #[test]
    fn load_is_relative_to_cores_and_capped() {
        assert_eq!(load_percent(0.5, 1), 50.0);
        assert_eq!(load_percent(2.0, 4), 50.0);
        assert_eq!(load_percent(3.0, 1), 100.0);
    }

    #[test]
    fn byte_and_uptime_formatting() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2K");
        assert_eq!(human_bytes(1536 * 1024 * 1024), "1.5G");
        assert_eq!(human_uptime(59), "0m");
        assert_eq!(human_uptime(2 * 3_600 + 5 * 60), "2h 5m");
        assert_eq!(human_uptime(86_400), "1d 0h");
    }

    #[test]
    fn screen_has_inked_header() {
        let mut canvas = FrameBuffer::new();
        draw(&mut canvas, &sample()).unwrap();
        // band corners are ink, text inside it is paper
        assert!(canvas.is_ink(0, 0));
        assert!(canvas.is_ink(249, 27));
        assert!(canvas.ink_count() > 250 * 28 / 2);
    }

    #[test]
    fn collect_does_not_panic() {
        let stats = SystemStats::collect();
        assert!(stats.cpu_percent >= 0.0 && stats.cpu_percent <= 100.0);
        assert!(stats.memory_used <= stats.memory_total);
    }
}
