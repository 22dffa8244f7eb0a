//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `dietpink.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - MqttConfig: broker connection + topic -> sensor key mapping.
//!     - DashboardConfig: which keys are interior/exterior, grace and poll timing.
//!     - ForecastConfig: met.no endpoint, User-Agent, refresh interval.
//!     - GeolocationConfig: Home Assistant URL/token and fallback coordinates.
//!     - DisplayConfig: panel pins, SPI clock, rotation, refresh policy.
//!     - LoggingConfig / StatusConfig: log level and the optional status server.
//!
//! ==============================================================================

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config search path
pub const CONFIG_ENV: &str = "DIETPINK_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub geolocation: GeolocationConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// topic -> sensor key (e.g. "dietpink/balcony/temperature" = "exterior")
    pub topics: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub interior_key: String,
    pub exterior_key: String,
    pub sensor_grace_secs: u64,
    pub forecast_poll_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ForecastConfig {
    pub api_url: String,
    pub user_agent: String,
    pub update_interval_hours: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeolocationConfig {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
    pub fallback_latitude: f64,
    pub fallback_longitude: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    /// the weather layout is mounted upside down in the enclosure
    pub rotate_180: bool,
    /// force a full refresh after this many partial ones (0 = never)
    pub full_refresh_every: u32,
    pub spi_hz: u32,
    pub pins: PanelPins,
}

/// BCM pin numbers of the Waveshare HAT
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct PanelPins {
    pub rst: u8,
    pub dc: u8,
    pub busy: u8,
    pub pwr: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let mut topics = BTreeMap::new();
        topics.insert("dietpink/menjador/temperature".to_string(), "interior".to_string());
        topics.insert("dietpink/balco/temperature".to_string(), "exterior".to_string());
        Self {
            host: "192.168.0.48".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "dietpink_weather".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            topics,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            interior_key: "interior".to_string(),
            exterior_key: "exterior".to_string(),
            sensor_grace_secs: 5,
            forecast_poll_secs: 600,
            shutdown_timeout_secs: 20,
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.met.no/weatherapi/locationforecast/2.0/compact".to_string(),
            user_agent: "dietpink/1.0".to_string(),
            update_interval_hours: 3,
            timeout_secs: 15,
        }
    }
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            url: "http://homeassistant.local:8123".to_string(),
            token: String::new(),
            timeout_secs: 10,
            // Uppsala
            fallback_latitude: 59.8586,
            fallback_longitude: 17.6389,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            rotate_180: true,
            full_refresh_every: 0,
            spi_hz: 4_000_000,
            pins: PanelPins::default(),
        }
    }
}

impl Default for PanelPins {
    fn default() -> Self {
        Self { rst: 17, dc: 25, busy: 24, pwr: 18 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: false, bind: "0.0.0.0:3000".to_string() }
    }
}

impl DashboardConfig {
    pub fn sensor_grace(&self) -> Duration {
        Duration::from_secs(self.sensor_grace_secs)
    }

    pub fn forecast_poll(&self) -> Duration {
        Duration::from_secs(self.forecast_poll_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(content)
            .map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let hours = self.forecast.update_interval_hours;
        if !(1..=24).contains(&hours) {
            bail!("forecast.update_interval_hours must be within 1..=24 (got {})", hours);
        }
        if self.mqtt.topics.is_empty() {
            bail!("mqtt.topics must map at least one topic to a sensor key");
        }
        if self.dashboard.forecast_poll_secs == 0 {
            bail!("dashboard.forecast_poll_secs must be greater than zero");
        }
        let timeouts = [
            ("forecast.timeout_secs", self.forecast.timeout_secs),
            ("geolocation.timeout_secs", self.geolocation.timeout_secs),
            ("mqtt.connect_timeout_secs", self.mqtt.connect_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("dietpink.toml"));
        paths.push(PathBuf::from("..").join("config").join("dietpink.toml"));
        paths
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        for path in Self::candidate_paths() {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          DIETPINK CONFIGURATION         │");
        println!("├─────────────────────────────────────────┤");
        println!("│ MQTT: {}:{}", self.mqtt.host, self.mqtt.port);
        for (topic, key) in &self.mqtt.topics {
            println!("│   {} -> {}", topic, key);
        }
        println!("│ Forecast every: {}h (poll {}s)", self.forecast.update_interval_hours, self.dashboard.forecast_poll_secs);
        println!("│ Rotate 180: {}", self.display.rotate_180);
        println!("│ Log Level: {}", self.logging.level);
        println!("│ Status API: {}", if self.status.enabled { self.status.bind.as_str() } else { "off" });
        println!("└─────────────────────────────────────────┘");
    }
}
