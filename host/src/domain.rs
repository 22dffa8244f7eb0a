use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// sensor key -> last known value (`None` until the first message arrives)
pub type Readings = BTreeMap<String, Option<f64>>;

/// the last known value of one tracked sensor key
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorReading {
    /// internal key, e.g. "interior" or "exterior"
    pub key: String,
    /// degrees celsius, absent until the first message for the key
    pub value: Option<f64>,
    /// when the value last changed by at least the debounce threshold
    pub changed_at: Option<DateTime<Local>>,
}

impl SensorReading {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: None, changed_at: None }
    }
}

/// a decimal-degree position used for the forecast query
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// one forecast result
///
/// immutable once built; a newer successful fetch replaces it wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    /// met.no symbol code, e.g. "partlycloudy_day" ("unknown" when absent)
    pub condition: String,
    /// millimetres over the summary window, never negative
    pub precipitation: f64,
    pub temperature_now: f64,
    pub temperature_max: f64,
    pub temperature_min: f64,
    /// metres per second, never negative
    pub wind_speed: f64,
    /// degrees the wind blows from, in [0, 360)
    pub wind_direction: f64,
    pub fetched_at: DateTime<Local>,
    pub success: bool,
}

impl ForecastSnapshot {
    pub const UNKNOWN_CONDITION: &'static str = "unknown";

    /// the placeholder shown before any forecast has been fetched
    pub fn empty(fetched_at: DateTime<Local>) -> Self {
        Self {
            condition: Self::UNKNOWN_CONDITION.to_string(),
            precipitation: 0.0,
            temperature_now: 0.0,
            temperature_max: 0.0,
            temperature_min: 0.0,
            wind_speed: 0.0,
            wind_direction: 0.0,
            fetched_at,
            success: false,
        }
    }
}

/// everything one render needs
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub interior: Option<f64>,
    pub exterior: Option<f64>,
    pub forecast: ForecastSnapshot,
}

/// the orchestrator's working set, shared between its two activities
#[derive(Clone, Debug, Default, Serialize)]
pub struct DashboardState {
    pub readings: Readings,
    pub forecast: Option<ForecastSnapshot>,
    pub coordinates: Option<Coordinates>,
    /// wall-clock time of the last successful forecast fetch
    pub last_forecast_at: Option<DateTime<Local>>,
    /// wall-clock time of the last frame the panel accepted
    pub last_render_at: Option<DateTime<Local>>,
}

impl DashboardState {
    pub fn reading(&self, key: &str) -> Option<f64> {
        self.readings.get(key).copied().flatten()
    }
}
