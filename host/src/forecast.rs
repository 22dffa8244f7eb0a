//! ==============================================================================
//! forecast.rs - met.no locationforecast client with a last-good cache
//! ==============================================================================
//!
//! purpose:
//!     pulls the compact forecast for the device location, reduces it to a
//!     ForecastSnapshot and keeps the last successful one around. decides when
//!     the next refresh is due (elapsed time + calendar-aligned hour).
//!
//! relationships:
//!     - used by: orchestrator.rs (through the ForecastSource trait)
//!     - uses: reqwest (bounded-timeout GET), serde (response decoding)
//!     - reads: config.rs (ForecastConfig)
//!
//! failure model:
//!     fetch_forecast never fails outward. any network, status or decode error
//!     yields the empty snapshot with success = false and leaves the cache and
//!     the last-success timestamp untouched.
//!
//! ==============================================================================

use crate::config::ForecastConfig;
use crate::domain::{Coordinates, ForecastSnapshot};

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike};
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// first 7 hourly points ~ the next 6 hours
const EXTREMES_WINDOW: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("coordinates have not been set")]
    MissingCoordinates,
    #[error("forecast request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forecast timeseries is empty")]
    EmptySeries,
    #[error("first forecast entry has no instant details")]
    MissingInstant,
}

/// what the orchestrator needs from a pull-based forecast source
#[async_trait]
pub trait ForecastSource: Send + Sync {
    fn set_coordinates(&self, coordinates: Coordinates);
    /// never fails; check `success` on the returned snapshot
    async fn fetch_forecast(&self) -> ForecastSnapshot;
    fn should_update(&self, now: DateTime<Local>) -> bool;
    /// last successful snapshot, or the empty one
    fn cached_forecast(&self) -> ForecastSnapshot;
}

// ==============================================================================
// response schema (only the parts the dashboard reads)
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct LocationForecast {
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    timeseries: Vec<TimeStep>,
}

#[derive(Debug, Deserialize)]
struct TimeStep {
    data: StepData,
}

#[derive(Debug, Deserialize)]
struct StepData {
    instant: Option<InstantBlock>,
    next_1_hours: Option<PeriodBlock>,
    next_6_hours: Option<PeriodBlock>,
}

#[derive(Debug, Deserialize)]
struct InstantBlock {
    #[serde(default)]
    details: InstantDetails,
}

#[derive(Debug, Default, Deserialize)]
struct InstantDetails {
    air_temperature: Option<f64>,
    wind_speed: Option<f64>,
    wind_from_direction: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PeriodBlock {
    summary: Summary,
    #[serde(default)]
    details: PeriodDetails,
}

#[derive(Debug, Deserialize)]
struct Summary {
    symbol_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct PeriodDetails {
    precipitation_amount: Option<f64>,
    air_temperature_max: Option<f64>,
    air_temperature_min: Option<f64>,
}

/// reduce a decoded response to a snapshot
pub fn parse_forecast(
    doc: &LocationForecast,
    fetched_at: DateTime<Local>,
) -> Result<ForecastSnapshot, ForecastError> {
    let series = &doc.properties.timeseries;
    let first = series.first().ok_or(ForecastError::EmptySeries)?;
    let instant = &first.data.instant.as_ref().ok_or(ForecastError::MissingInstant)?.details;

    let now = instant.air_temperature.unwrap_or(0.0);
    let mut snapshot = ForecastSnapshot {
        condition: ForecastSnapshot::UNKNOWN_CONDITION.to_string(),
        precipitation: 0.0,
        temperature_now: now,
        temperature_max: now,
        temperature_min: now,
        wind_speed: instant.wind_speed.unwrap_or(0.0).max(0.0),
        wind_direction: instant.wind_from_direction.unwrap_or(0.0).rem_euclid(360.0),
        fetched_at,
        success: true,
    };

    // prefer the 6 hour summary, fall back to the next hour
    if let Some(six) = &first.data.next_6_hours {
        snapshot.condition = six.summary.symbol_code.clone();
        snapshot.precipitation = six.details.precipitation_amount.unwrap_or(0.0);
        if let Some(max) = six.details.air_temperature_max {
            snapshot.temperature_max = max;
        }
        if let Some(min) = six.details.air_temperature_min {
            snapshot.temperature_min = min;
        }
    } else if let Some(one) = &first.data.next_1_hours {
        snapshot.condition = one.summary.symbol_code.clone();
        snapshot.precipitation = one.details.precipitation_amount.unwrap_or(0.0);
    }
    snapshot.precipitation = snapshot.precipitation.max(0.0);

    // scanned extremes win over the summary block whenever there are any
    let temps = series
        .iter()
        .take(EXTREMES_WINDOW)
        .filter_map(|step| step.data.instant.as_ref()?.details.air_temperature);
    let extremes = temps.fold(None, |acc: Option<(f64, f64)>, t| match acc {
        None => Some((t, t)),
        Some((max, min)) => Some((max.max(t), min.min(t))),
    });
    if let Some((max, min)) = extremes {
        snapshot.temperature_max = max;
        snapshot.temperature_min = min;
    }

    Ok(snapshot)
}

/// met.no refuses more than 4 decimals
fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// ==============================================================================
// provider
// ==============================================================================

#[derive(Default)]
struct ProviderState {
    coordinates: Option<Coordinates>,
    cached: Option<ForecastSnapshot>,
    last_success: Option<DateTime<Local>>,
}

pub struct ForecastProvider {
    client: reqwest::Client,
    api_url: String,
    interval_hours: u32,
    state: Mutex<ProviderState>,
}

impl ForecastProvider {
    pub fn new(config: &ForecastConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            interval_hours: config.update_interval_hours.max(1),
            state: Mutex::new(ProviderState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// cache a successful snapshot; its `fetched_at` becomes the last success
    pub fn record_success(&self, snapshot: ForecastSnapshot) {
        let mut state = self.state();
        state.last_success = Some(snapshot.fetched_at);
        state.cached = Some(snapshot);
    }

    async fn request(&self, coordinates: Coordinates) -> Result<ForecastSnapshot, ForecastError> {
        let doc: LocationForecast = self
            .client
            .get(&self.api_url)
            .query(&[
                ("lat", round4(coordinates.latitude)),
                ("lon", round4(coordinates.longitude)),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_forecast(&doc, Local::now())
    }
}

#[async_trait]
impl ForecastSource for ForecastProvider {
    fn set_coordinates(&self, coordinates: Coordinates) {
        self.state().coordinates = Some(coordinates);
    }

    async fn fetch_forecast(&self) -> ForecastSnapshot {
        let coordinates = self.state().coordinates;
        let result = match coordinates {
            Some(coordinates) => {
                tracing::info!(lat = coordinates.latitude, lon = coordinates.longitude, "fetching forecast");
                self.request(coordinates).await
            }
            None => Err(ForecastError::MissingCoordinates),
        };

        match result {
            Ok(snapshot) => {
                tracing::info!(
                    condition = %snapshot.condition,
                    precipitation = snapshot.precipitation,
                    max = snapshot.temperature_max,
                    min = snapshot.temperature_min,
                    "forecast updated"
                );
                self.record_success(snapshot.clone());
                snapshot
            }
            Err(e) => {
                tracing::warn!(error = %e, "forecast fetch failed");
                ForecastSnapshot::empty(Local::now())
            }
        }
    }

    fn should_update(&self, now: DateTime<Local>) -> bool {
        let Some(last) = self.state().last_success else {
            return true;
        };
        let due = now.signed_duration_since(last) >= chrono::Duration::hours(i64::from(self.interval_hours));
        // refreshes land on 00:00, 03:00, 06:00 ... for a 3 hour interval
        let aligned = now.hour() % self.interval_hours == 0;
        due && aligned
    }

    fn cached_forecast(&self) -> ForecastSnapshot {
        self.state()
            .cached
            .clone()
            .unwrap_or_else(|| ForecastSnapshot::empty(Local::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> LocationForecast {
        serde_json::from_value(value).unwrap()
    }

    fn step(temp: f64) -> serde_json::Value {
        json!({ "time": "2025-01-01T00:00:00Z", "data": { "instant": { "details": { "air_temperature": temp } } } })
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 14, hour, minute, 0).unwrap()
    }

    fn provider(url: &str) -> ForecastProvider {
        let config = ForecastConfig {
            api_url: url.to_string(),
            timeout_secs: 2,
            ..ForecastConfig::default()
        };
        ForecastProvider::new(&config).unwrap()
    }

    fn good_snapshot(fetched_at: DateTime<Local>) -> ForecastSnapshot {
        ForecastSnapshot {
            condition: "rain".into(),
            precipitation: 1.2,
            temperature_now: 9.0,
            temperature_max: 11.0,
            temperature_min: 7.0,
            wind_speed: 4.0,
            wind_direction: 270.0,
            fetched_at,
            success: true,
        }
    }

    #[test]
    fn six_hour_block_with_scanned_extremes() {
        let mut series = vec![json!({
            "time": "2025-01-01T00:00:00Z",
            "data": {
                "instant": { "details": { "air_temperature": 10.0, "wind_speed": 3.3, "wind_from_direction": 90.0 } },
                "next_6_hours": {
                    "summary": { "symbol_code": "partlycloudy_day" },
                    "details": { "precipitation_amount": 2.3 }
                }
            }
        })];
        for t in [12.0, 15.0, 8.0, 11.0, 9.0, 13.0] {
            series.push(step(t));
        }
        // beyond the 7-point window, must be ignored
        series.push(step(30.0));
        series.push(step(-5.0));

        let doc = decode(json!({ "properties": { "timeseries": series } }));
        let snapshot = parse_forecast(&doc, Local::now()).unwrap();

        assert!(snapshot.success);
        assert_eq!(snapshot.condition, "partlycloudy_day");
        assert_eq!(snapshot.precipitation, 2.3);
        assert_eq!(snapshot.temperature_max, 15.0);
        assert_eq!(snapshot.temperature_min, 8.0);
        assert_eq!(snapshot.temperature_now, 10.0);
        assert_eq!(snapshot.wind_speed, 3.3);
        assert_eq!(snapshot.wind_direction, 90.0);
    }

    #[test]
    fn falls_back_to_one_hour_block() {
        let doc = decode(json!({ "properties": { "timeseries": [{
            "data": {
                "instant": { "details": { "air_temperature": 4.0 } },
                "next_1_hours": {
                    "summary": { "symbol_code": "lightrain" },
                    "details": { "precipitation_amount": 0.4 }
                }
            }
        }] } }));
        let snapshot = parse_forecast(&doc, Local::now()).unwrap();
        assert_eq!(snapshot.condition, "lightrain");
        assert_eq!(snapshot.precipitation, 0.4);
        assert_eq!(snapshot.temperature_max, 4.0);
        assert_eq!(snapshot.temperature_min, 4.0);
    }

    #[test]
    fn summary_extremes_survive_when_nothing_to_scan() {
        let doc = decode(json!({ "properties": { "timeseries": [{
            "data": {
                "instant": { "details": { "wind_speed": 1.0 } },
                "next_6_hours": {
                    "summary": { "symbol_code": "snow" },
                    "details": { "air_temperature_max": 1.5, "air_temperature_min": -3.0 }
                }
            }
        }] } }));
        let snapshot = parse_forecast(&doc, Local::now()).unwrap();
        assert_eq!(snapshot.temperature_max, 1.5);
        assert_eq!(snapshot.temperature_min, -3.0);
        assert_eq!(snapshot.precipitation, 0.0);
    }

    #[test]
    fn no_summary_means_unknown_condition() {
        let doc = decode(json!({ "properties": { "timeseries": [step(2.0)] } }));
        let snapshot = parse_forecast(&doc, Local::now()).unwrap();
        assert_eq!(snapshot.condition, "unknown");
    }

    #[test]
    fn wind_direction_is_normalised() {
        let doc = decode(json!({ "properties": { "timeseries": [{
            "data": { "instant": { "details": { "wind_from_direction": 360.0, "wind_speed": -1.0 } } }
        }] } }));
        let snapshot = parse_forecast(&doc, Local::now()).unwrap();
        assert_eq!(snapshot.wind_direction, 0.0);
        assert_eq!(snapshot.wind_speed, 0.0);
    }

    #[test]
    fn malformed_series_is_an_error() {
        let empty = decode(json!({ "properties": { "timeseries": [] } }));
        assert!(matches!(parse_forecast(&empty, Local::now()), Err(ForecastError::EmptySeries)));

        let no_instant = decode(json!({ "properties": { "timeseries": [{ "data": {} }] } }));
        assert!(matches!(parse_forecast(&no_instant, Local::now()), Err(ForecastError::MissingInstant)));
    }

    #[test]
    fn rounds_query_coordinates() {
        assert_eq!(round4(59.858_612_3), 59.8586);
        assert_eq!(round4(17.638_96), 17.639);
    }

    #[test]
    fn due_before_first_success() {
        let provider = provider("http://127.0.0.1:9/");
        assert!(provider.should_update(at(7, 13)));
    }

    #[test]
    fn not_due_right_after_success() {
        let provider = provider("http://127.0.0.1:9/");
        provider.record_success(good_snapshot(at(3, 0)));
        assert!(!provider.should_update(at(3, 10)));
        // interval elapsed but 05:xx is not on the 3 hour grid
        assert!(!provider.should_update(at(5, 50)));
    }

    #[test]
    fn due_on_aligned_hour_after_interval() {
        let provider = provider("http://127.0.0.1:9/");
        provider.record_success(good_snapshot(at(3, 0)));
        assert!(provider.should_update(at(6, 0)));
        assert!(provider.should_update(at(6, 50)));
        assert!(!provider.should_update(at(7, 0)));
        assert!(provider.should_update(at(9, 10)));
    }

    #[test]
    fn aligned_hour_before_interval_is_not_due() {
        let provider = provider("http://127.0.0.1:9/");
        provider.record_success(good_snapshot(at(4, 30)));
        assert!(!provider.should_update(at(6, 10)));
    }

    #[test]
    fn cached_forecast_defaults_to_empty() {
        let provider = provider("http://127.0.0.1:9/");
        let cached = provider.cached_forecast();
        assert!(!cached.success);
        assert_eq!(cached.condition, "unknown");
    }

    #[tokio::test]
    async fn fetch_without_coordinates_returns_empty() {
        let provider = provider("http://127.0.0.1:9/");
        let snapshot = provider.fetch_forecast().await;
        assert!(!snapshot.success);
        assert!(provider.should_update(Local::now()));
    }

    #[tokio::test]
    async fn failed_fetches_keep_last_good_snapshot() {
        let provider = provider("http://127.0.0.1:9/");
        provider.set_coordinates(Coordinates::new(59.8586, 17.6389));
        let good = good_snapshot(at(3, 0));
        provider.record_success(good.clone());

        for _ in 0..3 {
            let snapshot = provider.fetch_forecast().await;
            assert!(!snapshot.success);
            assert_eq!(snapshot.condition, "unknown");
        }

        assert_eq!(provider.cached_forecast(), good);
        assert!(!provider.should_update(at(3, 20)));
    }
}
