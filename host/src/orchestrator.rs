//! ==============================================================================
//! orchestrator.rs - dashboard lifecycle, state and render scheduling
//! ==============================================================================
//!
//! purpose:
//!     owns the dashboard state and drives the panel from two producers:
//!     sensor changes pushed by the feed, and a calendar-aligned forecast
//!     refresh loop.
//!
//! lifecycle:
//!
//!     Uninitialized -> Initializing -> Running -> ShuttingDown -> Stopped
//!
//!     `new` enters Initializing; `setup` moves to Running (or reports a
//!     failure and stays put); `shutdown` drains everything and stops.
//!
//! concurrency:
//!
//!     ┌──────────────┐ listener ┌───────────────┐
//!     │ sensor feed  ├─────────>│ watch channel │──> sensor task ──┐
//!     └──────────────┘          └───────────────┘                  │
//!                                                                  ▼
//!     ┌──────────────┐  poll / shutdown                     ┌─────────────┐
//!     │ forecast loop├────────────────────────────────────->│ render lock │──> panel
//!     └──────────────┘                                      └─────────────┘
//!
//!     - state lives behind an async RwLock; guards never span a network
//!       call or a render.
//!     - renders run on the blocking pool while holding one async mutex, so
//!       frames reach the panel strictly one after another.
//!     - the watch channel coalesces bursts of sensor changes into the
//!       newest reading set.
//!
//! ==============================================================================

use crate::config::HostConfig;
use crate::domain::{Coordinates, DashboardState, ForecastSnapshot, Frame, Readings};
use crate::forecast::ForecastSource;
use crate::geolocation::Geolocator;
use crate::renderer::Renderer;
use crate::sensor_feed::SensorSource;

use chrono::Local;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("sensor feed failed to connect")]
    FeedConnect,
    #[error("setup called while {0:?}")]
    NotInitializing(Lifecycle),
    #[error("shutdown requested during setup")]
    ShuttingDown,
}

/// everything the orchestrator drives, constructed by the caller
pub struct Collaborators {
    pub feed: Arc<dyn SensorSource>,
    pub forecast: Arc<dyn ForecastSource>,
    pub geolocator: Arc<dyn Geolocator>,
    pub renderer: Box<dyn Renderer>,
}

/// read-only view served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lifecycle: Lifecycle,
    #[serde(flatten)]
    pub state: DashboardState,
}

struct Settings {
    interior_key: String,
    exterior_key: String,
    sensor_grace: Duration,
    forecast_poll: Duration,
    shutdown_timeout: Duration,
    fallback: Coordinates,
}

struct Inner {
    settings: Settings,
    feed: Arc<dyn SensorSource>,
    forecast: Arc<dyn ForecastSource>,
    geolocator: Arc<dyn Geolocator>,
    renderer: Arc<tokio::sync::Mutex<Box<dyn Renderer>>>,
    state: RwLock<DashboardState>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clone-able handle; every clone drives the same dashboard.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: &HostConfig, parts: Collaborators) -> Self {
        let dashboard = &config.dashboard;
        let settings = Settings {
            interior_key: dashboard.interior_key.clone(),
            exterior_key: dashboard.exterior_key.clone(),
            sensor_grace: dashboard.sensor_grace(),
            forecast_poll: dashboard.forecast_poll(),
            shutdown_timeout: dashboard.shutdown_timeout(),
            fallback: Coordinates::new(
                config.geolocation.fallback_latitude,
                config.geolocation.fallback_longitude,
            ),
        };
        let (shutdown, _) = watch::channel(false);

        let orchestrator = Self {
            inner: Arc::new(Inner {
                settings,
                feed: parts.feed,
                forecast: parts.forecast,
                geolocator: parts.geolocator,
                renderer: Arc::new(tokio::sync::Mutex::new(parts.renderer)),
                state: RwLock::new(DashboardState::default()),
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        orchestrator.set_lifecycle(Lifecycle::Initializing);
        orchestrator
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.inner.lifecycle)
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let mut current = lock(&self.inner.lifecycle);
        tracing::debug!(from = ?*current, to = ?next, "lifecycle transition");
        *current = next;
    }

    fn stopping(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// bail out of setup once shutdown has been requested
    fn ensure_not_stopping(&self) -> Result<(), SetupError> {
        if self.stopping() {
            tracing::info!("shutdown requested; setup abandoned");
            return Err(SetupError::ShuttingDown);
        }
        Ok(())
    }

    /// copy of the working set
    pub async fn state(&self) -> DashboardState {
        self.inner.state.read().await.clone()
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport { lifecycle: self.lifecycle(), state: self.state().await }
    }

    /// Resolve the location, fetch the first forecast, connect the feed,
    /// wait for initial readings, render once and start both activities.
    ///
    /// Every suspension point is followed by a shutdown check; a concurrent
    /// `shutdown` makes setup return `SetupError::ShuttingDown` without
    /// touching the panel or starting any task.
    pub async fn setup(&self) -> Result<(), SetupError> {
        let phase = self.lifecycle();
        if phase != Lifecycle::Initializing {
            return Err(SetupError::NotInitializing(phase));
        }
        let inner = &self.inner;

        let coordinates = match inner.geolocator.locate().await {
            Ok(found) => {
                tracing::info!(lat = found.latitude, lon = found.longitude, "device location resolved");
                found
            }
            Err(e) => {
                let fallback = inner.settings.fallback;
                tracing::warn!(
                    error = %e,
                    lat = fallback.latitude,
                    lon = fallback.longitude,
                    "geolocation failed, using fallback coordinates"
                );
                fallback
            }
        };
        self.ensure_not_stopping()?;
        inner.forecast.set_coordinates(coordinates);
        inner.state.write().await.coordinates = Some(coordinates);

        let first = inner.forecast.fetch_forecast().await;
        self.ensure_not_stopping()?;
        if first.success {
            self.merge_forecast(first).await;
        } else {
            tracing::warn!("initial forecast fetch failed; starting with placeholders");
        }

        let (tx, mut readings_rx) = watch::channel(inner.feed.readings());
        inner.feed.set_listener(Arc::new(move |readings: &Readings| -> anyhow::Result<()> {
            tx.send_replace(readings.clone());
            Ok(())
        }));

        if !inner.feed.connect().await {
            tracing::error!("sensor feed connection failed; setup aborted");
            return Err(SetupError::FeedConnect);
        }
        if self.stopping() {
            // shutdown may have disconnected before the connect landed
            inner.feed.disconnect().await;
            return Err(SetupError::ShuttingDown);
        }

        tracing::info!(grace = ?inner.settings.sensor_grace, "waiting for initial sensor readings");
        tokio::time::sleep(inner.settings.sensor_grace).await;
        self.ensure_not_stopping()?;
        let _ = readings_rx.borrow_and_update();
        self.merge_readings(inner.feed.readings()).await;
        self.render().await;

        // Initializing -> Running only; a shutdown that got in first wins
        let mut phase = lock(&inner.lifecycle);
        if *phase != Lifecycle::Initializing || self.stopping() {
            return Err(SetupError::ShuttingDown);
        }
        let sensor_task = tokio::spawn(self.clone().sensor_loop(readings_rx, inner.shutdown.subscribe()));
        let forecast_task = tokio::spawn(self.clone().forecast_loop(inner.shutdown.subscribe()));
        lock(&inner.tasks).extend([sensor_task, forecast_task]);
        tracing::debug!(from = ?*phase, to = ?Lifecycle::Running, "lifecycle transition");
        *phase = Lifecycle::Running;
        drop(phase);

        tracing::info!("dashboard running");
        Ok(())
    }

    async fn merge_readings(&self, readings: Readings) {
        self.inner.state.write().await.readings = readings;
    }

    async fn merge_forecast(&self, snapshot: ForecastSnapshot) {
        let mut state = self.inner.state.write().await;
        state.last_forecast_at = Some(snapshot.fetched_at);
        state.forecast = Some(snapshot);
    }

    async fn frame(&self) -> Frame {
        let settings = &self.inner.settings;
        let state = self.inner.state.read().await;
        let forecast = match &state.forecast {
            Some(snapshot) => snapshot.clone(),
            None => self.inner.forecast.cached_forecast(),
        };
        Frame {
            interior: state.reading(&settings.interior_key),
            exterior: state.reading(&settings.exterior_key),
            forecast,
        }
    }

    /// Render the latest state. Failures are logged with the frame that
    /// failed and reported as `false`; the caller keeps running.
    pub async fn render(&self) -> bool {
        let frame = self.frame().await;
        let mut renderer = self.inner.renderer.clone().lock_owned().await;
        if self.stopping() {
            // the panel may already be asleep
            tracing::debug!("render skipped during shutdown");
            return false;
        }

        let outcome = tokio::task::spawn_blocking(move || {
            let result = renderer.render(&frame);
            (result, frame)
        })
        .await;

        match outcome {
            Ok((Ok(mode), frame)) => {
                self.inner.state.write().await.last_render_at = Some(Local::now());
                tracing::info!(
                    mode = %mode,
                    interior = ?frame.interior,
                    exterior = ?frame.exterior,
                    condition = %frame.forecast.condition,
                    "dashboard rendered"
                );
                true
            }
            Ok((Err(e), frame)) => {
                tracing::error!(
                    error = %e,
                    interior = ?frame.interior,
                    exterior = ?frame.exterior,
                    condition = %frame.forecast.condition,
                    "render failed"
                );
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "render task aborted");
                false
            }
        }
    }

    async fn sensor_loop(self, mut readings: watch::Receiver<Readings>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = readings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = readings.borrow_and_update().clone();
                    tracing::debug!(readings = ?latest, "sensor change");
                    self.merge_readings(latest).await;
                    self.render().await;
                }
                stop = shutdown.changed() => {
                    if stop.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("sensor task stopped");
    }

    async fn forecast_loop(self, mut shutdown: watch::Receiver<bool>) {
        let poll = self.inner.settings.forecast_poll;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.inner.forecast.should_update(Local::now()) {
                let snapshot = self.inner.forecast.fetch_forecast().await;
                if snapshot.success {
                    tracing::info!(condition = %snapshot.condition, "forecast refreshed");
                    self.merge_forecast(snapshot).await;
                    self.render().await;
                } else {
                    tracing::warn!("forecast refresh failed; keeping previous forecast");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                stop = shutdown.changed() => {
                    if stop.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("forecast loop stopped");
    }

    /// Stop both activities, disconnect the feed and put the panel to sleep.
    /// A render or fetch already in flight completes first. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut phase = lock(&self.inner.lifecycle);
            if matches!(*phase, Lifecycle::ShuttingDown | Lifecycle::Stopped) {
                return;
            }
            *phase = Lifecycle::ShuttingDown;
        }
        tracing::info!("shutting down dashboard");

        self.inner.shutdown.send_replace(true);
        self.inner.feed.disconnect().await;

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        let limit = self.inner.settings.shutdown_timeout;
        let drain = async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(limit, drain).await.is_err() {
            tracing::warn!(timeout = ?limit, "background tasks did not stop in time");
        }

        let mut renderer = self.inner.renderer.clone().lock_owned().await;
        match tokio::task::spawn_blocking(move || renderer.sleep()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "panel sleep failed"),
            Err(e) => tracing::warn!(error = %e, "panel sleep task aborted"),
        }

        self.set_lifecycle(Lifecycle::Stopped);
        tracing::info!("dashboard stopped");
    }
}
