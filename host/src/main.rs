//! ==============================================================================
//! main.rs - dietpink e-ink host entry point
//! ==============================================================================
//!
//! purpose:
//!     drives a 2.13" e-ink panel on a Raspberry Pi as a weather dashboard:
//!     room temperatures arrive over MQTT, the forecast comes from met.no.
//!
//! run modes (first argument):
//!     weather      (default) long-running dashboard until SIGINT/SIGTERM
//!     system-info  one-shot host statistics screen
//!     clear        wipe the panel white and put it to sleep
//!
//! relationships:
//!     - uses: orchestrator.rs (dashboard lifecycle)
//!     - uses: sensor_feed.rs, forecast.rs, geolocation.rs (collaborators)
//!     - uses: renderer.rs (panel bring-up), system_info.rs (one-shot screen)
//!     - reads: config.rs (dietpink.toml)
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                     rust host (this file)                     │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//!     │  │ sensor task  │  │ forecast loop│  │ status api (opt.)   │  │
//!     │  │ (mqtt push)  │  │ (10 min poll)│  │ GET /api            │  │
//!     │  └──────┬───────┘  └──────┬───────┘  └──────────┬──────────┘  │
//!     │         └─────────────────┼─────────────────────┘             │
//!     │                    ┌──────┴───────┐                           │
//!     │                    │ orchestrator │ <- orchestrator.rs        │
//!     │                    └──────┬───────┘                           │
//!     └───────────────────────────┼──────────────────────────────────┘
//!                                 │ one render at a time
//!                          ┌──────┴──────┐
//!                          │ e-ink panel │
//!                          └─────────────┘
//!
//! ==============================================================================

mod canvas;
mod config;
mod domain;
mod epd;
mod forecast;
mod geolocation;
mod hal;
mod orchestrator;
mod renderer;
mod sensor_feed;
mod system_info;
mod weather_ui;

use anyhow::{anyhow, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tower_http::cors::CorsLayer;

use config::{DisplayConfig, HostConfig};
use forecast::ForecastProvider;
use geolocation::HomeAssistantLocator;
use orchestrator::{Collaborators, Orchestrator, StatusReport};
use renderer::{EinkRenderer, Renderer};
use sensor_feed::SensorFeed;
use system_info::SystemStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Weather,
    SystemInfo,
    Clear,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "weather" => Ok(Self::Weather),
            "system-info" | "sysinfo" => Ok(Self::SystemInfo),
            "clear" => Ok(Self::Clear),
            other => Err(anyhow!("unknown mode '{}' (expected weather, system-info or clear)", other)),
        }
    }
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  dietpink e-ink host");
    println!("  MQTT temperatures + met.no forecast on a 2.13\" panel");
    println!("===========================================================");

    let mode = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => RunMode::Weather,
    };

    // step 1: load configuration
    let config = HostConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the configured level)
    init_tracing(&config.logging.level);

    match mode {
        RunMode::Weather => run_dashboard(config).await,
        RunMode::SystemInfo => run_system_info(config.display).await,
        RunMode::Clear => run_clear(config.display).await,
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// panel bring-up blocks on BUSY, so it runs on the blocking pool
async fn open_renderer(display: DisplayConfig) -> Result<EinkRenderer> {
    tokio::task::spawn_blocking(move || renderer::open(&display)).await?
}

// ==============================================================================
// run modes
// ==============================================================================

async fn run_dashboard(config: HostConfig) -> Result<()> {
    println!("\n[STARTUP] Bringing up e-ink panel...");
    let panel = open_renderer(config.display.clone()).await?;
    println!("[STARTUP] ✓ Panel ready");

    let parts = Collaborators {
        feed: Arc::new(SensorFeed::new(&config.mqtt)),
        forecast: Arc::new(ForecastProvider::new(&config.forecast)?),
        geolocator: Arc::new(HomeAssistantLocator::new(&config.geolocation)?),
        renderer: Box::new(panel),
    };
    let orchestrator = Orchestrator::new(&config, parts);

    if config.status.enabled {
        let bind = config.status.bind.clone();
        let status = orchestrator.clone();
        tokio::spawn(async move {
            println!("[STARTUP] ✓ Status API at http://{}/api", bind);
            if let Err(e) = run_server(&bind, status).await {
                eprintln!("[ERROR] Status server error: {}", e);
            }
        });
    }

    // registered before setup; a stop during start-up also shuts down
    let mut stop = StopSignal::install()?;

    println!("[STARTUP] Running dashboard setup...");
    tokio::select! {
        result = orchestrator.setup() => {
            if let Err(e) = result {
                eprintln!("[ERROR] Fatal: dashboard setup failed: {}", e);
                orchestrator.shutdown().await;
                return Err(e.into());
            }
        }
        received = stop.wait() => {
            received?;
            println!("\n[SHUTDOWN] Stop signal received during setup");
            orchestrator.shutdown().await;
            println!("[SHUTDOWN] ✓ Clean exit");
            return Ok(());
        }
    }

    println!("\n[RUNTIME] Dashboard running - Ctrl+C to stop");
    println!("────────────────────────────────────────────────────────────");
    stop.wait().await?;

    println!("\n[SHUTDOWN] Stop signal received");
    orchestrator.shutdown().await;
    println!("[SHUTDOWN] ✓ Clean exit");
    Ok(())
}

async fn run_system_info(display: DisplayConfig) -> Result<()> {
    let stats = tokio::task::spawn_blocking(SystemStats::collect).await?;
    for line in stats.lines() {
        println!("[SYSINFO] {}", line);
    }

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut panel = renderer::open(&display)?;
        panel.present(|canvas| system_info::draw(canvas, &stats))?;
        panel.sleep()?;
        Ok(())
    })
    .await??;

    println!("[SYSINFO] ✓ Screen shown");
    Ok(())
}

async fn run_clear(display: DisplayConfig) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut panel = renderer::open(&display)?;
        panel.clear()?;
        panel.sleep()?;
        Ok(())
    })
    .await??;

    println!("[CLEAR] ✓ Panel wiped");
    Ok(())
}

/// SIGINT (Ctrl+C) or SIGTERM (systemd stop), registered once up front
struct StopSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl StopSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn wait(&mut self) -> Result<()> {
        tokio::select! {
            received = self.interrupt.recv() => received,
            received = self.terminate.recv() => received,
        }
        .map(|_| ())
        .ok_or_else(|| anyhow!("signal stream closed"))
    }
}

// ==============================================================================
// status server
// ==============================================================================

async fn run_server(bind: &str, orchestrator: Orchestrator) -> Result<()> {
    let app = Router::new()
        .route("/api", get(api_handler))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// json snapshot of lifecycle phase, readings and forecast
async fn api_handler(State(orchestrator): State<Orchestrator>) -> Json<StatusReport> {
    Json(orchestrator.status().await)
}
