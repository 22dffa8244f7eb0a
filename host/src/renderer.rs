//! ==============================================================================
//! renderer.rs - frame composition and refresh policy
//! ==============================================================================
//!
//! purpose:
//!     turns a `Frame` into pixels and pushes them to the panel, choosing
//!     between a full refresh (slow, no ghosting) and a partial one.
//!
//! relationships:
//!     - used by: orchestrator.rs (serialised behind one async mutex), main.rs
//!     - uses: weather_ui.rs (layout), canvas.rs (pixels), epd.rs (panel)
//!
//! calls block on the panel's BUSY line; async callers go through
//! `spawn_blocking`.
//!
//! ==============================================================================

use crate::canvas::FrameBuffer;
use crate::config::DisplayConfig;
use crate::domain::Frame;
use crate::epd::Epd2in13;
use crate::hal::{self, EpdHardware};
use crate::weather_ui;

use core::convert::Infallible;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("e-paper panel error: {0:#}")]
    Panel(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Full,
    Partial,
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Partial => f.write_str("partial"),
        }
    }
}

/// presentation surface the orchestrator drives
pub trait Renderer: Send {
    fn render(&mut self, frame: &Frame) -> Result<RefreshMode, RenderError>;
    fn clear(&mut self) -> Result<(), RenderError>;
    fn sleep(&mut self) -> Result<(), RenderError>;
}

/// Full refresh on the first frame and after a clear or wake-up, partial
/// otherwise. `full_every > 0` forces a full refresh after that many
/// partials to wash out ghosting.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    full_every: u32,
    partials: u32,
    needs_full: bool,
}

impl RefreshPolicy {
    pub fn new(full_every: u32) -> Self {
        Self { full_every, partials: 0, needs_full: true }
    }

    pub fn choose(&self) -> RefreshMode {
        let worn = self.full_every > 0 && self.partials >= self.full_every;
        if self.needs_full || worn {
            RefreshMode::Full
        } else {
            RefreshMode::Partial
        }
    }

    /// account for a refresh the panel completed
    pub fn record(&mut self, mode: RefreshMode) {
        match mode {
            RefreshMode::Full => {
                self.needs_full = false;
                self.partials = 0;
            }
            RefreshMode::Partial => self.partials += 1,
        }
    }

    pub fn invalidate(&mut self) {
        self.needs_full = true;
    }
}

pub struct EinkRenderer {
    epd: Epd2in13,
    canvas: FrameBuffer,
    policy: RefreshPolicy,
    rotate_180: bool,
    awake: bool,
}

impl EinkRenderer {
    pub fn new(hal: Box<dyn EpdHardware>, config: &DisplayConfig) -> Self {
        Self {
            epd: Epd2in13::new(hal),
            canvas: FrameBuffer::new(),
            policy: RefreshPolicy::new(config.full_refresh_every),
            rotate_180: config.rotate_180,
            awake: false,
        }
    }

    fn wake(&mut self) -> Result<(), RenderError> {
        if !self.awake {
            tracing::debug!("initialising e-paper panel");
            self.epd.init()?;
            self.awake = true;
            self.policy.invalidate();
        }
        Ok(())
    }

    /// draw onto a blank canvas and push it with the policy's refresh mode
    pub fn present<F>(&mut self, compose: F) -> Result<RefreshMode, RenderError>
    where
        F: FnOnce(&mut FrameBuffer) -> Result<(), Infallible>,
    {
        self.canvas.wipe();
        if let Err(never) = compose(&mut self.canvas) {
            match never {}
        }
        let buffer = self.canvas.to_panel_buffer(self.rotate_180);

        self.wake()?;
        let mode = self.policy.choose();
        match mode {
            RefreshMode::Full => self.epd.display_full(&buffer)?,
            RefreshMode::Partial => self.epd.display_partial(&buffer)?,
        }
        self.policy.record(mode);
        tracing::debug!(mode = %mode, ink = self.canvas.ink_count(), "frame pushed to panel");
        Ok(mode)
    }
}

impl Renderer for EinkRenderer {
    fn render(&mut self, frame: &Frame) -> Result<RefreshMode, RenderError> {
        self.present(|canvas| weather_ui::draw_dashboard(canvas, frame))
    }

    fn clear(&mut self) -> Result<(), RenderError> {
        self.wake()?;
        self.epd.clear()?;
        self.policy.invalidate();
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), RenderError> {
        if self.awake {
            self.epd.sleep()?;
            self.awake = false;
            tracing::info!("e-paper panel asleep");
        }
        Ok(())
    }
}

/// bring up the panel for this build (mock bus unless `hardware` is enabled)
pub fn open(config: &DisplayConfig) -> anyhow::Result<EinkRenderer> {
    let bus = hal::open(config)?;
    let mut renderer = EinkRenderer::new(bus, config);
    renderer.wake()?;
    Ok(renderer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ForecastSnapshot;
    use crate::epd::BUFFER_LEN;
    use crate::hal::{BusOp, MockHal};
    use chrono::Local;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn frame() -> Frame {
        Frame {
            interior: Some(21.0),
            exterior: None,
            forecast: ForecastSnapshot::empty(Local::now()),
        }
    }

    fn renderer(full_every: u32) -> (EinkRenderer, MockHal) {
        let hal = MockHal::new();
        let config = DisplayConfig { full_refresh_every: full_every, ..DisplayConfig::default() };
        (EinkRenderer::new(Box::new(hal.clone()), &config), hal)
    }

    fn count_command(hal: &MockHal, command: u8) -> usize {
        hal.ops().iter().filter(|op| **op == BusOp::Command(command)).count()
    }

    #[test]
    fn policy_full_first_then_partial() {
        let mut policy = RefreshPolicy::new(0);
        assert_eq!(policy.choose(), RefreshMode::Full);
        policy.record(RefreshMode::Full);
        for _ in 0..10 {
            assert_eq!(policy.choose(), RefreshMode::Partial);
            policy.record(RefreshMode::Partial);
        }
        policy.invalidate();
        assert_eq!(policy.choose(), RefreshMode::Full);
    }

    #[test]
    fn policy_forces_periodic_full_refresh() {
        let mut policy = RefreshPolicy::new(2);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let mode = policy.choose();
            policy.record(mode);
            seen.push(mode);
        }
        use RefreshMode::*;
        assert_eq!(seen, vec![Full, Partial, Partial, Full, Partial, Partial]);
    }

    #[test]
    fn first_render_initialises_and_refreshes_fully() {
        let (mut renderer, hal) = renderer(0);
        assert_eq!(renderer.render(&frame()).unwrap(), RefreshMode::Full);
        assert_eq!(count_command(&hal, 0x12), 1);
        assert_eq!(count_command(&hal, 0x26), 1);

        assert_eq!(renderer.render(&frame()).unwrap(), RefreshMode::Partial);
        assert_eq!(count_command(&hal, 0x12), 1);
    }

    #[test]
    fn clear_forces_the_next_frame_full() {
        let (mut renderer, hal) = renderer(0);
        renderer.render(&frame()).unwrap();
        renderer.clear().unwrap();
        assert!(hal.ops().contains(&BusOp::Data(vec![0xFF; BUFFER_LEN])));
        assert_eq!(renderer.render(&frame()).unwrap(), RefreshMode::Full);
    }

    #[test]
    fn sleep_then_render_wakes_the_panel() {
        let (mut renderer, hal) = renderer(0);
        renderer.render(&frame()).unwrap();
        renderer.sleep().unwrap();
        // second sleep is a no-op
        renderer.sleep().unwrap();
        assert_eq!(count_command(&hal, 0x10), 1);

        assert_eq!(renderer.render(&frame()).unwrap(), RefreshMode::Full);
        assert_eq!(count_command(&hal, 0x12), 2);
    }

    #[test]
    fn pushed_image_matches_the_canvas() {
        let (mut renderer, hal) = renderer(0);
        renderer.render(&frame()).unwrap();

        let mut expected = FrameBuffer::new();
        weather_ui::draw_dashboard(&mut expected, &frame()).unwrap();
        let expected = expected.to_panel_buffer(DisplayConfig::default().rotate_180);
        assert!(hal.ops().contains(&BusOp::Data(expected)));
    }

    /// bus that starts failing on demand
    struct FlakyHal {
        inner: MockHal,
        broken: Arc<AtomicBool>,
    }

    impl EpdHardware for FlakyHal {
        fn reset(&mut self) -> anyhow::Result<()> {
            self.inner.reset()
        }
        fn send_command(&mut self, command: u8) -> anyhow::Result<()> {
            self.inner.send_command(command)
        }
        fn send_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("spi write failed");
            }
            self.inner.send_data(data)
        }
        fn wait_until_idle(&mut self) -> anyhow::Result<()> {
            self.inner.wait_until_idle()
        }
        fn delay_ms(&mut self, _ms: u64) {}
        fn power_off(&mut self) -> anyhow::Result<()> {
            self.inner.power_off()
        }
    }

    #[test]
    fn failed_full_refresh_is_retried_as_full() {
        let broken = Arc::new(AtomicBool::new(false));
        let hal = FlakyHal { inner: MockHal::new(), broken: broken.clone() };
        let mut renderer = EinkRenderer::new(Box::new(hal), &DisplayConfig::default());
        renderer.wake().unwrap();

        broken.store(true, Ordering::SeqCst);
        let err = renderer.render(&frame()).unwrap_err();
        assert!(err.to_string().contains("spi write failed"));

        broken.store(false, Ordering::SeqCst);
        assert_eq!(renderer.render(&frame()).unwrap(), RefreshMode::Full);
    }
}
