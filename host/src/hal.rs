//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer for the e-ink panel
//! ==============================================================================
//!
//! purpose:
//!     provides the four-wire bus the panel driver talks through (SPI data +
//!     DC/RST/BUSY/PWR GPIOs). abstracts away the difference between running on
//!     a real Raspberry Pi (using `rppal`) and a development machine (mock).
//!
//! build modes:
//!     - default: MockHal, logs every bus operation so driver sequences can be
//!       asserted in tests and the dashboard runs on a laptop.
//!     - feature="hardware": RpiHal, rppal SPI0 + GPIO, BUSY wait bounded.
//!
//! relationships:
//!     - used by: epd.rs (command sequences), renderer.rs (bring-up)
//!     - uses: rppal (on feature="hardware")
//!     - reads: config.rs (DisplayConfig: pins, spi clock)
//!
//! ==============================================================================

use crate::config::DisplayConfig;

use anyhow::Result;
use std::sync::{Arc, Mutex};

pub trait EpdHardware: Send {
    /// pulse RST
    fn reset(&mut self) -> Result<()>;
    /// DC low + one byte
    fn send_command(&mut self, command: u8) -> Result<()>;
    /// DC high + payload
    fn send_data(&mut self, data: &[u8]) -> Result<()>;
    /// block until BUSY drops (bounded)
    fn wait_until_idle(&mut self) -> Result<()>;
    fn delay_ms(&mut self, ms: u64);
    /// cut panel power and release the pins
    fn power_off(&mut self) -> Result<()>;
}

/// one recorded bus operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Reset,
    Command(u8),
    Data(Vec<u8>),
    WaitIdle,
    PowerOff,
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================

/// records bus traffic instead of driving pins; clones share one log
#[derive(Clone, Default)]
pub struct MockHal {
    log: Arc<Mutex<Vec<BusOp>>>,
}

impl MockHal {
    pub fn new() -> Self {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Self::default()
    }

    #[cfg(test)]
    pub fn ops(&self) -> Vec<BusOp> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, op: BusOp) {
        if let Ok(mut log) = self.log.lock() {
            log.push(op);
        }
    }
}

impl EpdHardware for MockHal {
    fn reset(&mut self) -> Result<()> {
        tracing::trace!("[MOCK EPD] reset");
        self.record(BusOp::Reset);
        Ok(())
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        tracing::trace!("[MOCK EPD] command 0x{:02X}", command);
        self.record(BusOp::Command(command));
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        tracing::trace!("[MOCK EPD] data ({} bytes)", data.len());
        self.record(BusOp::Data(data.to_vec()));
        Ok(())
    }

    fn wait_until_idle(&mut self) -> Result<()> {
        self.record(BusOp::WaitIdle);
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u64) {}

    fn power_off(&mut self) -> Result<()> {
        tracing::debug!("[MOCK EPD] power off");
        self.record(BusOp::PowerOff);
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub use rpi::RpiHal;

#[cfg(feature = "hardware")]
mod rpi {
    use super::EpdHardware;
    use crate::config::DisplayConfig;

    use anyhow::{bail, Result};
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
    use std::time::{Duration, Instant};

    /// the panel's BUSY line stays high for ~2s on a full refresh
    const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
    /// spidev's default bufsiz is 4096
    const SPI_CHUNK: usize = 4096;

    pub struct RpiHal {
        spi: Spi,
        rst: OutputPin,
        dc: OutputPin,
        pwr: OutputPin,
        busy: InputPin,
    }

    impl RpiHal {
        pub fn open(config: &DisplayConfig) -> Result<Self> {
            tracing::info!("Using REAL HARDWARE HAL (rppal)");
            let gpio = Gpio::new()?;
            let pins = config.pins;
            let rst = gpio.get(pins.rst)?.into_output();
            let dc = gpio.get(pins.dc)?.into_output();
            let mut pwr = gpio.get(pins.pwr)?.into_output();
            let busy = gpio.get(pins.busy)?.into_input();
            pwr.set_high();

            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, config.spi_hz, Mode::Mode0)?;
            Ok(Self { spi, rst, dc, pwr, busy })
        }
    }

    impl EpdHardware for RpiHal {
        fn reset(&mut self) -> Result<()> {
            self.rst.set_high();
            self.delay_ms(20);
            self.rst.set_low();
            self.delay_ms(2);
            self.rst.set_high();
            self.delay_ms(20);
            Ok(())
        }

        fn send_command(&mut self, command: u8) -> Result<()> {
            self.dc.set_low();
            self.spi.write(&[command])?;
            Ok(())
        }

        fn send_data(&mut self, data: &[u8]) -> Result<()> {
            self.dc.set_high();
            for chunk in data.chunks(SPI_CHUNK) {
                self.spi.write(chunk)?;
            }
            Ok(())
        }

        fn wait_until_idle(&mut self) -> Result<()> {
            let started = Instant::now();
            while self.busy.is_high() {
                if started.elapsed() > BUSY_TIMEOUT {
                    bail!("e-paper BUSY stuck high for {:?}", BUSY_TIMEOUT);
                }
                self.delay_ms(10);
            }
            Ok(())
        }

        fn delay_ms(&mut self, ms: u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }

        fn power_off(&mut self) -> Result<()> {
            self.rst.set_low();
            self.dc.set_low();
            self.pwr.set_low();
            Ok(())
        }
    }
}

/// open the panel bus for this build
#[cfg(feature = "hardware")]
pub fn open(config: &DisplayConfig) -> Result<Box<dyn EpdHardware>> {
    Ok(Box::new(RpiHal::open(config)?))
}

/// open the panel bus for this build
#[cfg(not(feature = "hardware"))]
pub fn open(config: &DisplayConfig) -> Result<Box<dyn EpdHardware>> {
    let pins = config.pins;
    tracing::info!(
        spi_hz = config.spi_hz,
        rst = pins.rst,
        dc = pins.dc,
        busy = pins.busy,
        pwr = pins.pwr,
        "[MOCK] panel bus would use these pins"
    );
    Ok(Box::new(MockHal::new()))
}
