//! Maps the eight logical relay ports onto physical GPIO lines and
//! owns the active-low convention. Everything above this module
//! thinks in terms of "port N on/off"; everything below thinks in
//! electrical levels.

use pipool_api::{
    hal::{Gpio, Level},
    Error, Result,
};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

// The wiring table of the relay board. Only a subset of the ports
// has a device attached, but all eight lines are configured as
// outputs and parked high (inactive) so an unconnected relay can
// never chatter.

const PINS: [(u8, u8); 8] = [
    (1, 4),
    (2, 17),
    (3, 27),
    (4, 22),
    (5, 18),
    (6, 23),
    (7, 24),
    (8, 25),
];

/// The 8-channel relay board. `port_on` closes a relay by driving
/// its GPIO line low; `port_off` opens it by driving high. A
/// process-wide inhibit flag (the `NO_DEVICES` environment variable,
/// meant for bench operation) turns both into no-ops.

pub struct RelayBoard {
    gpio: Mutex<Box<dyn Gpio>>,
    inhibit: bool,
}

impl RelayBoard {
    /// Configures every wired GPIO line as an output driven high.
    pub fn new(mut gpio: Box<dyn Gpio>, inhibit: bool) -> Result<RelayBoard> {
        for &(_, pin) in &PINS {
            gpio.setup_output(pin)?;
        }

        if inhibit {
            warn!("relay switching inhibited -- ports track intent only");
        }

        Ok(RelayBoard {
            gpio: Mutex::new(gpio),
            inhibit,
        })
    }

    fn gpio_from_port(port: u8) -> Result<u8> {
        PINS.iter()
            .find(|&&(p, _)| p == port)
            .map(|&(_, pin)| pin)
            .ok_or(Error::BadRelayPort(port))
    }

    fn write(&self, port: u8, level: Level) -> Result<()> {
        let pin = Self::gpio_from_port(port)?;

        if self.inhibit {
            return Ok(());
        }

        self.gpio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(pin, level)
    }

    /// Energizes the device on `port`.
    pub fn port_on(&self, port: u8) -> Result<()> {
        self.write(port, Level::Low)
    }

    /// Deenergizes the device on `port`.
    pub fn port_off(&self, port: u8) -> Result<()> {
        self.write(port, Level::High)
    }

    /// Restores every output to inactive and releases the GPIO
    /// subsystem. Called exactly once during shutdown.
    pub fn cleanup(&self) {
        info!("restoring relay outputs to inactive");
        self.gpio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cleanup()
    }
}
