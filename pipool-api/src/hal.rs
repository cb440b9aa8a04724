//! The hardware abstraction seam. Each device class the controller
//! touches gets a small trait with exactly the capabilities the
//! control logic needs. Two families of implementations exist in the
//! daemon: one talking to the real Raspberry Pi peripherals and one
//! backed by the thermal simulation. The supervisor selects a family
//! at construction time and the rest of the system never knows the
//! difference.

use async_trait::async_trait;

use super::Result;

/// Selects which family of hardware implementations the daemon
/// builds at boot.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareMode {
    Real,
    Simulated,
}

impl HardwareMode {
    /// Parses the `hardwareMode` configuration value (or the
    /// `PIPOOL_HARDWARE_MODE` environment override.) Anything other
    /// than "real" selects the simulated backend, matching the
    /// fail-safe default of not driving relays on an unknown
    /// platform.
    pub fn from_str(s: &str) -> HardwareMode {
        if s.eq_ignore_ascii_case("real") {
            HardwareMode::Real
        } else {
            HardwareMode::Simulated
        }
    }
}

/// Electrical level of a GPIO output line. The relay board is
/// active-low: `Low` closes a relay and energizes the attached
/// device, `High` opens it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

/// Control over the GPIO output lines that drive the relay board.
///
/// This trait is synchronous on purpose: relay writes happen inside
/// actuator state gates and must not be suspension points.

pub trait Gpio: Send {
    /// Configures `pin` as an output and drives it `High` (relay
    /// open).
    fn setup_output(&mut self, pin: u8) -> Result<()>;

    /// Drives `pin` to `level`.
    fn write(&mut self, pin: u8, level: Level) -> Result<()>;

    /// Restores every configured output to `High` and releases the
    /// GPIO subsystem. Called exactly once during shutdown.
    fn cleanup(&mut self);
}

/// A single water or air temperature probe.

#[async_trait]
pub trait TemperatureProbe: Send + Sync {
    /// Returns the current temperature in degrees Celsius. An `Err`
    /// means the probe could not produce a trustworthy reading; the
    /// caller must treat it as invalid, not as stale-but-usable.
    async fn read(&self) -> Result<f64>;

    /// The configured sensor name.
    fn name(&self) -> &str;
}

/// The board's own CPU temperature source.

#[async_trait]
pub trait CpuMonitor: Send + Sync {
    async fn read_temperature(&self) -> Result<f64>;
}

/// Coarse host reachability. One call issues a burst of probes and
/// reports whether any of them succeeded.

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn ping(&self, target: &str, count: u32, interval_secs: u64)
        -> bool;
}

/// Loads the kernel modules the 1-Wire bus needs. A no-op under the
/// simulated backend.

#[async_trait]
pub trait SystemLoader: Send + Sync {
    async fn load_modules(&self, modules: &[&str]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(HardwareMode::from_str("real"), HardwareMode::Real);
        assert_eq!(HardwareMode::from_str("REAL"), HardwareMode::Real);
        assert_eq!(
            HardwareMode::from_str("simulated"),
            HardwareMode::Simulated
        );
        assert_eq!(HardwareMode::from_str("bogus"), HardwareMode::Simulated);
        assert_eq!(HardwareMode::from_str(""), HardwareMode::Simulated);
    }
}
