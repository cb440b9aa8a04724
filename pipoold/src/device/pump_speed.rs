//! Speed selection for a multi-speed pump. Four relay ports map to
//! the pump's S1..S4 speed-select inputs; exactly one may be closed
//! at a time, so selecting a speed first releases all four. Wired to
//! relay ports in the configuration but not yet driven by any broker
//! topic.

#![allow(dead_code)]

use std::sync::Arc;
use tracing::{error, info};

use crate::relay::RelayBoard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpSpeed {
    S1,
    S2,
    S3,
    S4,
}

impl PumpSpeed {
    pub fn label(self) -> &'static str {
        match self {
            PumpSpeed::S1 => "S1",
            PumpSpeed::S2 => "S2",
            PumpSpeed::S3 => "S3",
            PumpSpeed::S4 => "S4",
        }
    }
}

pub struct PumpSpeedControl {
    relay: Arc<RelayBoard>,
    ports: [(PumpSpeed, u8); 4],
}

impl PumpSpeedControl {
    pub fn new(
        relay: Arc<RelayBoard>,
        s1: u8,
        s2: u8,
        s3: u8,
        s4: u8,
    ) -> PumpSpeedControl {
        PumpSpeedControl {
            relay,
            ports: [
                (PumpSpeed::S1, s1),
                (PumpSpeed::S2, s2),
                (PumpSpeed::S3, s3),
                (PumpSpeed::S4, s4),
            ],
        }
    }

    /// Releases every speed-select relay.
    pub fn clear_speeds(&self) {
        for &(_, port) in &self.ports {
            if let Err(e) = self.relay.port_off(port) {
                error!("speed relay write failed -- {}", e)
            }
        }
    }

    /// Selects `speed`, releasing the others first so two inputs are
    /// never closed together.
    pub fn set_speed(&self, speed: PumpSpeed) {
        self.clear_speeds();
        info!("pump speed set to {}", speed.label());

        let &(_, port) = self
            .ports
            .iter()
            .find(|(s, _)| *s == speed)
            .expect("every speed has a port");

        if let Err(e) = self.relay.port_on(port) {
            error!("speed relay write failed -- {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedGpio;
    use pipool_api::hal::Level;

    // Speed ports 1-4 sit on BCM pins 4, 17, 27, 22.

    #[test]
    fn test_set_speed_is_exclusive() {
        let gpio = SimulatedGpio::new();
        let levels = gpio.levels();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let control = PumpSpeedControl::new(relay, 1, 2, 3, 4);

        control.set_speed(PumpSpeed::S2);
        assert_eq!(levels.get(17), Some(Level::Low));
        assert_eq!(levels.get(4), Some(Level::High));

        control.set_speed(PumpSpeed::S4);
        assert_eq!(levels.get(22), Some(Level::Low));
        assert_eq!(levels.get(17), Some(Level::High));
        assert_eq!(levels.get(4), Some(Level::High));
        assert_eq!(levels.get(27), Some(Level::High));
    }

    #[test]
    fn test_clear_speeds() {
        let gpio = SimulatedGpio::new();
        let levels = gpio.levels();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let control = PumpSpeedControl::new(relay, 1, 2, 3, 4);

        control.set_speed(PumpSpeed::S1);
        control.clear_speeds();
        assert_eq!(levels.get(4), Some(Level::High));
    }
}
