//! Backend selection for the hardware abstraction layer. The
//! supervisor asks this module for one implementation per device
//! class; which family it gets depends on the configured hardware
//! mode.

use pipool_api::{
    hal::{
        CpuMonitor, Gpio, HardwareMode, NetworkMonitor, SystemLoader,
        TemperatureProbe,
    },
    Result,
};
use std::sync::Arc;

use crate::config;

pub mod real;
pub mod sim;

use sim::{ProbeRole, SimulationEnvironment};

/// Builds HAL implementations for the selected mode. In simulated
/// mode the factory carries the shared simulation environment that
/// every simulated probe reads from.

pub struct HardwareFactory {
    mode: HardwareMode,
    sim: Option<Arc<SimulationEnvironment>>,
}

impl HardwareFactory {
    pub fn new(
        mode: HardwareMode,
        sim: Option<Arc<SimulationEnvironment>>,
    ) -> HardwareFactory {
        HardwareFactory { mode, sim }
    }

    fn sim(&self) -> Arc<SimulationEnvironment> {
        // The supervisor creates the simulation environment before
        // the factory whenever the mode is simulated, so this can't
        // fail on any construction path.

        self.sim
            .clone()
            .expect("simulated mode requires a simulation environment")
    }

    pub fn create_gpio(&self) -> Result<Box<dyn Gpio>> {
        match self.mode {
            HardwareMode::Real => Ok(Box::new(real::RealGpio::new()?)),
            HardwareMode::Simulated => Ok(Box::new(sim::SimulatedGpio::new())),
        }
    }

    pub fn create_temperature_probe(
        &self,
        id: &config::SensorId,
    ) -> Box<dyn TemperatureProbe> {
        match self.mode {
            HardwareMode::Real => {
                Box::new(real::W1TemperatureProbe::new(&id.name, &id.device))
            }
            HardwareMode::Simulated => Box::new(sim::SimulatedProbe::new(
                &id.name,
                ProbeRole::from_name(&id.name),
                self.sim(),
            )),
        }
    }

    pub fn create_cpu_monitor(&self) -> Box<dyn CpuMonitor> {
        match self.mode {
            HardwareMode::Real => Box::new(real::RealCpuMonitor::new()),
            HardwareMode::Simulated => {
                Box::new(sim::SimulatedCpuMonitor::new())
            }
        }
    }

    pub fn create_network_monitor(&self) -> Box<dyn NetworkMonitor> {
        match self.mode {
            HardwareMode::Real => Box::new(real::RealNetworkMonitor::new()),
            HardwareMode::Simulated => {
                Box::new(sim::SimulatedNetworkMonitor::new())
            }
        }
    }

    pub fn create_system_loader(&self) -> Box<dyn SystemLoader> {
        match self.mode {
            HardwareMode::Real => Box::new(real::RealSystemLoader::new()),
            HardwareMode::Simulated => {
                Box::new(sim::SimulatedSystemLoader::new())
            }
        }
    }
}
