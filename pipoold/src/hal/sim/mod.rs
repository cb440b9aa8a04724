//! The simulated hardware family. A shared `SimulationEnvironment`
//! holds pool and ambient temperatures advanced by a thermal model;
//! the simulated probes read from it, the simulated GPIO tracks
//! levels in memory, and the rest of the family answers with fixed,
//! healthy values. Everything here is deterministic enough for
//! tests and lively enough for a dashboard demo.

use async_trait::async_trait;
use pipool_api::{
    hal::{CpuMonitor, Gpio, Level, NetworkMonitor, SystemLoader, TemperatureProbe},
    Result,
};
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use tracing::info;

use crate::config::Simulation;
#[cfg(test)]
use crate::config::ThermalParams;

pub mod thermal;

use thermal::ThermalModel;

/// Lets the simulation observe the actuators it is simulating the
/// consequences of. Wired after the devices exist.

pub trait DeviceStates: Send + Sync {
    fn is_pump_on(&self) -> bool;
    fn is_heater_on(&self) -> bool;
    fn is_light_on(&self) -> bool;
}

struct SimState {
    pool_temp: f64,
    ambient_temp: f64,
    time_multiplier: f64,
    last_update: Instant,
}

/// The simulated pool. Owns the environmental state and the thermal
/// model; `tick` advances physics by wall time scaled with the time
/// multiplier.

pub struct SimulationEnvironment {
    model: ThermalModel,
    noise: f64,
    state: Mutex<SimState>,
    devices: Mutex<Option<Box<dyn DeviceStates>>>,
}

impl SimulationEnvironment {
    pub fn new(cfg: &Simulation) -> Arc<SimulationEnvironment> {
        let thermal = cfg.thermal.clone();

        info!(
            "simulation initialized -- pool={:.1}C, ambient={:.1}C, x{:.1}",
            thermal.initial_pool_temperature,
            thermal.initial_ambient_temperature,
            cfg.time_multiplier
        );

        Arc::new(SimulationEnvironment {
            noise: thermal.sensor_noise,
            state: Mutex::new(SimState {
                pool_temp: thermal.initial_pool_temperature,
                ambient_temp: thermal.initial_ambient_temperature,
                time_multiplier: cfg.time_multiplier,
                last_update: Instant::now(),
            }),
            devices: Mutex::new(None),
            model: ThermalModel::new(thermal),
        })
    }

    #[cfg(test)]
    pub fn for_test(thermal: ThermalParams) -> Arc<SimulationEnvironment> {
        SimulationEnvironment::new(&Simulation {
            time_multiplier: 1.0,
            thermal,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_states(&self) -> Option<(bool, bool)> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| (d.is_heater_on(), d.is_pump_on()))
    }

    /// Connects the device state provider. Until this is called,
    /// `tick` leaves the temperatures alone.
    pub fn set_device_states(&self, provider: Box<dyn DeviceStates>) {
        *self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(provider);
        info!("simulation device state provider connected")
    }

    /// Advances the physics by the wall time elapsed since the last
    /// call, scaled by the time multiplier.
    pub fn tick(&self) {
        let Some((heater_on, pump_on)) = self.device_states() else {
            return;
        };

        let mut state = self.lock_state();
        let elapsed = state.last_update.elapsed().as_secs_f64()
            * state.time_multiplier;

        state.last_update = Instant::now();

        let change = self.model.pool_temp_change(
            state.pool_temp,
            state.ambient_temp,
            heater_on,
            pump_on,
            elapsed,
        );

        state.pool_temp += change;
    }

    fn with_noise(&self, value: f64) -> f64 {
        if self.noise == 0.0 {
            return value;
        }

        let offset = rand::thread_rng().gen_range(-self.noise..=self.noise);

        ((value + offset) * 100.0).round() / 100.0
    }

    pub fn pool_temperature(&self) -> f64 {
        let temp = self.lock_state().pool_temp;

        self.with_noise(temp)
    }

    pub fn heater_output_temperature(&self) -> f64 {
        let intake = self.lock_state().pool_temp;
        let output = match self.device_states() {
            Some((heater_on, pump_on)) => {
                self.model.heater_output_temp(intake, heater_on, pump_on)
            }
            None => intake,
        };

        self.with_noise(output)
    }

    pub fn ambient_temperature(&self) -> f64 {
        let temp = self.lock_state().ambient_temp;

        self.with_noise(temp)
    }

    // Knobs driven by the pipool/simulation/... broker topics.

    pub fn set_pool_temperature(&self, temp: f64) {
        info!("simulation pool temperature set to {:.1}C", temp);
        self.lock_state().pool_temp = temp
    }

    pub fn set_ambient_temperature(&self, temp: f64) {
        info!("simulation ambient temperature set to {:.1}C", temp);
        self.lock_state().ambient_temp = temp
    }

    pub fn set_time_multiplier(&self, multiplier: f64) {
        info!("simulation time multiplier set to x{:.1}", multiplier);
        self.lock_state().time_multiplier = multiplier
    }
}

/// Which environmental value a simulated probe reports. Inferred
/// from the configured sensor name, as the sensor identities are
/// free-form strings.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRole {
    Intake,
    Output,
    Ambient,
}

impl ProbeRole {
    pub fn from_name(name: &str) -> ProbeRole {
        let name = name.to_lowercase();

        if name.contains("ambient") {
            ProbeRole::Ambient
        } else if name.contains("out") {
            ProbeRole::Output
        } else {
            ProbeRole::Intake
        }
    }
}

pub struct SimulatedProbe {
    name: String,
    role: ProbeRole,
    env: Arc<SimulationEnvironment>,
}

impl SimulatedProbe {
    pub fn new(
        name: &str,
        role: ProbeRole,
        env: Arc<SimulationEnvironment>,
    ) -> SimulatedProbe {
        info!("simulated probe '{}' as {:?}", name, role);
        SimulatedProbe {
            name: String::from(name),
            role,
            env,
        }
    }
}

#[async_trait]
impl TemperatureProbe for SimulatedProbe {
    async fn read(&self) -> Result<f64> {
        Ok(match self.role {
            ProbeRole::Intake => self.env.pool_temperature(),
            ProbeRole::Output => self.env.heater_output_temperature(),
            ProbeRole::Ambient => self.env.ambient_temperature(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory GPIO. The level map and write history are shared out so
/// tests and the relay board can both see them.

#[derive(Default)]
struct GpioRecord {
    levels: HashMap<u8, Level>,
    writes: Vec<(u8, Level)>,
}

#[derive(Default)]
pub struct SimulatedGpio {
    record: Arc<Mutex<GpioRecord>>,
}

/// A read handle onto a `SimulatedGpio`'s pin levels and write
/// history.

#[derive(Clone)]
pub struct GpioLevels(Arc<Mutex<GpioRecord>>);

impl GpioLevels {
    pub fn get(&self, pin: u8) -> Option<Level> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .levels
            .get(&pin)
            .copied()
    }

    /// Every `write` call made against any pin, oldest first.
    pub fn all_writes(&self) -> Vec<(u8, Level)> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
            .clone()
    }

    /// Every `write` call made against `pin`, oldest first.
    pub fn writes(&self, pin: u8) -> Vec<Level> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
            .iter()
            .filter(|(p, _)| *p == pin)
            .map(|(_, level)| *level)
            .collect()
    }
}

impl SimulatedGpio {
    pub fn new() -> SimulatedGpio {
        SimulatedGpio::default()
    }

    pub fn levels(&self) -> GpioLevels {
        GpioLevels(self.record.clone())
    }
}

impl Gpio for SimulatedGpio {
    fn setup_output(&mut self, pin: u8) -> Result<()> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .levels
            .insert(pin, Level::High);
        Ok(())
    }

    fn write(&mut self, pin: u8, level: Level) -> Result<()> {
        let mut record =
            self.record.lock().unwrap_or_else(PoisonError::into_inner);

        record.levels.insert(pin, level);
        record.writes.push((pin, level));
        Ok(())
    }

    fn cleanup(&mut self) {
        let mut record =
            self.record.lock().unwrap_or_else(PoisonError::into_inner);

        for level in record.levels.values_mut() {
            *level = Level::High
        }
    }
}

pub struct SimulatedCpuMonitor {
    base: f64,
    variance: f64,
}

impl SimulatedCpuMonitor {
    pub fn new() -> SimulatedCpuMonitor {
        SimulatedCpuMonitor {
            base: 50.0,
            variance: 5.0,
        }
    }
}

#[async_trait]
impl CpuMonitor for SimulatedCpuMonitor {
    async fn read_temperature(&self) -> Result<f64> {
        let offset =
            rand::thread_rng().gen_range(-self.variance..=self.variance);
        let temp = (self.base + offset).clamp(40.0, 60.0);

        Ok((temp * 100.0).round() / 100.0)
    }
}

/// Always reachable. Watchdog tests that need an outage substitute
/// their own `NetworkMonitor`.

pub struct SimulatedNetworkMonitor;

impl SimulatedNetworkMonitor {
    pub fn new() -> SimulatedNetworkMonitor {
        SimulatedNetworkMonitor
    }
}

#[async_trait]
impl NetworkMonitor for SimulatedNetworkMonitor {
    async fn ping(
        &self,
        _target: &str,
        _count: u32,
        _interval_secs: u64,
    ) -> bool {
        true
    }
}

pub struct SimulatedSystemLoader;

impl SimulatedSystemLoader {
    pub fn new() -> SimulatedSystemLoader {
        SimulatedSystemLoader
    }
}

#[async_trait]
impl SystemLoader for SimulatedSystemLoader {
    async fn load_modules(&self, modules: &[&str]) -> Result<()> {
        for module in modules {
            info!("simulated load of module '{}'", module)
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStates {
        pump: bool,
        heater: bool,
    }

    impl DeviceStates for FixedStates {
        fn is_pump_on(&self) -> bool {
            self.pump
        }

        fn is_heater_on(&self) -> bool {
            self.heater
        }

        fn is_light_on(&self) -> bool {
            false
        }
    }

    fn quiet_params() -> ThermalParams {
        ThermalParams {
            sensor_noise: 0.0,
            ..ThermalParams::default()
        }
    }

    #[test]
    fn test_probe_roles() {
        assert_eq!(ProbeRole::from_name("temp_sensor_in"), ProbeRole::Intake);
        assert_eq!(ProbeRole::from_name("temp_sensor_out"), ProbeRole::Output);
        assert_eq!(ProbeRole::from_name("temp_ambient"), ProbeRole::Ambient);
    }

    #[test]
    fn test_tick_without_provider_is_inert() {
        let env = SimulationEnvironment::for_test(quiet_params());

        env.tick();
        assert_eq!(env.pool_temperature(), 26.0);
    }

    #[test]
    fn test_output_follows_device_states() {
        let env = SimulationEnvironment::for_test(quiet_params());

        // No heating until both devices run.

        env.set_device_states(Box::new(FixedStates {
            pump: true,
            heater: false,
        }));
        assert_eq!(env.heater_output_temperature(), 26.0);

        env.set_device_states(Box::new(FixedStates {
            pump: true,
            heater: true,
        }));
        assert_eq!(env.heater_output_temperature(), 36.0);
    }

    #[test]
    fn test_simulation_knobs() {
        let env = SimulationEnvironment::for_test(quiet_params());

        env.set_pool_temperature(30.0);
        env.set_ambient_temperature(25.0);

        assert_eq!(env.pool_temperature(), 30.0);
        assert_eq!(env.ambient_temperature(), 25.0);
    }
}
