//! The sensor set: three water/air thermometers plus the board's own
//! CPU temperature. Each wrapper caches its latest reading so the
//! control loop can consume values without re-reading hardware, and
//! persistence is throttled to one record per sensor per five
//! minutes.

use async_trait::async_trait;
use pipool_api::hal::{CpuMonitor, TemperatureProbe};
use serde_json::{Map, Value};
use std::{
    sync::{Mutex, PoisonError},
    time::Instant,
};
use tracing::error;

use crate::store::Recorder;

// Minimum spacing between persisted samples of one sensor.

const LOG_INTERVAL_SECS: u64 = 5 * 60;

/// One named reading source. `refresh` touches hardware; `current`
/// returns the cached value. A `None` reading means the source
/// failed and consumers must not fall back on stale data.

#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(&self) -> Option<f64>;

    fn current(&self) -> Option<f64>;
}

/// A water or air thermometer backed by a temperature probe.

pub struct Thermometer {
    name: String,
    probe: Box<dyn TemperatureProbe>,
    current: Mutex<Option<f64>>,
}

impl Thermometer {
    pub fn new(name: &str, probe: Box<dyn TemperatureProbe>) -> Thermometer {
        Thermometer {
            name: String::from(name),
            probe,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sensor for Thermometer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self) -> Option<f64> {
        let reading = match self.probe.read().await {
            Ok(temp) => Some(temp),

            Err(e) => {
                // Report the failure, not the previous value; the
                // heater's invalid-reading branch depends on seeing
                // the null.

                error!("sensor {} read error -- {}", &self.name, e);
                None
            }
        };

        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reading;
        reading
    }

    fn current(&self) -> Option<f64> {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The SoC temperature of the controller board itself.

pub struct CpuTemperature {
    monitor: Box<dyn CpuMonitor>,
    current: Mutex<Option<f64>>,
}

impl CpuTemperature {
    pub const NAME: &'static str = "temp_rpi";

    pub fn new(monitor: Box<dyn CpuMonitor>) -> CpuTemperature {
        CpuTemperature {
            monitor,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sensor for CpuTemperature {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn refresh(&self) -> Option<f64> {
        let reading = match self.monitor.read_temperature().await {
            Ok(temp) => Some(temp),

            Err(e) => {
                error!("cpu temperature read error -- {}", e);
                None
            }
        };

        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reading;
        reading
    }

    fn current(&self) -> Option<f64> {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct Entry {
    sensor: Box<dyn Sensor>,
    last_logged: Mutex<Instant>,
}

/// The sensor collection the supervisor reads every tick.

pub struct Sensors {
    entries: Vec<Entry>,
}

impl Sensors {
    pub fn new() -> Sensors {
        Sensors {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, sensor: Box<dyn Sensor>) {
        self.entries.push(Entry {
            sensor,
            last_logged: Mutex::new(Instant::now()),
        })
    }

    /// Refreshes every sensor and returns the telemetry fragment:
    /// sensor name to reading, with `null` for failed reads.
    pub async fn collect_status(&self) -> Map<String, Value> {
        let mut message = Map::new();

        for entry in &self.entries {
            let reading = entry.sensor.refresh().await;

            message.insert(
                String::from(entry.sensor.name()),
                match reading {
                    Some(temp) => Value::from(temp),
                    None => Value::Null,
                },
            );
        }

        message
    }

    /// The cached reading of a sensor by name.
    pub fn current_reading(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|entry| entry.sensor.name() == name)
            .and_then(|entry| entry.sensor.current())
    }

    /// Persists whichever sensors haven't been recorded within the
    /// throttle window.
    pub fn log_to_store(&self, recorder: &Recorder) {
        for entry in &self.entries {
            let mut last_logged = entry
                .last_logged
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if last_logged.elapsed().as_secs() < LOG_INTERVAL_SECS {
                continue;
            }

            if let Some(reading) = entry.sensor.current() {
                recorder.sensor(entry.sensor.name(), reading);
                *last_logged = Instant::now()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use pipool_api::{Error, Result};

    struct FixedProbe {
        name: &'static str,
        value: Result<f64>,
    }

    #[async_trait]
    impl TemperatureProbe for FixedProbe {
        async fn read(&self) -> Result<f64> {
            self.value.clone()
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_thermometer_caches_reading() {
        let thermo = Thermometer::new(
            "temp_sensor_in",
            Box::new(FixedProbe {
                name: "temp_sensor_in",
                value: Ok(26.5),
            }),
        );

        assert_eq!(thermo.current(), None);
        assert_eq!(thermo.refresh().await, Some(26.5));
        assert_eq!(thermo.current(), Some(26.5));
    }

    #[tokio::test]
    async fn test_failed_read_is_null_not_stale() {
        let thermo = Thermometer::new(
            "temp_sensor_in",
            Box::new(FixedProbe {
                name: "temp_sensor_in",
                value: Err(Error::Hardware("gone".into())),
            }),
        );

        assert_eq!(thermo.refresh().await, None);
        assert_eq!(thermo.current(), None);
    }

    #[tokio::test]
    async fn test_collect_status_reports_null_for_failures() {
        let mut sensors = Sensors::new();

        sensors.add(Box::new(Thermometer::new(
            "temp_sensor_in",
            Box::new(FixedProbe {
                name: "temp_sensor_in",
                value: Ok(26.0),
            }),
        )));
        sensors.add(Box::new(Thermometer::new(
            "temp_sensor_out",
            Box::new(FixedProbe {
                name: "temp_sensor_out",
                value: Err(Error::Hardware("gone".into())),
            }),
        )));

        let status = sensors.collect_status().await;

        assert_eq!(status.get("temp_sensor_in"), Some(&Value::from(26.0)));
        assert_eq!(status.get("temp_sensor_out"), Some(&Value::Null));
        assert_eq!(sensors.current_reading("temp_sensor_in"), Some(26.0));
        assert_eq!(sensors.current_reading("temp_sensor_out"), None);
        assert_eq!(sensors.current_reading("missing"), None);
    }

    #[tokio::test]
    async fn test_persistence_is_throttled() {
        let (recorder, rx) = store::channel();
        let mut sensors = Sensors::new();

        sensors.add(Box::new(Thermometer::new(
            "temp_sensor_in",
            Box::new(FixedProbe {
                name: "temp_sensor_in",
                value: Ok(26.0),
            }),
        )));

        let _ = sensors.collect_status().await;

        // Fresh sensors start inside the throttle window, matching a
        // boot that shouldn't immediately spam the store.

        sensors.log_to_store(&recorder);
        assert!(rx.drain().is_empty());

        // Rewind the throttle stamp; now one record lands.

        *sensors.entries[0]
            .last_logged
            .lock()
            .unwrap() -= std::time::Duration::from_secs(LOG_INTERVAL_SECS + 1);
        sensors.log_to_store(&recorder);
        sensors.log_to_store(&recorder);

        assert_eq!(rx.drain().len(), 1);
    }
}
