//! HAL implementations for the real Raspberry Pi peripherals: the
//! GPIO character device, the 1-Wire temperature bus, the SoC
//! thermal zone, the system `ping` binary, and `modprobe`.

use async_trait::async_trait;
use pipool_api::{
    hal::{CpuMonitor, Gpio, Level, NetworkMonitor, SystemLoader, TemperatureProbe},
    Error, Result,
};
use rppal::gpio::OutputPin;
use std::collections::HashMap;
use tokio::{
    process::Command,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

/// GPIO control through rppal. Pins are claimed lazily at
/// `setup_output` time and parked high.

pub struct RealGpio {
    chip: rppal::gpio::Gpio,
    pins: HashMap<u8, OutputPin>,
}

impl RealGpio {
    pub fn new() -> Result<RealGpio> {
        let chip = rppal::gpio::Gpio::new()
            .map_err(|e| Error::Hardware(format!("gpio: {}", e)))?;

        Ok(RealGpio {
            chip,
            pins: HashMap::new(),
        })
    }
}

impl Gpio for RealGpio {
    fn setup_output(&mut self, pin: u8) -> Result<()> {
        let mut out = self
            .chip
            .get(pin)
            .map_err(|e| {
                Error::Hardware(format!("gpio pin {}: {}", pin, e))
            })?
            .into_output();

        out.set_high();

        // Keep the line at its last level if the process dies without
        // running the shutdown sequence; the cleanup path drives it
        // high explicitly.

        out.set_reset_on_drop(false);
        self.pins.insert(pin, out);
        Ok(())
    }

    fn write(&mut self, pin: u8, level: Level) -> Result<()> {
        let out = self.pins.get_mut(&pin).ok_or_else(|| {
            Error::Hardware(format!("gpio pin {} not configured", pin))
        })?;

        match level {
            Level::High => out.set_high(),
            Level::Low => out.set_low(),
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        for out in self.pins.values_mut() {
            out.set_high()
        }
        self.pins.clear();
        info!("gpio released")
    }
}

// 1-Wire read retry schedule. The DS18B20 CRC line flaps under bus
// noise; a short retry loop rides it out.

const W1_RETRIES: u32 = 10;
const W1_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A DS18B20-style probe read through the kernel's `w1_slave` file.

pub struct W1TemperatureProbe {
    name: String,
    device: String,
}

impl W1TemperatureProbe {
    pub fn new(name: &str, device: &str) -> W1TemperatureProbe {
        info!("thermometer '{}' at {}", name, device);
        W1TemperatureProbe {
            name: String::from(name),
            device: String::from(device),
        }
    }

    // Parses the two-line `w1_slave` format: the first line ends in
    // "YES" when the CRC check passed, the second carries the
    // reading as milli-degrees after "t=".

    fn parse(contents: &str) -> Option<f64> {
        let mut lines = contents.lines();
        let crc_line = lines.next()?;

        if !crc_line.contains("YES") {
            return None;
        }

        let data_line = lines.next()?;
        let pos = data_line.find("t=")?;

        data_line[pos + 2..]
            .trim()
            .parse::<f64>()
            .ok()
            .map(|milli| (milli / 1000.0 * 100.0).round() / 100.0)
    }
}

#[async_trait]
impl TemperatureProbe for W1TemperatureProbe {
    async fn read(&self) -> Result<f64> {
        for attempt in 1..=W1_RETRIES {
            match tokio::fs::read_to_string(&self.device).await {
                Ok(contents) => {
                    if let Some(temp) = Self::parse(&contents) {
                        return Ok(temp);
                    }

                    // CRC failure or a malformed record; the next
                    // conversion usually succeeds.

                    warn!(
                        "read attempt {} failed for {} -- bad record",
                        attempt, &self.name
                    )
                }

                Err(e) => warn!(
                    "read attempt {} failed for {} -- {}",
                    attempt, &self.name, e
                ),
            }

            if attempt < W1_RETRIES {
                sleep(W1_RETRY_DELAY).await
            }
        }

        error!(
            "failed to read {} after {} attempts",
            &self.name, W1_RETRIES
        );
        Err(Error::Hardware(format!(
            "cannot read temperature from {}",
            &self.name
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The SoC temperature, read from the kernel thermal zone in
/// milli-degrees.

pub struct RealCpuMonitor {
    path: String,
}

impl RealCpuMonitor {
    pub fn new() -> RealCpuMonitor {
        RealCpuMonitor {
            path: String::from("/sys/class/thermal/thermal_zone0/temp"),
        }
    }
}

#[async_trait]
impl CpuMonitor for RealCpuMonitor {
    async fn read_temperature(&self) -> Result<f64> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        contents
            .trim()
            .parse::<f64>()
            .map(|milli| (milli / 1000.0 * 100.0).round() / 100.0)
            .map_err(|e| {
                Error::Hardware(format!("cpu temperature: {}", e))
            })
    }
}

/// Reachability through the system `ping` binary. One probe per
/// second; the burst succeeds if any probe does.

pub struct RealNetworkMonitor;

impl RealNetworkMonitor {
    pub fn new() -> RealNetworkMonitor {
        RealNetworkMonitor
    }

    async fn probe(target: &str) -> bool {
        match Command::new("ping")
            .args(["-c", "1", "-W", "1", target])
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                error!("couldn't run ping -- {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl NetworkMonitor for RealNetworkMonitor {
    async fn ping(
        &self,
        target: &str,
        count: u32,
        interval_secs: u64,
    ) -> bool {
        let mut reached = false;

        for ii in 0..count {
            if Self::probe(target).await {
                reached = true
            }

            if ii + 1 < count {
                sleep(Duration::from_secs(interval_secs)).await
            }
        }

        if !reached {
            warn!("ping to {} failed", target)
        }
        reached
    }
}

/// Loads kernel modules with `modprobe`. The 1-Wire stack needs
/// `w1-gpio` and `w1-therm` before the probe files appear.

pub struct RealSystemLoader;

impl RealSystemLoader {
    pub fn new() -> RealSystemLoader {
        RealSystemLoader
    }
}

#[async_trait]
impl SystemLoader for RealSystemLoader {
    async fn load_modules(&self, modules: &[&str]) -> Result<()> {
        for module in modules {
            let status = Command::new("modprobe")
                .arg(module)
                .status()
                .await
                .map_err(|e| {
                    Error::Hardware(format!("modprobe: {}", e))
                })?;

            if status.success() {
                info!("loaded module '{}'", module)
            } else {
                error!("failed to load module '{}' ({})", module, status)
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_w1_parse() {
        let good = "6c 01 4b 46 7f ff 04 10 a2 : crc=a2 YES\n\
                    6c 01 4b 46 7f ff 04 10 a2 t=22750\n";

        assert_eq!(W1TemperatureProbe::parse(good), Some(22.75));
    }

    #[test]
    fn test_w1_parse_crc_failure() {
        let bad = "6c 01 4b 46 7f ff 04 10 a2 : crc=a2 NO\n\
                   6c 01 4b 46 7f ff 04 10 a2 t=22750\n";

        assert_eq!(W1TemperatureProbe::parse(bad), None);
    }

    #[test]
    fn test_w1_parse_malformed() {
        assert_eq!(W1TemperatureProbe::parse(""), None);
        assert_eq!(W1TemperatureProbe::parse("YES\n"), None);
        assert_eq!(W1TemperatureProbe::parse("YES\nno marker\n"), None);
        assert_eq!(W1TemperatureProbe::parse("YES\nt=garbage\n"), None);
    }

    #[test]
    fn test_w1_parse_negative() {
        let freezing = "6c 01 4b 46 7f ff 04 10 a2 : crc=a2 YES\n\
                        6c 01 4b 46 7f ff 04 10 a2 t=-1250\n";

        assert_eq!(W1TemperatureProbe::parse(freezing), Some(-1.25));
    }
}
