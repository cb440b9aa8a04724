use pipool_api::{hal::HardwareMode, Error, Result};
use serde_derive::Deserialize;
use std::env;
use tracing::{info, warn, Level};

fn def_log_level() -> String {
    String::from("warn")
}

fn def_max_runtime() -> u64 {
    // Four hours of continuous heating before the limiter trips.
    4 * 3600
}

/// Identity of one temperature probe: the name it reports under and,
/// in real mode, the 1-Wire device path it reads from.

#[derive(Deserialize, Clone, Debug)]
pub struct SensorId {
    pub name: String,
    pub device: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TempSensors {
    pub in_to_heater: SensorId,
    pub out_from_heater: SensorId,
    pub temp_ambient: SensorId,
}

/// Thermal parameters of the simulated pool. Only consulted when the
/// simulated backend is selected.

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ThermalParams {
    pub initial_pool_temperature: f64,
    pub initial_ambient_temperature: f64,
    pub heater_delta: f64,
    pub max_heater_output_temp: f64,
    pub pool_heating_rate_per_hour: f64,
    pub pool_heat_loss_rate_per_hour: f64,
    pub sensor_noise: f64,
}

impl Default for ThermalParams {
    fn default() -> Self {
        ThermalParams {
            initial_pool_temperature: 26.0,
            initial_ambient_temperature: 22.0,
            heater_delta: 10.0,
            max_heater_output_temp: 40.0,
            pool_heating_rate_per_hour: 5.0,
            pool_heat_loss_rate_per_hour: 0.5,
            sensor_noise: 0.05,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Simulation {
    #[serde(default = "def_time_multiplier")]
    pub time_multiplier: f64,
    #[serde(default)]
    pub thermal: ThermalParams,
}

impl Default for Simulation {
    fn default() -> Self {
        Simulation {
            time_multiplier: def_time_multiplier(),
            thermal: ThermalParams::default(),
        }
    }
}

fn def_time_multiplier() -> f64 {
    1.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,

    pub temp_sensors: TempSensors,

    pub pump_port: u8,
    pub heater_port: u8,
    pub light_port: u8,
    pub pump_speed_s1_port: u8,
    pub pump_speed_s2_port: u8,
    pub pump_speed_s3_port: u8,
    pub pump_speed_s4_port: u8,

    pub max_water_temp: f64,
    #[serde(default = "def_max_runtime")]
    pub max_heater_runtime_seconds: u64,

    pub ping_target: String,
    pub mqtt_broker: String,

    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    db_host: Option<String>,

    hardware_mode: Option<String>,

    #[serde(default)]
    pub simulation: Simulation,

    #[serde(skip)]
    pub no_devices: bool,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    pub fn db_host(&self) -> &str {
        self.db_host.as_deref().unwrap_or("localhost")
    }

    /// Resolves the hardware mode: the `PIPOOL_HARDWARE_MODE`
    /// environment variable wins, then the `hardwareMode` config
    /// key, then platform auto-detection.
    pub fn hardware_mode(&self) -> HardwareMode {
        if let Ok(mode) = env::var("PIPOOL_HARDWARE_MODE") {
            return HardwareMode::from_str(&mode);
        }

        if let Some(mode) = &self.hardware_mode {
            return HardwareMode::from_str(mode);
        }

        detect_hardware_mode()
    }

    fn validate(self) -> Result<Config> {
        let ports = [
            ("pumpPort", self.pump_port),
            ("heaterPort", self.heater_port),
            ("lightPort", self.light_port),
            ("pumpSpeedS1Port", self.pump_speed_s1_port),
            ("pumpSpeedS2Port", self.pump_speed_s2_port),
            ("pumpSpeedS3Port", self.pump_speed_s3_port),
            ("pumpSpeedS4Port", self.pump_speed_s4_port),
        ];

        for (name, port) in ports {
            if !(1..=8).contains(&port) {
                return Err(Error::Config(format!(
                    "invalid {}: {} (must be 1-8)",
                    name, port
                )));
            }
        }

        if self.mqtt_broker.trim().is_empty() {
            return Err(Error::Config(
                "'mqttBroker' must not be empty".into(),
            ));
        }

        if !(20.0..=45.0).contains(&self.max_water_temp) {
            warn!(
                "maxWaterTemp {}C seems unusual (recommended: 20-45C)",
                self.max_water_temp
            );
        }

        if self.ping_target.trim().is_empty() {
            warn!("pingTarget is empty -- network monitoring may not work");
        }

        Ok(self)
    }
}

// Auto-detect: a Raspberry Pi gets the real backend, anything else
// the simulation.

fn detect_hardware_mode() -> HardwareMode {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(cpuinfo) if cpuinfo.contains("Raspberry Pi") => HardwareMode::Real,
        _ => HardwareMode::Simulated,
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("PiPool Supervisory Controller")
        .version(crate_version!())
        .about("Drives a pool pump, heater, and light with safety interlocks.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    // The number of '-v' options determines the log level.

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config> {
    serde_json::from_str::<Config>(contents)
        .map_err(|e| Error::Config(format!("{}", e)))
        .and_then(Config::validate)
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

// The configuration file search. An explicit `-c` path wins;
// otherwise `config_custom.json` (local overrides, not committed)
// takes precedence over `config.json`.

async fn find_cfg(explicit: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit {
        return match from_file(path).await {
            Some(cfg) => cfg,
            None => {
                Err(Error::Config(format!("couldn't read {}", path)))
            }
        };
    }

    for file in ["config_custom.json", "config.json"] {
        if let Some(cfg) = from_file(file).await {
            info!("loading config: {}", file);
            return cfg;
        }
    }

    Err(Error::Config(
        "no config_custom.json or config.json found".into(),
    ))
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!("    hardware mode: {:?}", cfg.hardware_mode());
    println!("    relay switching inhibited: {}\n", cfg.no_devices);

    println!("Relay ports:");
    println!("    pump: {}", cfg.pump_port);
    println!("    heater: {}", cfg.heater_port);
    println!("    light: {}\n", cfg.light_port);

    println!("Safety limits:");
    println!("    max water temp: {} C", cfg.max_water_temp);
    println!(
        "    max heater runtime: {} s\n",
        cfg.max_heater_runtime_seconds
    );

    println!("Services:");
    println!("    mqtt broker: {}", cfg.mqtt_broker);
    println!("    ping target: {}", cfg.ping_target);
    println!("    log store: {}/{}", cfg.db_host(), cfg.db_name);
}

pub async fn get() -> Option<Config> {
    // Peek at the command line for the config path before the full
    // parse; clap consumes the arguments either way.

    let explicit = env::args()
        .zip(env::args().skip(1))
        .find(|(flag, _)| flag == "-c" || flag == "--config")
        .map(|(_, path)| path);

    match find_cfg(explicit.as_deref()).await {
        Ok(mut cfg) => {
            cfg.no_devices = env::var_os("NO_DEVICES").is_some();

            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "tempSensors": {
            "in_to_heater": {
                "name": "temp_sensor_in",
                "device": "/sys/bus/w1/devices/28-aaaa/w1_slave"
            },
            "out_from_heater": {
                "name": "temp_sensor_out",
                "device": "/sys/bus/w1/devices/28-bbbb/w1_slave"
            },
            "temp_ambient": {
                "name": "temp_ambient",
                "device": "/sys/bus/w1/devices/28-cccc/w1_slave"
            }
        },
        "pumpPort": 6,
        "heaterPort": 7,
        "lightPort": 8,
        "pumpSpeedS1Port": 1,
        "pumpSpeedS2Port": 2,
        "pumpSpeedS3Port": 3,
        "pumpSpeedS4Port": 4,
        "maxWaterTemp": 30,
        "pingTarget": "192.168.1.1",
        "mqttBroker": "192.168.1.2",
        "dbName": "pipool",
        "dbUser": "pipool",
        "dbPassword": "secret"
    }"#;

    #[test]
    fn test_sample_parses() {
        let cfg = parse_config(SAMPLE).unwrap();

        assert_eq!(cfg.pump_port, 6);
        assert_eq!(cfg.heater_port, 7);
        assert_eq!(cfg.light_port, 8);
        assert_eq!(cfg.max_water_temp, 30.0);
        assert_eq!(cfg.max_heater_runtime_seconds, 14_400);
        assert_eq!(cfg.temp_sensors.in_to_heater.name, "temp_sensor_in");
        assert_eq!(cfg.db_host(), "localhost");
        assert_eq!(cfg.simulation.time_multiplier, 1.0);
        assert_eq!(cfg.simulation.thermal.heater_delta, 10.0);
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let bad = SAMPLE.replace("\"pumpPort\": 6", "\"pumpPort\": 0");
        assert!(parse_config(&bad).is_err());

        let bad = SAMPLE.replace("\"heaterPort\": 7", "\"heaterPort\": 9");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_missing_broker_rejected() {
        let bad =
            SAMPLE.replace("\"mqttBroker\": \"192.168.1.2\",", "");
        assert!(parse_config(&bad).is_err());

        let bad = SAMPLE.replace("192.168.1.2", " ");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_simulation_overrides() {
        let cfg = SAMPLE.replace(
            "\"dbPassword\": \"secret\"",
            r#""dbPassword": "secret",
               "hardwareMode": "simulated",
               "simulation": {
                   "time_multiplier": 60.0,
                   "thermal": { "heater_delta": 8.0 }
               }"#,
        );
        let cfg = parse_config(&cfg).unwrap();

        assert_eq!(cfg.simulation.time_multiplier, 60.0);
        assert_eq!(cfg.simulation.thermal.heater_delta, 8.0);

        // Unspecified thermal values keep their defaults.

        assert_eq!(cfg.simulation.thermal.sensor_noise, 0.05);
    }
}
