//! The composition root and the control loop. Everything the daemon
//! owns is built here, in dependency order, then the ~1 Hz tick
//! drives sensors, actuators, and the watchdog until a signal starts
//! the ordered shutdown.

use futures::FutureExt;
use pipool_api::{hal::HardwareMode, Error, Result};
use serde_json::Value;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

use crate::{
    automations::Automations,
    bus::MessageBus,
    config::Config,
    device::{color::ColorDriver, heater::Heater, light::Light, pump::Pump},
    hal::{
        sim::{DeviceStates, SimulationEnvironment},
        HardwareFactory,
    },
    pinger::Pinger,
    relay::RelayBoard,
    sensor::{CpuTemperature, Sensors, Thermometer},
    store::{self, postgres::Store, Recorder},
    watchdog::Watchdog,
};

const STATUS_TOPIC: &str = "pipool/status";
const SENSORS_TOPIC: &str = "pipool/sensors";

const TICK: Duration = Duration::from_secs(1);

// Pause before retrying after a fatal tick failure, so a persistent
// fault doesn't spin the loop.

const FAILURE_PAUSE: Duration = Duration::from_secs(5);

// Mirrors actuator states into the thermal simulation.

struct DeviceStateAdapter {
    pump: Arc<Pump>,
    heater: Arc<Heater>,
    light: Arc<Light>,
}

impl DeviceStates for DeviceStateAdapter {
    fn is_pump_on(&self) -> bool {
        self.pump.is_on()
    }

    fn is_heater_on(&self) -> bool {
        self.heater.is_on()
    }

    fn is_light_on(&self) -> bool {
        self.light.is_on()
    }
}

// Watches for the first interrupt/terminate signal and reports it
// through the returned channel. A second signal forces an immediate
// exit.

fn install_signal_handler(
) -> Result<watch::Receiver<Option<&'static str>>> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::Internal(format!("signals: {}", e)))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Internal(format!("signals: {}", e)))?;
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        info!("shutdown initiated by {}", name);

        let _ = tx.send(Some(name));

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        };

        warn!("second signal received, forcing exit");
        std::process::exit(1)
    });

    Ok(rx)
}

struct Controller {
    cfg: Config,
    sim: Option<Arc<SimulationEnvironment>>,
    recorder: Recorder,
    sensors: Sensors,
    relay: Arc<RelayBoard>,
    pump: Arc<Pump>,
    heater: Arc<Heater>,
    light: Arc<Light>,
    color: Arc<ColorDriver>,
    pinger: Arc<Pinger>,
    bus: Arc<MessageBus>,
    watchdog: Watchdog,
}

impl Controller {
    /// Builds every component in dependency order. Each step must
    /// complete before the next; a failure here aborts startup.
    async fn build(cfg: Config) -> Result<Controller> {
        let mode = cfg.hardware_mode();

        info!("hardware mode: {:?}", mode);

        let sim = match mode {
            HardwareMode::Simulated => {
                Some(SimulationEnvironment::new(&cfg.simulation))
            }
            HardwareMode::Real => None,
        };
        let factory = HardwareFactory::new(mode, sim.clone());

        // The 1-Wire bus needs its kernel modules before the probe
        // files exist. Failures are logged inside; a missing module
        // shows up soon enough as failed reads.

        if let Err(e) = factory
            .create_system_loader()
            .load_modules(&["w1-gpio", "w1-therm"])
            .await
        {
            error!("kernel module load failed -- {}", e)
        }

        // The log store and the recording channel everything else
        // writes through.

        let (recorder, record_rx) = store::channel();
        let db = Store::open(&cfg).await?;

        tokio::spawn(db.run(record_rx));
        recorder.opaque_event("Boot", None);

        // Sensors.

        let mut sensors = Sensors::new();

        for id in [
            &cfg.temp_sensors.in_to_heater,
            &cfg.temp_sensors.out_from_heater,
            &cfg.temp_sensors.temp_ambient,
        ] {
            sensors.add(Box::new(Thermometer::new(
                &id.name,
                factory.create_temperature_probe(id),
            )))
        }
        sensors.add(Box::new(CpuTemperature::new(
            factory.create_cpu_monitor(),
        )));

        // The relay board and the actuators on it. The heater gets
        // the pump reference for its interlock.

        let relay = Arc::new(RelayBoard::new(
            factory.create_gpio()?,
            cfg.no_devices,
        )?);
        let pump = Arc::new(Pump::new(
            relay.clone(),
            cfg.pump_port,
            recorder.clone(),
        ));
        let light = Light::new(relay.clone(), cfg.light_port);
        let heater = Arc::new(Heater::new(
            relay.clone(),
            cfg.heater_port,
            cfg.max_water_temp,
            cfg.max_heater_runtime_seconds,
            Some(pump.clone()),
            recorder.clone(),
        ));
        let color = ColorDriver::new(light.clone());

        color.clone().start();

        // Let the simulation observe the devices it models.

        if let Some(sim) = &sim {
            sim.set_device_states(Box::new(DeviceStateAdapter {
                pump: pump.clone(),
                heater: heater.clone(),
                light: light.clone(),
            }))
        }

        // The services around the actuators.

        let automations =
            Automations::new(pump.clone(), heater.clone(), recorder.clone());
        let pinger = Arc::new(Pinger::start(
            cfg.ping_target.clone(),
            factory.create_network_monitor(),
        ));
        let bus = MessageBus::new(&cfg.mqtt_broker);

        register_handlers(
            &bus,
            &pump,
            &light,
            &heater,
            &color,
            &automations,
            sim.as_ref(),
        );
        bus.clone().start();

        let watchdog = Watchdog::new(
            pump.clone(),
            heater.clone(),
            pinger.clone(),
            bus.clone(),
            recorder.clone(),
        );

        Ok(Controller {
            cfg,
            sim,
            recorder,
            sensors,
            relay,
            pump,
            heater,
            light,
            color,
            pinger,
            bus,
            watchdog,
        })
    }

    // One pass of the control loop.

    async fn tick(&mut self) {
        if let Some(sim) = &self.sim {
            sim.tick()
        }

        // Read every sensor and assemble the telemetry message, then
        // overlay the actuator states.

        let mut message = self.sensors.collect_status().await;

        message.insert(
            "pump_state".into(),
            Value::from(self.pump.state().label()),
        );
        message.insert(
            "light_state".into(),
            Value::from(self.light.state().label()),
        );
        message.insert(
            "heater_state".into(),
            Value::from(self.heater.state().label()),
        );

        // Feed the heater before its tick so the safety cascade sees
        // this second's readings.

        self.heater.set_input_temp(
            self.sensors
                .current_reading(&self.cfg.temp_sensors.in_to_heater.name),
        );
        self.heater.set_output_temp(
            self.sensors
                .current_reading(&self.cfg.temp_sensors.out_from_heater.name),
        );

        self.heater.run_one_tick();
        self.pump.run_one_tick();

        self.watchdog.check();

        let message = Value::Object(message).to_string();

        info!("message: {}", &message);

        self.bus.publish(STATUS_TOPIC, "Online");
        self.bus.publish(SENSORS_TOPIC, &message);

        self.sensors.log_to_store(&self.recorder)
    }

    // The ordered shutdown. Every step is fenced so one failure
    // can't keep the later, more critical steps from running.

    async fn shutdown(&self, signal: &str) {
        let fence = |name: &str, f: &dyn Fn()| {
            if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!("shutdown step '{}' failed", name)
            }
        };

        // Phase 1: heater first; it is the device that can do harm.

        fence("heater", &|| self.heater.hard_stop());
        info!("shutdown: heater stopped");

        // Phase 2: the pump is safe to stop once the heater is cold.

        fence("pump", &|| self.pump.hard_stop());
        info!("shutdown: pump stopped");

        // Phase 3: non-critical devices.

        fence("light", &|| self.light.off());
        self.color.stop().await;
        info!("shutdown: lights stopped");

        // Phase 4: background services.

        self.pinger.stop().await;
        self.bus.stop().await;
        info!("shutdown: background services stopped");

        // Phase 5: park every relay line and release the GPIO. This
        // must run even if everything above misbehaved.

        fence("gpio", &|| self.relay.cleanup());
        info!("shutdown: GPIO cleanup complete");

        self.recorder.opaque_event(
            "system_shutdown",
            Some(serde_json::json!({ "signal": signal })),
        );

        // Give the store writer a moment to drain; the record is
        // best-effort either way.

        sleep(Duration::from_millis(250)).await;
        info!("shutdown: complete")
    }
}

fn register_handlers(
    bus: &Arc<MessageBus>,
    pump: &Arc<Pump>,
    light: &Arc<Light>,
    heater: &Arc<Heater>,
    color: &Arc<ColorDriver>,
    automations: &Arc<Automations>,
    sim: Option<&Arc<SimulationEnvironment>>,
) {
    {
        let pump = pump.clone();

        bus.add_handler(
            "pipool/control/pump_state",
            Box::new(move |data| pump.handle_state_message(data)),
        );
    }
    {
        let pump = pump.clone();

        bus.add_handler(
            "pipool/control/pump_on",
            Box::new(move |data| pump.handle_on_message(data)),
        );
    }
    {
        let pump = pump.clone();

        bus.add_handler(
            "pipool/control/pump_off",
            Box::new(move |data| pump.handle_off_message(data)),
        );
    }
    {
        let light = light.clone();

        bus.add_handler(
            "pipool/control/light_state",
            Box::new(move |data| light.handle_state_message(data)),
        );
    }
    {
        let color = color.clone();

        bus.add_handler(
            "pipool/control/light_set_color",
            Box::new(move |data| color.handle_set_color_message(data)),
        );
    }
    {
        let heater = heater.clone();

        bus.add_handler(
            "pipool/control/heater_state",
            Box::new(move |data| heater.handle_state_message(data)),
        );
    }
    {
        let automations = automations.clone();

        bus.add_handler(
            "pipool/control/heater_reach_and_stop",
            Box::new(move |data| {
                automations.handle_heater_reach_and_stop(data)
            }),
        );
    }
    {
        let automations = automations.clone();

        bus.add_handler(
            "pipool/control/pump_run_for_x_minutes",
            Box::new(move |data| {
                automations.handle_pump_run_for_minutes(data)
            }),
        );
    }

    // The simulation knobs only exist under the simulated backend.

    if let Some(sim) = sim {
        let parse = |data: &str| -> Option<f64> {
            match data.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("invalid simulation payload {:?}", data);
                    None
                }
            }
        };

        {
            let sim = sim.clone();

            bus.add_handler(
                "pipool/simulation/set_pool_temp",
                Box::new(move |data| {
                    if let Some(temp) = parse(data) {
                        sim.set_pool_temperature(temp)
                    }
                }),
            );
        }
        {
            let sim = sim.clone();

            bus.add_handler(
                "pipool/simulation/set_ambient_temp",
                Box::new(move |data| {
                    if let Some(temp) = parse(data) {
                        sim.set_ambient_temperature(temp)
                    }
                }),
            );
        }
        {
            let sim = sim.clone();

            bus.add_handler(
                "pipool/simulation/set_time_multiplier",
                Box::new(move |data| {
                    if let Some(multiplier) = parse(data) {
                        sim.set_time_multiplier(multiplier)
                    }
                }),
            );
        }
    }
}

/// Builds the controller and runs it until a signal arrives.
pub async fn run(cfg: Config) -> Result<()> {
    let mut controller = Controller::build(cfg).await?;
    let mut shutdown_rx = install_signal_handler()?;

    info!("supervisor loop running");

    loop {
        if shutdown_rx.borrow().is_some() {
            break;
        }

        // A panic anywhere in the tick body must not kill the
        // process with actuators energized: emergency-stop, wait,
        // and try again.

        let outcome =
            AssertUnwindSafe(controller.tick()).catch_unwind().await;

        let pause = match outcome {
            Ok(()) => TICK,

            Err(_) => {
                error!("main loop failure -- emergency stop triggered");
                controller.pump.hard_stop();
                controller.heater.hard_stop();
                controller.color.hard_stop();
                FAILURE_PAUSE
            }
        };

        tokio::select! {
            _ = sleep(pause) => (),
            _ = shutdown_rx.changed() => break,
        }
    }

    let signal = (*shutdown_rx.borrow()).unwrap_or("MANUAL");

    controller.shutdown(signal).await;
    Ok(())
}
