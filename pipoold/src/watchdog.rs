//! The independent safety auditor. Once per supervisor tick it
//! re-asserts the invariants the actuators are supposed to uphold
//! themselves, and escalates connectivity loss: no network or no
//! broker means nobody can reach the controller, so heating stops,
//! and a long broker outage stops circulation too.

use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::{
    bus::MessageBus,
    device::{heater::Heater, pump::Pump},
    pinger::Pinger,
    store::Recorder,
};

// A broker outage longer than this stops the pump as well.

const EXTENDED_OUTAGE: Duration = Duration::from_secs(300);

pub struct Watchdog {
    pump: Arc<Pump>,
    heater: Arc<Heater>,
    pinger: Arc<Pinger>,
    bus: Arc<MessageBus>,
    recorder: Recorder,
    mqtt_down_since: Option<Instant>,
}

impl Watchdog {
    pub fn new(
        pump: Arc<Pump>,
        heater: Arc<Heater>,
        pinger: Arc<Pinger>,
        bus: Arc<MessageBus>,
        recorder: Recorder,
    ) -> Watchdog {
        Watchdog {
            pump,
            heater,
            pinger,
            bus,
            recorder,
            mqtt_down_since: None,
        }
    }

    /// Runs the audit. Heater checks come first: a heater problem is
    /// the dangerous one.
    ///
    /// TODO: during a persistent outage the hard stops and their
    /// events repeat every tick; they are idempotent but noisy, and
    /// the events could be de-duplicated to one per outage.
    pub fn check(&mut self) {
        // The interlock, asserted independently of the heater's own
        // tick. The pump is already off here; only the heater moves.

        if self.heater.is_on() && !self.pump.is_on() {
            error!("SAFETY VIOLATION -- heater on without pump");
            self.heater.hard_stop();
            self.recorder.opaque_event(
                "watchdog_heater_emergency_stop",
                Some(json!({ "reason": "pump_not_running" })),
            );
        }

        self.check_network();
        self.check_bus()
    }

    // Network loss stops heating only; circulation is safe and
    // useful without connectivity.

    fn check_network(&mut self) {
        if !self.pinger.is_connected() {
            warn!("network connectivity lost");
            self.heater.hard_stop();
            self.recorder.opaque_event("watchdog_network_loss", None);
        }
    }

    fn check_bus(&mut self) {
        if !self.bus.is_connected() {
            let since = *self.mqtt_down_since.get_or_insert_with(|| {
                warn!("MQTT disconnection detected");
                Instant::now()
            });

            // Nudge the reconnect; the attempt itself happens on the
            // bus task.

            self.bus.connect();

            // No broker means no remote stop button, so no heating.

            if self.heater.is_on() {
                warn!("stopping heater due to MQTT loss -- no remote control");
                self.heater.hard_stop();
                self.recorder
                    .opaque_event("watchdog_mqtt_heater_stop", None);
            }

            let outage = since.elapsed();

            if outage > EXTENDED_OUTAGE {
                error!(
                    "MQTT offline for {}s -- full safety stop",
                    outage.as_secs()
                );
                self.pump.hard_stop();
                self.heater.hard_stop();
                self.recorder.opaque_event(
                    "watchdog_mqtt_extended_outage",
                    Some(json!({ "duration_seconds": outage.as_secs() })),
                );
            }
        } else if let Some(since) = self.mqtt_down_since.take() {
            let outage = since.elapsed();

            info!("MQTT reconnected after {}s", outage.as_secs());
            self.recorder.opaque_event(
                "watchdog_mqtt_reconnected",
                Some(json!({ "outage_duration_seconds": outage.as_secs() })),
            );
        }
    }
}
