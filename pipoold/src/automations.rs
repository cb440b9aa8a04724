//! Composite commands built on top of the single-actuator
//! operations. The important one is "heat to T", which must start
//! the pump first, let water circulate, and only then energize the
//! heater -- re-verifying the pump after the dwell because anything
//! can happen in five seconds.

use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};

use crate::{
    device::{heater::Heater, pump::Pump},
    store::Recorder,
};

/// Dwell between starting the pump and energizing the heater, so
/// flow is established and the heater can't dry-fire.
const PUMP_CIRCULATION_DELAY: Duration = Duration::from_secs(5);

// Operator-facing target range. Anything outside is refused at this
// boundary; the heater's own limits are a separate, later line of
// defense.

const MIN_TARGET_TEMP: i64 = 1;
const MAX_TARGET_TEMP: i64 = 45;

pub struct Automations {
    pump: Arc<Pump>,
    heater: Arc<Heater>,
    recorder: Recorder,
    circulation_delay: Duration,
}

impl Automations {
    pub fn new(
        pump: Arc<Pump>,
        heater: Arc<Heater>,
        recorder: Recorder,
    ) -> Arc<Automations> {
        Arc::new(Automations {
            pump,
            heater,
            recorder,
            circulation_delay: PUMP_CIRCULATION_DELAY,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_delay(
        pump: Arc<Pump>,
        heater: Arc<Heater>,
        recorder: Recorder,
        circulation_delay: Duration,
    ) -> Arc<Automations> {
        Arc::new(Automations {
            pump,
            heater,
            recorder,
            circulation_delay,
        })
    }

    /// Handles `heater_reach_and_stop` payloads:
    /// `{"mode": "ON"|"OFF", "targetTemp": 1..45}`.
    ///
    /// Runs on the broker worker, so the circulation dwell is pushed
    /// onto a one-shot task instead of blocking here.
    pub fn handle_heater_reach_and_stop(&self, data: &str) {
        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => {
                error!("invalid JSON in heater command -- {}", e);
                return;
            }
        };

        info!("heater reach-and-stop payload: {}", payload);

        let mode = match payload.get("mode").and_then(Value::as_str) {
            Some(mode) => mode,
            None => {
                error!("missing 'mode' in heater command");
                return;
            }
        };

        match mode {
            "OFF" => {
                info!("stopping heater via automation");
                self.heater.off()
            }

            "ON" => {
                let target = payload
                    .get("targetTemp")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);

                if !(MIN_TARGET_TEMP..=MAX_TARGET_TEMP).contains(&target) {
                    error!(
                        "targetTemp {} out of range ({}-{}C)",
                        target, MIN_TARGET_TEMP, MAX_TARGET_TEMP
                    );
                    return;
                }

                if !self.heater.input_temp_less_than(target) {
                    info!(
                        "water already at or above {}C, not starting heater",
                        target
                    );
                    return;
                }

                // Pump first; heater after the circulation dwell.

                info!("starting pump for heating to {}C", target);
                self.pump.on();

                info!(
                    "scheduling heater start in {:?}",
                    self.circulation_delay
                );

                let pump = self.pump.clone();
                let heater = self.heater.clone();
                let recorder = self.recorder.clone();
                let delay = self.circulation_delay;

                tokio::spawn(async move {
                    sleep(delay).await;
                    Self::start_heater_after_delay(
                        &pump, &heater, &recorder, target,
                    )
                });
            }

            other => {
                error!("invalid mode {:?}, expected 'ON' or 'OFF'", other)
            }
        }
    }

    // The delayed half of the heating sequence. The pump could have
    // been stopped by anyone during the dwell, so its state is
    // checked again; the heater's own activation then re-verifies it
    // under the gates.

    fn start_heater_after_delay(
        pump: &Pump,
        heater: &Heater,
        recorder: &Recorder,
        target: i64,
    ) {
        if !pump.is_on() {
            error!("pump not running after delay -- heater NOT started");
            recorder.opaque_event(
                "automation_heater_blocked",
                Some(json!({ "reason": "pump_stopped_during_delay" })),
            );
            return;
        }

        info!("starting heater after circulation established");

        if heater.on() {
            heater.set_mode_reach_and_stop(target);
            recorder.opaque_event(
                "automation_heating_started",
                Some(json!({ "target_temp": target })),
            )
        } else {
            error!("heater failed to start")
        }
    }

    /// Handles `pump_run_for_x_minutes` payloads:
    /// `{"mode": "ON"|"OFF", "durationInMinutes": n}`.
    pub fn handle_pump_run_for_minutes(&self, data: &str) {
        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => {
                error!("invalid JSON in pump command -- {}", e);
                return;
            }
        };

        info!("pump run-for-minutes payload: {}", payload);

        match payload.get("mode").and_then(Value::as_str) {
            Some("ON") => {
                let minutes = payload
                    .get("durationInMinutes")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);

                if minutes <= 0 {
                    error!("invalid durationInMinutes -- {}", payload);
                    return;
                }

                self.pump.set_run_for_minutes_and_stop(minutes as u64)
            }

            Some("OFF") => self.pump.set_mode_off(),

            _ => error!("invalid mode in pump command -- {}", payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{heater::HeaterMode, pump::PumpMode},
        hal::sim::SimulatedGpio,
        relay::RelayBoard,
        store::{self, Record, RecordRx},
    };

    const PUMP_PORT: u8 = 6;
    const HEATER_PORT: u8 = 7;

    fn rig() -> (Arc<Pump>, Arc<Heater>, Arc<Automations>, RecordRx) {
        let gpio = SimulatedGpio::new();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let (recorder, rx) = store::channel();
        let pump =
            Arc::new(Pump::new(relay.clone(), PUMP_PORT, recorder.clone()));
        let heater = Arc::new(Heater::new(
            relay,
            HEATER_PORT,
            30.0,
            14_400,
            Some(pump.clone()),
            recorder.clone(),
        ));
        let automations = Automations::with_delay(
            pump.clone(),
            heater.clone(),
            recorder,
            Duration::from_millis(10),
        );

        (pump, heater, automations, rx)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await
    }

    fn opaque_names(rx: &RecordRx) -> Vec<String> {
        rx.drain()
            .into_iter()
            .filter_map(|r| match r {
                Record::OpaqueEvent { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pump_first_heating_sequence() {
        let (pump, heater, automations, rx) = rig();

        heater.set_input_temp(Some(22.0));
        let _ = rx.drain();

        automations.handle_heater_reach_and_stop(
            r#"{"mode":"ON","targetTemp":28}"#,
        );

        // The pump starts immediately; the heater only after the
        // dwell.

        assert!(pump.is_on());
        assert!(!heater.is_on());

        settle().await;
        assert!(heater.is_on());
        assert_eq!(heater.mode(), HeaterMode::ReachAndStop { target: 28 });
        assert!(opaque_names(&rx)
            .contains(&"automation_heating_started".into()));
    }

    #[tokio::test]
    async fn test_pump_lost_during_dwell_blocks_heater() {
        let (pump, heater, automations, rx) = rig();

        heater.set_input_temp(Some(22.0));
        let _ = rx.drain();

        automations.handle_heater_reach_and_stop(
            r#"{"mode":"ON","targetTemp":28}"#,
        );
        assert!(pump.is_on());

        // Someone stops the pump while the water is (supposedly)
        // circulating.

        pump.off();
        settle().await;

        assert!(!heater.is_on());
        assert!(opaque_names(&rx)
            .contains(&"automation_heater_blocked".into()));
    }

    #[tokio::test]
    async fn test_off_mode_stops_heater() {
        let (pump, heater, automations, _rx) = rig();

        pump.on();
        heater.set_input_temp(Some(22.0));
        assert!(heater.on());

        automations.handle_heater_reach_and_stop(r#"{"mode":"OFF"}"#);
        assert!(!heater.is_on());
    }

    #[tokio::test]
    async fn test_target_range_enforced() {
        let (pump, _heater, automations, _rx) = rig();

        for payload in [
            r#"{"mode":"ON","targetTemp":0}"#,
            r#"{"mode":"ON","targetTemp":46}"#,
            r#"{"mode":"ON","targetTemp":-5}"#,
            r#"{"mode":"ON"}"#,
            r#"{"mode":"ON","targetTemp":"warm"}"#,
        ] {
            automations.handle_heater_reach_and_stop(payload);
            assert!(!pump.is_on(), "payload accepted: {}", payload);
        }
    }

    #[tokio::test]
    async fn test_malformed_payloads_dropped() {
        let (pump, heater, automations, _rx) = rig();

        automations.handle_heater_reach_and_stop("not json");
        automations.handle_heater_reach_and_stop(r#"{"targetTemp":28}"#);
        automations
            .handle_heater_reach_and_stop(r#"{"mode":"MAYBE","targetTemp":28}"#);

        assert!(!pump.is_on());
        assert!(!heater.is_on());
    }

    #[tokio::test]
    async fn test_already_warm_skips_heating() {
        let (pump, heater, automations, _rx) = rig();

        heater.set_input_temp(Some(29.0));
        automations.handle_heater_reach_and_stop(
            r#"{"mode":"ON","targetTemp":28}"#,
        );

        assert!(!pump.is_on());
        assert!(!heater.is_on());
    }

    #[tokio::test]
    async fn test_pump_run_for_minutes() {
        let (pump, _heater, automations, _rx) = rig();

        automations.handle_pump_run_for_minutes(
            r#"{"mode":"ON","durationInMinutes":45}"#,
        );
        assert!(pump.is_on());
        assert_eq!(pump.mode(), PumpMode::RunForDuration { minutes: 45 });

        automations.handle_pump_run_for_minutes(r#"{"mode":"OFF"}"#);
        assert!(!pump.is_on());
        assert_eq!(pump.mode(), PumpMode::Off);
    }

    #[tokio::test]
    async fn test_pump_run_bad_duration_dropped() {
        let (pump, _heater, automations, _rx) = rig();

        automations.handle_pump_run_for_minutes(r#"{"mode":"ON"}"#);
        automations.handle_pump_run_for_minutes(
            r#"{"mode":"ON","durationInMinutes":0}"#,
        );
        automations.handle_pump_run_for_minutes(
            r#"{"mode":"ON","durationInMinutes":-3}"#,
        );

        assert!(!pump.is_on());
    }
}
