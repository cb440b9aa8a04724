//! The pool heater. This is the safety core of the daemon: the
//! heater must never be energized without water circulating through
//! it, and it must shut itself down on stale or invalid sensor data,
//! excess temperature, or excess runtime.
//!
//! Activation composes two gates. The heater's own gate is acquired
//! first, then the pump's state gate; the pump observation and the
//! relay write both happen with both gates held, so the pump cannot
//! stop between the check and the energization. The order is fixed:
//! no call path anywhere takes the pump gate before the heater gate,
//! which is what rules out deadlock.

use serde_json::json;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

use super::pump::Pump;
use crate::{relay::RelayBoard, store::Recorder, timer::Timer};

pub const STATE_TOPIC: &str = "heater_state";
const RUNTIME_TOPIC: &str = "heater_time";

// A reading older than this is unusable for control decisions.

const MAX_SENSOR_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterState {
    Off,
    On,
}

impl HeaterState {
    pub fn label(self) -> &'static str {
        match self {
            HeaterState::Off => "OFF",
            HeaterState::On => "ON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterMode {
    Off,

    /// Cycle the heater to keep the water near the target.
    HoldAt { target: i64 },

    /// Heat until the target is reached, then stop and clear the
    /// mode.
    ReachAndStop { target: i64 },
}

struct HeaterCore {
    state: HeaterState,
    mode: HeaterMode,
    input_temp: f64,
    output_temp: f64,
    last_input_update: Option<Instant>,
    timer: Timer,
}

pub struct Heater {
    relay: Arc<RelayBoard>,
    port: u8,
    recorder: Recorder,
    max_water_temp: f64,
    max_runtime: Duration,
    pump: Option<Arc<Pump>>,
    core: Mutex<HeaterCore>,
}

impl Heater {
    /// Builds the heater and forces it into its safe state. A `None`
    /// pump disables the interlock and exists only for migration
    /// setups; production wiring always passes the pump.
    pub fn new(
        relay: Arc<RelayBoard>,
        port: u8,
        max_water_temp: f64,
        max_runtime_seconds: u64,
        pump: Option<Arc<Pump>>,
        recorder: Recorder,
    ) -> Heater {
        let heater = Heater {
            relay,
            port,
            recorder,
            max_water_temp,
            max_runtime: Duration::from_secs(max_runtime_seconds),
            pump,
            core: Mutex::new(HeaterCore {
                state: HeaterState::Off,
                mode: HeaterMode::Off,
                input_temp: 0.0,
                output_temp: 0.0,
                last_input_update: None,
                timer: Timer::new(),
            }),
        };

        heater.hard_stop();
        heater
    }

    fn lock(&self) -> MutexGuard<'_, HeaterCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Energizes the relay and updates the bookkeeping. Callers are
    // responsible for holding whatever gates the current path
    // requires.

    fn energize_locked(&self, core: &mut HeaterCore) {
        if core.state == HeaterState::Off {
            info!("heater OFF -> ON");
            self.recorder.state_event(STATE_TOPIC, "OFF", "ON");
        }

        if let Err(e) = self.relay.port_on(self.port) {
            error!("heater relay write failed -- {}", e)
        }
        core.state = HeaterState::On;
        core.timer.start()
    }

    // Deenergizes without touching the mode. The hold-at branch uses
    // this directly so the mode survives reaching the target.

    fn standby_locked(&self, core: &mut HeaterCore) {
        if core.state != HeaterState::Off {
            info!("heater {} -> OFF", core.state.label());
            self.recorder.state_event(STATE_TOPIC, "ON", "OFF");
        }

        // The relay write is unconditional: whatever the bookkeeping
        // says, an off request must leave the line inactive.

        if let Err(e) = self.relay.port_off(self.port) {
            error!("heater relay write failed -- {}", e)
        }
        core.state = HeaterState::Off;

        let (start, elapsed) = core.timer.stop();

        self.recorder.duration(RUNTIME_TOPIC, start, elapsed);
    }

    fn clear_mode_locked(&self, core: &mut HeaterCore) {
        if core.mode != HeaterMode::Off {
            info!("heater mode {:?} -> Off", core.mode);
            self.recorder.opaque_event("heater_mode_off", None);
        }

        core.mode = HeaterMode::Off
    }

    fn off_locked(&self, core: &mut HeaterCore) {
        self.standby_locked(core);
        self.clear_mode_locked(core)
    }

    fn hard_stop_locked(&self, core: &mut HeaterCore) {
        self.clear_mode_locked(core);
        self.off_locked(core)
    }

    // The critical section. With a pump configured, the pump's state
    // gate is held from the observation through the relay write, so
    // any concurrent `pump.off()` either completes before the
    // observation (the activation is refused) or blocks until the
    // heater is energized (and the next tick's interlock check stops
    // it again.)

    fn on_locked(&self, core: &mut HeaterCore) -> bool {
        match &self.pump {
            Some(pump) => {
                let pump_core = pump.state_gate();

                if !pump_core.is_on() {
                    error!("heater cannot turn on -- pump is not running");
                    self.recorder
                        .opaque_event("heater_blocked_no_pump", Some(json!({})));
                    return false;
                }

                self.energize_locked(core);
                true
            }

            None => {
                warn!("heater activated without pump reference (no safety interlock)");
                self.energize_locked(core);
                true
            }
        }
    }

    /// Attempts to energize the heater. Returns `false` when the
    /// pump interlock refuses the activation.
    pub fn on(&self) -> bool {
        let mut core = self.lock();

        self.on_locked(&mut core)
    }

    /// Deenergizes, clears the mode, and flushes the runtime.
    /// Idempotent.
    pub fn off(&self) {
        let mut core = self.lock();

        self.off_locked(&mut core)
    }

    /// Emergency stop. Always succeeds regardless of preceding
    /// state.
    pub fn hard_stop(&self) {
        info!("heater HARD STOP");

        let mut core = self.lock();

        self.hard_stop_locked(&mut core)
    }

    /// Feeds the heater its intake temperature. A missing or
    /// non-positive reading is a sensor failure and forces a hard
    /// stop in the same call.
    pub fn set_input_temp(&self, reading: Option<f64>) {
        let mut core = self.lock();

        match reading {
            Some(temp) if temp > 0.0 => {
                core.input_temp = temp;
                core.last_input_update = Some(Instant::now())
            }

            _ => {
                error!("invalid input temperature, stopping for safety");
                self.hard_stop_locked(&mut core)
            }
        }
    }

    pub fn set_output_temp(&self, reading: Option<f64>) {
        if let Some(temp) = reading {
            self.lock().output_temp = temp
        }
    }

    pub fn set_mode_hold_at(&self, target: i64) {
        info!("heater mode HoldAt {}", target);
        self.recorder
            .opaque_event("heater_mode_hold_temp", Some(json!(target)));
        self.lock().mode = HeaterMode::HoldAt { target }
    }

    pub fn set_mode_reach_and_stop(&self, target: i64) {
        info!("heater mode ReachAndStop {}", target);
        self.recorder
            .opaque_event("heater_mode_reach_and_stop", Some(json!(target)));
        self.lock().mode = HeaterMode::ReachAndStop { target }
    }

    pub fn set_mode_off(&self) {
        let mut core = self.lock();

        self.clear_mode_locked(&mut core)
    }

    /// The per-tick safety cascade. Ordered so that the dangerous
    /// conditions are checked before any mode logic runs; the first
    /// matching step wins.
    pub fn run_one_tick(&self) {
        let mut core = self.lock();

        if core.state == HeaterState::On {
            // The interlock, re-verified every tick. The pump gate is
            // taken after the heater gate, the only order allowed.

            if let Some(pump) = &self.pump {
                if !pump.is_on() {
                    error!("EMERGENCY -- pump stopped while heater running");
                    self.hard_stop_locked(&mut core);
                    self.recorder
                        .opaque_event("heater_emergency_pump_stopped", None);
                    return;
                }
            }

            let runtime = core.timer.elapsed_seconds();

            if runtime > self.max_runtime.as_secs_f64() {
                error!(
                    "SAFETY LIMIT -- maximum runtime of {:.1} hours exceeded",
                    self.max_runtime.as_secs_f64() / 3600.0
                );
                self.hard_stop_locked(&mut core);
                self.recorder.opaque_event(
                    "heater_max_runtime_exceeded",
                    Some(json!({
                        "runtime_seconds": runtime,
                        "limit_seconds": self.max_runtime.as_secs(),
                    })),
                );
                return;
            }
        }

        if let Some(updated) = core.last_input_update {
            let age = updated.elapsed();

            if age > MAX_SENSOR_AGE {
                error!(
                    "input sensor stale ({}s old), stopping for safety",
                    age.as_secs()
                );
                self.hard_stop_locked(&mut core);
                return;
            }
        }

        if core.state == HeaterState::Off {
            self.off_locked(&mut core);
            return;
        }

        if core.input_temp >= self.max_water_temp {
            self.off_locked(&mut core);
            return;
        }

        match core.mode {
            HeaterMode::ReachAndStop { target } => {
                if core.input_temp < target as f64 {
                    info!(
                        "heating from {} to {}",
                        core.input_temp, target
                    );
                    self.on_locked(&mut core);
                } else {
                    info!("target temp {} reached, stopping", target);
                    self.recorder.opaque_event(
                        "heater_mode_reach_and_stop",
                        Some(json!(format!("reached {}", target))),
                    );
                    self.off_locked(&mut core);
                }
            }

            HeaterMode::HoldAt { target } => {
                if core.input_temp < target as f64 {
                    info!(
                        "holding at {} -- water temp {}",
                        target, core.input_temp
                    );
                    self.on_locked(&mut core);
                } else {
                    // Keep the mode armed; only the relay goes off.

                    self.standby_locked(&mut core);
                }
            }

            HeaterMode::Off => (),
        }
    }

    pub fn is_on(&self) -> bool {
        self.lock().state == HeaterState::On
    }

    pub fn state(&self) -> HeaterState {
        self.lock().state
    }

    pub fn mode(&self) -> HeaterMode {
        self.lock().mode
    }

    pub fn input_temp(&self) -> f64 {
        self.lock().input_temp
    }

    pub fn output_temp(&self) -> f64 {
        self.lock().output_temp
    }

    pub fn input_temp_less_than(&self, target: i64) -> bool {
        self.lock().input_temp < target as f64
    }

    // Broker message handler; payload is the bare state label.

    pub fn handle_state_message(&self, data: &str) {
        match data {
            "ON" => {
                let _ = self.on();
            }
            "OFF" => self.off(),
            _ => error!("heater state message ignored -- {:?}", data),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_timer(&self, secs: u64) {
        self.lock().timer.backdate(secs)
    }

    #[cfg(test)]
    pub(crate) fn backdate_input_update(&self, secs: u64) {
        let mut core = self.lock();

        if let Some(updated) = core.last_input_update {
            core.last_input_update =
                Some(updated - Duration::from_secs(secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hal::sim::{GpioLevels, SimulatedGpio},
        store::{self, Record, RecordRx},
    };
    use pipool_api::hal::Level;

    const PUMP_PORT: u8 = 6;
    const HEATER_PORT: u8 = 7;
    const HEATER_PIN: u8 = 24;
    const PUMP_PIN: u8 = 23;

    const MAX_WATER: f64 = 30.0;
    const MAX_RUNTIME: u64 = 14_400;

    fn rig() -> (Arc<Pump>, Heater, GpioLevels, RecordRx) {
        let gpio = SimulatedGpio::new();
        let levels = gpio.levels();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let (recorder, rx) = store::channel();
        let pump =
            Arc::new(Pump::new(relay.clone(), PUMP_PORT, recorder.clone()));
        let heater = Heater::new(
            relay,
            HEATER_PORT,
            MAX_WATER,
            MAX_RUNTIME,
            Some(pump.clone()),
            recorder,
        );

        (pump, heater, levels, rx)
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

    #[test]
    fn test_blocked_without_pump_running() {
        let (_pump, heater, levels, rx) = rig();
        let _ = rx.drain();

        assert!(!heater.on());
        assert!(!heater.is_on());
        assert_eq!(levels.get(HEATER_PIN), Some(Level::High));
        assert!(opaque_names(&rx).contains(&"heater_blocked_no_pump".into()));
    }

    #[test]
    fn test_on_with_pump_running() {
        let (pump, heater, levels, rx) = rig();

        pump.on();
        let _ = rx.drain();

        assert!(heater.on());
        assert!(heater.is_on());
        assert_eq!(levels.get(HEATER_PIN), Some(Level::Low));

        let records = rx.drain();

        assert!(records.iter().any(|r| matches!(r,
            Record::StateEvent { name, from, to, .. }
                if name == STATE_TOPIC && from == "OFF" && to == "ON")));
    }

    #[test]
    fn test_no_pump_reference_skips_interlock() {
        let gpio = SimulatedGpio::new();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let (recorder, _rx) = store::channel();
        let heater = Heater::new(
            relay,
            HEATER_PORT,
            MAX_WATER,
            MAX_RUNTIME,
            None,
            recorder,
        );

        assert!(heater.on());
        assert!(heater.is_on());
    }

    #[test]
    fn test_emergency_stop_when_pump_lost() {
        let (pump, heater, levels, rx) = rig();

        pump.on();
        assert!(heater.on());

        // The pump drops out from under the running heater; the next
        // tick must kill the heater.

        pump.off();
        let _ = rx.drain();

        heater.run_one_tick();
        assert!(!heater.is_on());
        assert_eq!(levels.get(HEATER_PIN), Some(Level::High));
        assert!(opaque_names(&rx)
            .contains(&"heater_emergency_pump_stopped".into()));
    }

    #[test]
    fn test_max_runtime_boundary() {
        let (pump, heater, _, rx) = rig();

        pump.on();
        heater.set_input_temp(Some(22.0));
        assert!(heater.on());

        // Just under the limit the heater keeps running; the check
        // is strictly greater-than.

        heater.backdate_timer(MAX_RUNTIME - 1);
        heater.set_mode_hold_at(28);
        heater.run_one_tick();
        assert!(heater.is_on());

        // Past the limit the next tick trips the limiter.

        heater.backdate_timer(2);
        let _ = rx.drain();
        heater.run_one_tick();
        assert!(!heater.is_on());
        assert_eq!(heater.mode(), HeaterMode::Off);
        assert!(opaque_names(&rx)
            .contains(&"heater_max_runtime_exceeded".into()));
    }

    #[test]
    fn test_stale_sensor_stops_heater() {
        let (pump, heater, _, _rx) = rig();

        pump.on();
        heater.set_input_temp(Some(25.0));
        assert!(heater.on());

        heater.backdate_input_update(61);
        heater.run_one_tick();
        assert!(!heater.is_on());
    }

    #[test]
    fn test_fresh_sensor_keeps_heater() {
        let (pump, heater, _, _rx) = rig();

        pump.on();
        heater.set_input_temp(Some(25.0));
        heater.set_mode_hold_at(28);
        assert!(heater.on());

        heater.backdate_input_update(59);
        heater.run_one_tick();
        assert!(heater.is_on());
    }

    #[test]
    fn test_invalid_reading_hard_stops() {
        let (pump, heater, _, _rx) = rig();

        pump.on();
        heater.set_input_temp(Some(25.0));
        assert!(heater.on());

        heater.set_input_temp(None);
        assert!(!heater.is_on());

        assert!(heater.on());
        heater.set_input_temp(Some(-2.0));
        assert!(!heater.is_on());

        assert!(heater.on());
        heater.set_input_temp(Some(0.0));
        assert!(!heater.is_on());
    }

    #[test]
    fn test_max_water_temp_boundary() {
        let (pump, heater, _, _rx) = rig();

        pump.on();
        heater.set_mode_hold_at(40);

        // Just under the limit: keeps heating.

        heater.set_input_temp(Some(MAX_WATER - 0.1));
        assert!(heater.on());
        heater.run_one_tick();
        assert!(heater.is_on());

        // Exactly at the limit: off in the same tick.

        heater.set_input_temp(Some(MAX_WATER));
        heater.run_one_tick();
        assert!(!heater.is_on());
    }

    #[test]
    fn test_reach_and_stop_completes() {
        let (pump, heater, _, rx) = rig();

        pump.on();
        heater.set_input_temp(Some(22.0));
        assert!(heater.on());
        heater.set_mode_reach_and_stop(28);

        heater.run_one_tick();
        assert!(heater.is_on());

        // The water crosses the target; the mode is one-shot.

        heater.set_input_temp(Some(28.5));
        let _ = rx.drain();
        heater.run_one_tick();
        assert!(!heater.is_on());
        assert_eq!(heater.mode(), HeaterMode::Off);
        assert!(opaque_names(&rx)
            .contains(&"heater_mode_reach_and_stop".into()));
    }

    #[test]
    fn test_hold_at_keeps_mode_on_standby() {
        let (pump, heater, _, _rx) = rig();

        pump.on();
        heater.set_input_temp(Some(27.0));
        assert!(heater.on());
        heater.set_mode_hold_at(26);

        // Water warmer than the hold target: relay opens but the
        // mode stays armed for this tick.

        heater.run_one_tick();
        assert!(!heater.is_on());
        assert_eq!(heater.mode(), HeaterMode::HoldAt { target: 26 });
    }

    #[test]
    fn test_hard_stop_idempotent() {
        let (pump, heater, levels, _rx) = rig();

        pump.on();
        assert!(heater.on());

        heater.hard_stop();
        heater.hard_stop();
        assert!(!heater.is_on());
        assert_eq!(heater.mode(), HeaterMode::Off);
        assert_eq!(levels.get(HEATER_PIN), Some(Level::High));
    }

    // The race the dual-gated activation exists for: one thread
    // energizing the heater while another stops the pump. Whoever
    // wins the gates, there is never an instant where the heater line
    // went active after the pump line went inactive.

    #[test]
    fn test_activation_race_with_pump_stop() {
        for _ in 0..50 {
            let (pump, heater, levels, rx) = rig();

            pump.on();
            heater.set_input_temp(Some(22.0));
            let _ = rx.drain();

            let heater = Arc::new(heater);

            let t_on = {
                let heater = heater.clone();

                std::thread::spawn(move || heater.on())
            };
            let t_off = {
                let pump = pump.clone();

                std::thread::spawn(move || pump.off())
            };

            let energized = t_on.join().unwrap();
            t_off.join().unwrap();

            if energized {
                // The heater won the gates: its activation write must
                // precede the pump's deactivation write, and the next
                // tick cleans up.

                let writes = levels.all_writes();
                let heater_on = writes
                    .iter()
                    .position(|w| *w == (HEATER_PIN, Level::Low))
                    .unwrap();
                let pump_off = writes
                    .iter()
                    .position(|w| *w == (PUMP_PIN, Level::High))
                    .unwrap();

                assert!(heater_on < pump_off);

                heater.run_one_tick();
                assert!(!heater.is_on());
            } else {
                // The pump stop won: the heater was refused and its
                // line never went active.

                assert!(!heater.is_on());
                assert!(!levels
                    .all_writes()
                    .contains(&(HEATER_PIN, Level::Low)));
                assert!(opaque_names(&rx)
                    .contains(&"heater_blocked_no_pump".into()));
            }
        }
    }
}
