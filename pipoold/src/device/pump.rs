//! The circulation pump. Every state or mode mutation happens under
//! one exclusive gate; the heater is the only other component allowed
//! to hold that gate, which is what makes its verify-and-energize
//! activation atomic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

use crate::{relay::RelayBoard, store::Recorder, timer::Timer};

pub const STATE_TOPIC: &str = "pump_state";
const RUNTIME_TOPIC: &str = "pump_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Off,
    On,
}

impl PumpState {
    pub fn label(self) -> &'static str {
        match self {
            PumpState::Off => "OFF",
            PumpState::On => "ON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Off,

    /// Run until the session timer passes the given number of
    /// minutes, then stop.
    RunForDuration { minutes: u64 },
}

/// Everything the state gate protects.

pub(crate) struct PumpCore {
    state: PumpState,
    mode: PumpMode,
    timer: Timer,
}

impl PumpCore {
    pub(crate) fn is_on(&self) -> bool {
        self.state == PumpState::On
    }
}

pub struct Pump {
    relay: Arc<RelayBoard>,
    port: u8,
    recorder: Recorder,
    core: Mutex<PumpCore>,
}

impl Pump {
    pub fn new(relay: Arc<RelayBoard>, port: u8, recorder: Recorder) -> Pump {
        Pump {
            relay,
            port,
            recorder,
            core: Mutex::new(PumpCore {
                state: PumpState::Off,
                mode: PumpMode::Off,
                timer: Timer::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PumpCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the state gate to the heater so it can compose its
    /// dual-gated activation. No other component may take this; lock
    /// order is always heater gate first, then this one.
    pub(crate) fn state_gate(&self) -> MutexGuard<'_, PumpCore> {
        self.lock()
    }

    // The locked bodies. Public entry points acquire the gate once
    // and delegate here, so a locked routine can call another without
    // needing a reentrant primitive.

    fn on_locked(&self, core: &mut PumpCore) {
        info!("pump {} -> ON", core.state.label());

        if core.state == PumpState::On {
            return;
        }

        self.recorder.state_event(STATE_TOPIC, "OFF", "ON");

        if let Err(e) = self.relay.port_on(self.port) {
            error!("pump relay write failed -- {}", e)
        }
        core.state = PumpState::On;

        // A timed run already started the timer when the mode was
        // entered.

        if !matches!(core.mode, PumpMode::RunForDuration { .. }) {
            core.timer.start()
        }
    }

    fn off_locked(&self, core: &mut PumpCore) {
        info!("pump {} -> OFF", core.state.label());

        if core.state == PumpState::Off {
            return;
        }

        self.recorder.state_event(STATE_TOPIC, "ON", "OFF");

        if let Err(e) = self.relay.port_off(self.port) {
            error!("pump relay write failed -- {}", e)
        }
        core.state = PumpState::Off;
        self.clear_mode_locked(core);

        let (start, elapsed) = core.timer.stop();

        self.recorder.duration(RUNTIME_TOPIC, start, elapsed);
    }

    fn clear_mode_locked(&self, core: &mut PumpCore) {
        if core.mode != PumpMode::Off {
            info!("pump mode {:?} -> Off", core.mode);
            self.recorder.opaque_event("pump_mode_off", None);
        }

        core.mode = PumpMode::Off
    }

    pub fn on(&self) {
        let mut core = self.lock();

        self.on_locked(&mut core)
    }

    pub fn off(&self) {
        let mut core = self.lock();

        self.off_locked(&mut core)
    }

    /// Emergency stop. Records the hard stop, then runs the normal
    /// off sequence.
    pub fn hard_stop(&self) {
        info!("pump HARD STOP");
        self.recorder.opaque_event("pump_hard_stop", None);
        self.off()
    }

    /// Starts the pump and arms the run-for-duration mode: the
    /// session timer is restarted so the deadline counts from now.
    pub fn set_run_for_minutes_and_stop(&self, minutes: u64) {
        info!("pump will run for {} minutes and stop", minutes);
        self.recorder.opaque_event(
            "pump_run_for_x_minutes",
            Some(serde_json::json!(minutes)),
        );

        let mut core = self.lock();

        // Flush whatever session was in progress, then measure the
        // timed run from scratch.

        let (start, elapsed) = core.timer.stop();

        self.recorder.duration(RUNTIME_TOPIC, start, elapsed);
        core.timer.start();
        core.mode = PumpMode::RunForDuration { minutes };
        self.on_locked(&mut core)
    }

    /// Clears any timed mode and stops the pump.
    pub fn set_mode_off(&self) {
        let mut core = self.lock();

        self.clear_mode_locked(&mut core);
        self.off_locked(&mut core)
    }

    /// Per-tick housekeeping: reconciles mode with state and enforces
    /// the run-for-duration deadline.
    pub fn run_one_tick(&self) {
        let mut core = self.lock();

        if core.state == PumpState::Off && core.mode != PumpMode::Off {
            self.clear_mode_locked(&mut core);
            return;
        }

        if let PumpMode::RunForDuration { minutes } = core.mode {
            let elapsed_minutes = core.timer.elapsed_seconds() / 60.0;

            if elapsed_minutes > minutes as f64 {
                self.off_locked(&mut core);
                return;
            }

            info!(
                "pump on timer -- elapsed: {:.2} min, target: {} min",
                elapsed_minutes, minutes
            )
        }
    }

    pub fn is_on(&self) -> bool {
        self.lock().is_on()
    }

    pub fn state(&self) -> PumpState {
        self.lock().state
    }

    pub fn mode(&self) -> PumpMode {
        self.lock().mode
    }

    // Broker message handlers. Payloads are the bare state labels.

    pub fn handle_state_message(&self, data: &str) {
        match data {
            "ON" => self.on(),
            "OFF" => self.off(),
            _ => error!("pump state message ignored -- {:?}", data),
        }
    }

    pub fn handle_on_message(&self, data: &str) {
        if data == "ON" {
            self.on()
        }
    }

    pub fn handle_off_message(&self, data: &str) {
        if data == "OFF" {
            self.off()
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_timer(&self, secs: u64) {
        self.lock().timer.backdate(secs)
    }
}
