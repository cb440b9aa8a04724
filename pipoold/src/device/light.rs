//! The pool light. The relay itself is trivial; the interesting part
//! is `cycle`, which must never block the supervisor tick. Cycles
//! run on their own task, serialized behind an async gate, and a
//! watch channel tracks how many cycle tasks are outstanding so
//! tests (and shutdown) can wait for quiescence.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    sync::watch,
    time::{sleep, timeout, Duration},
};
use tracing::{info, warn};

use crate::relay::RelayBoard;

pub const STATE_TOPIC: &str = "light_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightState {
    Off,
    On,
}

impl LightState {
    pub fn label(self) -> &'static str {
        match self {
            LightState::Off => "OFF",
            LightState::On => "ON",
        }
    }
}

struct LightCore {
    state: LightState,
    last_on: Option<DateTime<Utc>>,
    last_off: Option<DateTime<Utc>>,
}

pub struct Light {
    relay: Arc<RelayBoard>,
    port: u8,
    core: Mutex<LightCore>,
    cycle_gate: tokio::sync::Mutex<()>,
    pending_tx: watch::Sender<u32>,
}

impl Light {
    pub fn new(relay: Arc<RelayBoard>, port: u8) -> Arc<Light> {
        let (pending_tx, _) = watch::channel(0);
        let light = Arc::new(Light {
            relay,
            port,
            core: Mutex::new(LightCore {
                state: LightState::Off,
                last_on: None,
                last_off: None,
            }),
            cycle_gate: tokio::sync::Mutex::new(()),
            pending_tx,
        });

        light.off();
        light
    }

    fn lock(&self) -> MutexGuard<'_, LightCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self) {
        info!("light on");

        let mut core = self.lock();

        core.last_on = Some(Utc::now());

        if let Err(e) = self.relay.port_on(self.port) {
            warn!("light relay write failed -- {}", e)
        }
        core.state = LightState::On
    }

    pub fn off(&self) {
        info!("light off");

        let mut core = self.lock();

        core.last_off = Some(Utc::now());

        if let Err(e) = self.relay.port_off(self.port) {
            warn!("light relay write failed -- {}", e)
        }
        core.state = LightState::Off
    }

    pub fn is_on(&self) -> bool {
        self.lock().state == LightState::On
    }

    pub fn state(&self) -> LightState {
        self.lock().state
    }

    /// How long the light has been off: zero while it is on, `None`
    /// if it has never been off.
    pub fn seconds_in_off_state(&self) -> Option<f64> {
        let core = self.lock();

        core.last_off.map(|last_off| {
            if core.state == LightState::On {
                0.0
            } else {
                (Utc::now() - last_off).num_milliseconds() as f64 / 1000.0
            }
        })
    }

    /// Cycles the light off/on `count` times with `delay` between
    /// toggles. Returns immediately; the work happens on its own
    /// task behind the cycle gate, so overlapping requests serialize
    /// rather than interleave.
    pub fn cycle(self: Arc<Self>, count: u32, delay: Duration) {
        if count == 0 {
            return;
        }

        if *self.pending_tx.borrow() > 0 {
            // TODO: overlapping cycles queue behind the gate today;
            // decide whether a second request should be rejected
            // outright instead.

            warn!("light cycle already in progress, queuing new cycle")
        }

        self.pending_tx.send_modify(|n| *n += 1);

        let light = self;

        tokio::spawn(async move {
            let _gate = light.cycle_gate.lock().await;

            for _ in 0..count {
                light.off();
                sleep(delay).await;
                light.on()
            }

            info!("light completed {} cycles", count);
            light.pending_tx.send_modify(|n| *n -= 1)
        });

        info!("light started {} cycles in background", count)
    }

    /// Waits until every outstanding cycle task has finished.
    /// Returns `false` on timeout.
    pub async fn wait_for_cycle(&self, limit: Option<Duration>) -> bool {
        let mut rx = self.pending_tx.subscribe();
        let done = async move {
            while *rx.borrow_and_update() > 0 {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match limit {
            None => {
                done.await;
                true
            }
            Some(limit) => timeout(limit, done).await.is_ok(),
        }
    }

    // Broker message handler; payload is the bare state label.

    pub fn handle_state_message(&self, data: &str) {
        match data {
            "ON" => self.on(),
            "OFF" => self.off(),
            _ => warn!("light state message ignored -- {:?}", data),
        }
    }
}
