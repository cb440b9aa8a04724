//! Driver for the power-cycled LED fixture. The fixture has no data
//! link: programs are selected by timed power cycles on the light
//! relay. Turning the light off and back on within 10 seconds
//! advances one program; off then 11-14 seconds idle then on drops it
//! back to program #1; and after more than 60 seconds dark the
//! fixture wakes into a 15-second white "check" state before
//! resuming, which the driver must wait out before cycling further.
//!
//! Commands are serialized through a FIFO drained by a dedicated
//! worker. A sticky interrupt latch aborts the current command at its
//! next sleep boundary and is consumed when the worker dequeues.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{info, warn};

use super::light::Light;

/// Sentinel id that forces a full resynchronization before selecting
/// program #1.
pub const RESET_COLOR_ID: u16 = 1000;

const COLOR_COUNT: u16 = 17;

// The fixture's program table, in power-cycle order.

const COLORS: [(&str, &str); COLOR_COUNT as usize] = [
    ("show", "Fast Color Wash"),
    ("fixed", "Deep Blue Sea"),
    ("fixed", "Royal Blue"),
    ("fixed", "Afternoon Skies"),
    ("fixed", "Aqua Green"),
    ("fixed", "Emerald"),
    ("fixed", "Cloud White"),
    ("fixed", "Warm Red"),
    ("fixed", "Flamingo"),
    ("fixed", "Vivid Violet"),
    ("fixed", "Sangria"),
    ("show", "Slow Color Wash"),
    ("show", "Blue/Cyan/White Fade"),
    ("show", "Blue/Green/Magenta Fade"),
    ("show", "Red/White/Blue Switch"),
    ("show", "Fast Random Fade - Mardi Gras"),
    ("show", "Fast Random Fade - Cool Cabaret"),
];

/// The timed waits of the power-cycle protocol.

#[derive(Clone, Copy)]
struct Delays {
    /// One program-advance pulse edge.
    switch: Duration,

    /// Between the off and on of a plain toggle.
    between_switches: Duration,

    /// Rides out the white "check" state after a long dark period.
    white_check: Duration,

    /// The 11-14 second idle that resynchronizes to program #1.
    resync: Duration,
}

const DELAYS: Delays = Delays {
    switch: Duration::from_millis(1300),
    between_switches: Duration::from_millis(1200),
    white_check: Duration::from_secs(17),
    resync: Duration::from_secs(12),
};

// Off-durations beyond this put the fixture into its white check
// state at the next power-on.

const WHITE_CHECK_THRESHOLD_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorCommand {
    Reset,
    Next,
    Set(u16),
}

struct ColorCore {
    current_color_id: u16,
    position_known: bool,
}

pub struct ColorDriver {
    light: Arc<Light>,
    delays: Delays,
    queue: Mutex<VecDeque<ColorCommand>>,
    wake: Notify,
    interrupt: AtomicBool,
    busy: AtomicBool,
    running: AtomicBool,
    core: Mutex<ColorCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ColorDriver {
    pub fn new(light: Arc<Light>) -> Arc<ColorDriver> {
        Self::with_delays(light, DELAYS)
    }

    fn with_delays(light: Arc<Light>, delays: Delays) -> Arc<ColorDriver> {
        Arc::new(ColorDriver {
            light,
            delays,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            interrupt: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            running: AtomicBool::new(true),
            core: Mutex::new(ColorCore {
                current_color_id: 0,
                position_known: false,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Protocol waits scaled down for tests so a full reset takes
    /// milliseconds instead of half a minute.
    #[cfg(test)]
    pub(crate) fn for_test(light: Arc<Light>) -> Arc<ColorDriver> {
        Self::with_delays(
            light,
            Delays {
                switch: Duration::from_millis(2),
                between_switches: Duration::from_millis(2),
                white_check: Duration::from_millis(5),
                resync: Duration::from_millis(5),
            },
        )
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<ColorCommand>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_core(&self) -> MutexGuard<'_, ColorCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker that drains the command queue. Called once
    /// at boot.
    pub fn start(self: Arc<Self>) {
        let driver = self.clone();
        let handle = tokio::spawn(async move { driver.run().await });

        *self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle)
    }

    async fn run(&self) {
        info!("color driver starting");

        while self.running.load(Ordering::SeqCst) {
            let cmd = self.lock_queue().pop_front();

            let Some(cmd) = cmd else {
                self.wake.notified().await;
                continue;
            };

            // The latch is consumed here: an interrupt posted while
            // the queue was idle skips exactly one command.

            if self.interrupt.swap(false, Ordering::SeqCst) {
                info!("color command skipped due to interrupt");
                continue;
            }

            self.busy.store(true, Ordering::SeqCst);
            info!("processing color command {:?}", cmd);

            match cmd {
                ColorCommand::Reset => {
                    self.do_reset().await;
                }
                ColorCommand::Next => self.do_next().await,
                ColorCommand::Set(id) => self.do_set(id).await,
            }

            self.busy.store(false, Ordering::SeqCst);
        }

        info!("color driver stopped")
    }

    // Sleeps for `duration` but returns early (and `false`) when the
    // interrupt latch is raised. Every wait of the protocol goes
    // through here, which is what bounds the interrupt latency.

    async fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;

        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                return false;
            }

            if Instant::now() >= deadline {
                return true;
            }

            tokio::select! {
                _ = sleep_until(deadline) => (),
                _ = self.wake.notified() => (),
            }
        }
    }

    // Off, idle past the resync window, on: the fixture lands on
    // program #1 and the driver finally knows where it is.

    async fn do_reset(&self) -> bool {
        info!("resetting light to first color");

        self.light.off();
        if !self.pause(self.delays.between_switches).await {
            return false;
        }

        self.light.on();
        if !self.pause(self.delays.white_check).await {
            return false;
        }

        self.light.off();
        if !self.pause(self.delays.resync).await {
            return false;
        }

        self.light.on();

        {
            let mut core = self.lock_core();

            core.position_known = true;
            core.current_color_id = 0
        }

        let _ = self.pause(self.delays.switch).await;

        info!("reset to first color done");
        true
    }

    async fn do_next(&self) {
        self.light.off();

        if self.pause(self.delays.between_switches).await {
            self.light.on()
        }
    }

    async fn do_set(&self, id: u16) {
        info!("setting color {}", id);

        let mut id = id;

        if !self.lock_core().position_known || id == RESET_COLOR_ID {
            if !self.do_reset().await {
                return;
            }

            if id == RESET_COLOR_ID {
                id = 0
            }
        }

        // After a long dark period the fixture wakes into its white
        // check state; power it on and wait that out first.

        if let Some(off_secs) = self.light.seconds_in_off_state() {
            if off_secs > WHITE_CHECK_THRESHOLD_SECS {
                info!("light was off over 60s -- waiting out white check state");
                self.light.on();

                if !self.pause(self.delays.white_check).await {
                    return;
                }
            }
        }

        if self.lock_core().current_color_id == id {
            info!("already at color {}", id);
            return;
        }

        while self.lock_core().current_color_id != id {
            if !self.running.load(Ordering::SeqCst)
                || self.interrupt.load(Ordering::SeqCst)
            {
                info!("stopping color set");
                break;
            }

            self.light.off();
            if !self.pause(self.delays.switch).await {
                break;
            }

            self.light.on();
            if !self.pause(self.delays.switch).await {
                break;
            }

            let mut core = self.lock_core();

            core.current_color_id = (core.current_color_id + 1) % COLOR_COUNT;
            info!(
                "advanced to color {} (target {})",
                core.current_color_id, id
            )
        }

        info!(
            "color set finished at {} -- {}",
            self.current_color_id(),
            self.current_color_name()
        )
    }

    /// Queues a resynchronization to program #1.
    pub fn reset_to_first_color(&self) {
        self.lock_queue().push_back(ColorCommand::Reset);
        self.wake.notify_one()
    }

    /// Queues a single program advance.
    pub fn next_color(&self) {
        self.lock_queue().push_back(ColorCommand::Next);
        self.wake.notify_one()
    }

    /// Queues a program selection. Ids outside the fixture's table
    /// are dropped.
    pub fn set_color(&self, id: u16) {
        if id >= COLOR_COUNT {
            warn!("invalid color id {}", id);
            return;
        }

        self.lock_queue().push_back(ColorCommand::Set(id));
        self.wake.notify_one()
    }

    /// Aborts the current command and drops everything queued. The
    /// worker stays alive for future commands.
    pub fn hard_stop(&self) {
        info!("color driver hard stop");
        self.interrupt.store(true, Ordering::SeqCst);
        self.lock_queue().clear();
        self.wake.notify_waiters();
        self.wake.notify_one()
    }

    /// Shuts the worker down for process exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.interrupt.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        self.wake.notify_one();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn current_color_id(&self) -> u16 {
        self.lock_core().current_color_id
    }

    pub fn is_position_known(&self) -> bool {
        self.lock_core().position_known
    }

    pub fn current_color_name(&self) -> &'static str {
        if !self.is_position_known() {
            return "Unknown";
        }

        COLORS[self.current_color_id() as usize].1
    }

    /// Broker message handler. Whatever arrives while a command is
    /// active or queued is dropped, not queued, so a chatty operator
    /// can't build a backlog of half-hour cycle sequences.
    pub fn handle_set_color_message(&self, data: &str) {
        if self.busy.load(Ordering::SeqCst) || !self.lock_queue().is_empty()
        {
            info!(
                "set color to {:?} skipped -- a command is active or queued",
                data
            );
            return;
        }

        match data.trim().parse::<u16>() {
            Ok(id) => {
                info!("set color message -> {}", id);
                self.set_color(id)
            }
            Err(_) => warn!("invalid set color payload {:?}", data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayBoard;
    use crate::hal::sim::SimulatedGpio;
    use tokio::time::{sleep, Duration};

    const LIGHT_PORT: u8 = 8;

    fn rig() -> Arc<ColorDriver> {
        let gpio = SimulatedGpio::new();
        let relay =
            Arc::new(RelayBoard::new(Box::new(gpio), false).unwrap());
        let light = Light::new(relay, LIGHT_PORT);
        let driver = ColorDriver::for_test(light);

        driver.clone().start();
        driver
    }

    async fn wait_idle(driver: &ColorDriver) {
        for _ in 0..500 {
            if !driver.busy.load(Ordering::SeqCst)
                && driver.lock_queue().is_empty()
            {
                return;
            }

            sleep(Duration::from_millis(2)).await
        }

        panic!("color driver never went idle")
    }

    #[tokio::test]
    async fn test_reset_learns_position() {
        let driver = rig();

        assert!(!driver.is_position_known());
        assert_eq!(driver.current_color_name(), "Unknown");

        driver.reset_to_first_color();
        wait_idle(&driver).await;

        assert!(driver.is_position_known());
        assert_eq!(driver.current_color_id(), 0);
        assert_eq!(driver.current_color_name(), "Fast Color Wash");

        driver.stop().await
    }

    #[tokio::test]
    async fn test_set_color_advances_to_target() {
        let driver = rig();

        driver.reset_to_first_color();
        driver.set_color(3);
        wait_idle(&driver).await;

        assert_eq!(driver.current_color_id(), 3);
        assert_eq!(driver.current_color_name(), "Afternoon Skies");

        driver.stop().await
    }

    #[tokio::test]
    async fn test_set_from_unknown_position_resets_first() {
        let driver = rig();

        driver.set_color(2);
        wait_idle(&driver).await;

        assert!(driver.is_position_known());
        assert_eq!(driver.current_color_id(), 2);

        driver.stop().await
    }

    #[tokio::test]
    async fn test_color_id_stays_in_range() {
        let driver = rig();

        driver.reset_to_first_color();
        driver.set_color(16);
        wait_idle(&driver).await;
        assert_eq!(driver.current_color_id(), 16);

        // Wrapping past the end of the table comes back around.

        driver.set_color(1);
        wait_idle(&driver).await;
        assert_eq!(driver.current_color_id(), 1);
        assert!(driver.current_color_id() < COLOR_COUNT);

        driver.stop().await
    }

    #[tokio::test]
    async fn test_invalid_ids_dropped() {
        let driver = rig();

        driver.set_color(17);
        driver.set_color(999);
        assert!(driver.lock_queue().is_empty());

        driver.stop().await
    }

    #[tokio::test]
    async fn test_handler_drops_while_queued() {
        let driver = rig();

        // Stack up a command, then push messages at the handler; they
        // must be dropped, not queued.

        driver.reset_to_first_color();
        driver.handle_set_color_message("4");
        driver.handle_set_color_message("5");

        wait_idle(&driver).await;
        assert_eq!(driver.current_color_id(), 0);

        driver.stop().await
    }

    #[tokio::test]
    async fn test_handler_rejects_junk() {
        let driver = rig();

        driver.handle_set_color_message("bogus");
        driver.handle_set_color_message("-1");
        assert!(driver.lock_queue().is_empty());

        driver.stop().await
    }

    #[tokio::test]
    async fn test_hard_stop_clears_queue() {
        let driver = rig();

        driver.reset_to_first_color();
        driver.set_color(9);
        driver.set_color(12);
        driver.hard_stop();

        assert!(driver.lock_queue().is_empty());
        wait_idle(&driver).await;

        driver.stop().await
    }
}
