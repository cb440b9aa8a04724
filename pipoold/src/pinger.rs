//! Background reachability probe. A burst of pings every few
//! minutes feeds a single connected/not-connected bit that the
//! watchdog consumes; the idle period polls the stop signal so
//! shutdown never waits on a four-minute sleep.

use pipool_api::hal::NetworkMonitor;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::info;

// Probe burst shape: ten probes, one second apart.

const PING_COUNT: u32 = 10;
const PING_INTERVAL_SECS: u64 = 1;

// The idle period between bursts is ~230 s, walked in 10 s slices so
// a stop request is honored within one slice.

const IDLE_SLICES: u32 = 23;
const IDLE_SLICE: Duration = Duration::from_secs(10);

pub struct Pinger {
    connected: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Pinger {
    /// Starts the probe task against `target`.
    pub fn start(
        target: String,
        monitor: Box<dyn NetworkMonitor>,
    ) -> Pinger {
        let connected = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(Self::task(
            target,
            monitor,
            connected.clone(),
            stop_rx,
        ));

        Pinger {
            connected,
            stop_tx,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    async fn task(
        target: String,
        monitor: Box<dyn NetworkMonitor>,
        connected: Arc<AtomicBool>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!("pinger starting");

        loop {
            let reached = monitor
                .ping(&target, PING_COUNT, PING_INTERVAL_SECS)
                .await;

            connected.store(reached, Ordering::SeqCst);

            for _ in 0..IDLE_SLICES {
                tokio::select! {
                    _ = sleep(IDLE_SLICE) => (),
                    _ = stop_rx.changed() => {
                        info!("pinger stopped");
                        return
                    }
                }
            }
        }
    }

    /// The last burst's verdict. Optimistically `true` until the
    /// first burst completes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Signals the worker and waits for it to wind down.
    pub async fn stop(&self) {
        info!("pinger stop requested");

        let _ = self.stop_tx.send(true);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
