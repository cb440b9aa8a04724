//! The broker adapter: a topic-to-handler table in front of a
//! rumqttc client. Handlers run on the event-loop task, so they must
//! finish quickly; anything slow (circulation dwell, color cycles)
//! spawns its own task. The event loop doubles as the reconnect
//! mechanism -- every successful connect re-subscribes the whole
//! topic set, and a poll error backs off and tries again.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};

const CLIENT_ID: &str = "pipoold";
const DEFAULT_PORT: u16 = 1883;

// Backoff between reconnect attempts after a poll error. The
// watchdog can cut it short through `connect`.

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

pub type Handler = Box<dyn Fn(&str) + Send + Sync>;

pub struct MessageBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    retry: Notify,
    handlers: Mutex<HashMap<String, Handler>>,
    event_loop: Mutex<Option<EventLoop>>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Builds the client against `broker` (a host, optionally
    /// `host:port`.) Nothing touches the network until `start`.
    pub fn new(broker: &str) -> Arc<MessageBus> {
        let (host, port) = match broker.rsplit_once(':') {
            Some((host, port)) => (
                String::from(host),
                port.parse().unwrap_or(DEFAULT_PORT),
            ),
            None => (String::from(broker), DEFAULT_PORT),
        };

        let mut options = MqttOptions::new(CLIENT_ID, host, port);

        options.set_keep_alive(Duration::from_secs(5));

        let (client, event_loop) = AsyncClient::new(options, 20);
        let (stop_tx, _) = watch::channel(false);

        Arc::new(MessageBus {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            retry: Notify::new(),
            handlers: Mutex::new(HashMap::new()),
            event_loop: Mutex::new(Some(event_loop)),
            stop_tx,
            worker: Mutex::new(None),
        })
    }

    /// Registers `handler` for `topic`. All registrations must
    /// happen before `start`; the topic set is also the subscription
    /// set.
    pub fn add_handler(&self, topic: &str, handler: Handler) {
        info!("adding handler for topic {}", topic);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(String::from(topic), handler);
    }

    /// Spawns the event-loop task.
    pub fn start(self: Arc<Self>) {
        let Some(mut event_loop) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("message bus already started");
            return;
        };

        // The handler table is frozen here so dispatch doesn't
        // contend with registration.

        let handlers: Arc<HashMap<String, Handler>> = Arc::new(
            std::mem::take(
                &mut *self
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            ),
        );

        let bus = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,

                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            info!("broker connected -- {:?}", ack.code);
                            bus.connected.store(true, Ordering::SeqCst);
                            bus.subscribe_all(&handlers).await
                        }

                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let payload =
                                String::from_utf8_lossy(&publish.payload)
                                    .into_owned();

                            debug!(
                                "message on {} -- {:?}",
                                &publish.topic, &payload
                            );

                            match handlers.get(&publish.topic) {
                                Some(handler) => handler(&payload),
                                None => error!(
                                    "no handler for topic {} -- ignoring message",
                                    &publish.topic
                                ),
                            }
                        }

                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("broker sent disconnect");
                            bus.connected.store(false, Ordering::SeqCst)
                        }

                        Ok(_) => (),

                        Err(e) => {
                            debug!("broker connection error -- {}", e);
                            bus.connected.store(false, Ordering::SeqCst);

                            tokio::select! {
                                _ = sleep(RECONNECT_PAUSE) => (),
                                _ = bus.retry.notified() => (),
                                _ = stop_rx.changed() => break,
                            }
                        }
                    }
                }
            }

            info!("message bus stopped")
        });

        *self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker)
    }

    async fn subscribe_all(&self, handlers: &HashMap<String, Handler>) {
        // Brokers forget subscriptions across sessions; re-issue the
        // full set on every connect.

        for topic in handlers.keys() {
            if let Err(e) =
                self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await
            {
                error!("subscribe to {} failed -- {}", topic, e)
            }
        }
    }

    /// Best-effort publish; failures are expected while the broker
    /// is away and only logged.
    pub fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self.client.try_publish(
            topic,
            QoS::AtMostOnce,
            false,
            payload.as_bytes().to_vec(),
        ) {
            debug!("publish to {} failed -- {}", topic, e)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Nudges the event loop to retry immediately instead of riding
    /// out its backoff. Non-blocking.
    pub fn connect(&self) {
        self.retry.notify_waiters()
    }

    /// Stops the event-loop task and tells the broker goodbye.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let _ = self.client.try_disconnect();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_connected_for_test(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_disconnected() {
        let bus = MessageBus::new("192.0.2.1");

        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_host_port_parsing_accepts_both_forms() {
        // Construction must not panic on either form; the connection
        // itself is lazy.

        let _ = MessageBus::new("broker.local");
        let _ = MessageBus::new("broker.local:2883");
    }

    #[tokio::test]
    async fn test_publish_without_broker_is_best_effort() {
        let bus = MessageBus::new("192.0.2.1");

        // No event loop is running; the publish queues or fails but
        // never panics or blocks.

        bus.publish("pipool/status", "Online");
    }
}
