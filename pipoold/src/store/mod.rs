//! Best-effort persistence of events, runtimes, and sensor samples.
//!
//! Actuator code records through a cloneable `Recorder` handle which
//! pushes onto a bounded in-memory queue; a single writer task drains
//! the queue into Postgres. Nothing on an actuator path ever waits
//! for the database: a full queue evicts its oldest record and a
//! failed insert is logged and swallowed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::Notify;
use tracing::warn;

pub mod postgres;

// Capacity of the record queue. Deep enough to ride out a slow
// database, small enough that a dead one doesn't grow the heap.

const QUEUE_CAPACITY: usize = 256;

/// A single record bound for the log store.

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A device state transition.
    StateEvent {
        name: String,
        from: String,
        to: String,
        wall: DateTime<Utc>,
    },

    /// A named point in control flow with an optional structured
    /// payload.
    OpaqueEvent {
        name: String,
        payload: Option<Value>,
        wall: DateTime<Utc>,
    },

    /// How long an actuator ran.
    Runtime {
        topic: String,
        start: DateTime<Utc>,
        elapsed_seconds: i64,
    },

    /// A throttled sensor sample.
    Sensor {
        sensor: String,
        reading: f64,
        wall: DateTime<Utc>,
    },
}

// The shared queue. Push is synchronous (it runs under actuator
// state gates); the single consumer awaits the notify handle.

struct Queue {
    records: Mutex<VecDeque<Record>>,
    notify: Notify,
    capacity: usize,
}

impl Queue {
    fn push(&self, record: Record) {
        {
            let mut records =
                self.records.lock().unwrap_or_else(PoisonError::into_inner);

            if records.len() >= self.capacity {
                // Drop-oldest: the newest record is the one most
                // likely to matter during an incident.

                records.pop_front();
                warn!("record queue full -- dropping oldest record");
            }
            records.push_back(record);
        }
        self.notify.notify_one();
    }
}

/// The handle actuators and sensors record through. Cloning is cheap;
/// every component gets its own copy at construction.

#[derive(Clone)]
pub struct Recorder {
    queue: Arc<Queue>,
}

impl Recorder {
    /// Records a device state transition.
    pub fn state_event(&self, name: &str, from: &str, to: &str) {
        self.queue.push(Record::StateEvent {
            name: String::from(name),
            from: String::from(from),
            to: String::from(to),
            wall: Utc::now(),
        })
    }

    /// Records an opaque event with an optional structured payload.
    pub fn opaque_event(&self, name: &str, payload: Option<Value>) {
        self.queue.push(Record::OpaqueEvent {
            name: String::from(name),
            payload,
            wall: Utc::now(),
        })
    }

    /// Records an actuator runtime. Zero-length runs carry no
    /// information and are elided.
    pub fn duration(&self, topic: &str, start: DateTime<Utc>, elapsed: f64) {
        let elapsed_seconds = elapsed.round() as i64;

        if elapsed_seconds == 0 {
            return;
        }

        self.queue.push(Record::Runtime {
            topic: String::from(topic),
            start,
            elapsed_seconds,
        })
    }

    /// Records a sensor sample.
    pub fn sensor(&self, sensor: &str, reading: f64) {
        self.queue.push(Record::Sensor {
            sensor: String::from(sensor),
            reading,
            wall: Utc::now(),
        })
    }
}

/// The consuming side of the record queue. Owned by the writer task
/// (or by a test that wants to inspect what was recorded.)

pub struct RecordRx {
    queue: Arc<Queue>,
}

impl RecordRx {
    /// Waits for the next record.
    pub async fn recv(&self) -> Record {
        loop {
            if let Some(record) = self
                .queue
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return record;
            }

            self.queue.notify.notified().await
        }
    }

    /// Removes and returns everything currently queued.
    pub fn drain(&self) -> Vec<Record> {
        self.queue
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Creates a connected `Recorder`/`RecordRx` pair.
pub fn channel() -> (Recorder, RecordRx) {
    let queue = Arc::new(Queue {
        records: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        capacity: QUEUE_CAPACITY,
    });

    (
        Recorder {
            queue: queue.clone(),
        },
        RecordRx { queue },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_queue_in_order() {
        let (recorder, rx) = channel();

        recorder.state_event("pump_state", "OFF", "ON");
        recorder.opaque_event("pump_hard_stop", None);
        recorder.sensor("temp_sensor_in", 26.5);

        let records = rx.drain();

        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], Record::StateEvent { name, from, to, .. }
            if name == "pump_state" && from == "OFF" && to == "ON"));
        assert!(matches!(&records[1], Record::OpaqueEvent { name, payload, .. }
            if name == "pump_hard_stop" && payload.is_none()));
        assert!(matches!(&records[2], Record::Sensor { sensor, reading, .. }
            if sensor == "temp_sensor_in" && *reading == 26.5));
    }

    #[test]
    fn test_zero_duration_elided() {
        let (recorder, rx) = channel();

        recorder.duration("pump_time", Utc::now(), 0.0);
        recorder.duration("pump_time", Utc::now(), 0.4);
        assert!(rx.drain().is_empty());

        recorder.duration("pump_time", Utc::now(), 12.6);

        let records = rx.drain();

        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], Record::Runtime { topic, elapsed_seconds, .. }
            if topic == "pump_time" && *elapsed_seconds == 13));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (recorder, rx) = channel();

        for ii in 0..(QUEUE_CAPACITY + 10) {
            recorder.opaque_event("evt", Some(json!(ii)));
        }

        let records = rx.drain();

        assert_eq!(records.len(), QUEUE_CAPACITY);

        // The oldest ten records were evicted; the newest survived.

        assert!(matches!(&records[0], Record::OpaqueEvent { payload, .. }
            if payload == &Some(json!(10))));
        assert!(
            matches!(&records[records.len() - 1], Record::OpaqueEvent { payload, .. }
            if payload == &Some(json!(QUEUE_CAPACITY + 9)))
        );
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (recorder, rx) = channel();

        recorder.opaque_event("Boot", None);

        let record = rx.recv().await;

        assert!(matches!(record, Record::OpaqueEvent { ref name, .. }
            if name == "Boot"));
    }
}
