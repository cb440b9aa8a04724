//! The Postgres side of the log store. Opens a small connection
//! pool, makes sure the three tables exist, and drains the record
//! queue one insert at a time. Insert failures are logged and
//! swallowed; the controller never stops controlling because the
//! database went away.

use pipool_api::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{error, info};

use super::{Record, RecordRx};
use crate::config;

// Schema creation is idempotent so the daemon can be pointed at a
// fresh database without a separate migration step.

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS device_runtime (
         id SERIAL PRIMARY KEY,
         topic VARCHAR,
         start_time TIMESTAMPTZ DEFAULT NOW(),
         elapsed_seconds INTEGER NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS sensor (
         id SERIAL PRIMARY KEY,
         sensor VARCHAR,
         reading FLOAT,
         time TIMESTAMPTZ DEFAULT NOW()
     )",
    "CREATE TABLE IF NOT EXISTS event (
         id SERIAL PRIMARY KEY,
         name VARCHAR,
         state_from VARCHAR,
         state_to VARCHAR,
         opaque JSONB,
         time TIMESTAMPTZ DEFAULT NOW()
     )",
];

pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects to the configured database and ensures the schema
    /// exists.
    pub async fn open(cfg: &config::Config) -> Result<Store> {
        let url = format!(
            "postgres://{}:{}@{}/{}",
            cfg.db_user,
            cfg.db_password,
            cfg.db_host(),
            cfg.db_name
        );

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .map_err(|e| Error::Store(format!("{}", e)))?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("{}", e)))?;
        }

        info!("log store open -- {}/{}", cfg.db_host(), cfg.db_name);
        Ok(Store { pool })
    }

    async fn insert(&self, record: Record) -> std::result::Result<(), sqlx::Error> {
        match record {
            Record::StateEvent {
                name,
                from,
                to,
                wall,
            } => {
                sqlx::query(
                    "INSERT INTO event (name, state_from, state_to, opaque, time) \
                     VALUES ($1, $2, $3, NULL, $4)",
                )
                .bind(name)
                .bind(from)
                .bind(to)
                .bind(wall)
                .execute(&self.pool)
                .await?;
            }

            Record::OpaqueEvent {
                name,
                payload,
                wall,
            } => {
                sqlx::query(
                    "INSERT INTO event (name, state_from, state_to, opaque, time) \
                     VALUES ($1, NULL, NULL, $2, $3)",
                )
                .bind(name)
                .bind(payload)
                .bind(wall)
                .execute(&self.pool)
                .await?;
            }

            Record::Runtime {
                topic,
                start,
                elapsed_seconds,
            } => {
                sqlx::query(
                    "INSERT INTO device_runtime (topic, start_time, elapsed_seconds) \
                     VALUES ($1, $2, $3)",
                )
                .bind(topic)
                .bind(start)
                .bind(elapsed_seconds as i32)
                .execute(&self.pool)
                .await?;
            }

            Record::Sensor {
                sensor,
                reading,
                wall,
            } => {
                sqlx::query(
                    "INSERT INTO sensor (sensor, reading, time) VALUES ($1, $2, $3)",
                )
                .bind(sensor)
                .bind(reading)
                .bind(wall)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Drains the record queue forever. Runs as its own task so no
    /// actuator path ever blocks on an insert.
    pub async fn run(self, rx: RecordRx) {
        loop {
            let record = rx.recv().await;

            if let Err(e) = self.insert(record).await {
                error!("log store insert failed -- {}", e)
            }
        }
    }
}
