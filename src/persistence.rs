//! Persistence Queue: a bounded channel of accepted readings, drained by a
//! single batch-writer task. Grounded in `libs/common/src/sqlite/client.rs`'s
//! pool-owning client (`Arc<Pool>`, reconnect-on-failure) adapted to the
//! enterprise SQL Server target this spec names, via `bb8-tiberius` instead
//! of `sqlx`'s sqlite feature — the teacher's vendored database stack has no
//! SQL Server driver, so this is a deliberate dependency addition (see
//! DESIGN.md).

use std::time::{Duration, Instant};

use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::database_reader::build_pool;
use crate::error::{Result, SilodError};

#[derive(Debug, Clone)]
pub struct PersistenceRecord {
    pub external_code: String,
    pub value: u16,
    pub timestamp: DateTime<Utc>,
}

const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<PersistenceRecord>,
}

impl PersistenceQueue {
    /// Non-blocking enqueue. On overflow the record is dropped with a
    /// logged warning, per spec.md §4.6.
    pub fn enqueue(&self, record: PersistenceRecord) {
        if let Err(e) = self.sender.try_send(record) {
            warn!(error = %e, "persistence queue full, record lost");
        }
    }
}

pub struct PersistenceWriter {
    config: DatabaseConfig,
    pool: Option<Pool<ConnectionManager>>,
}

impl PersistenceWriter {
    /// Builds the queue/writer pair and verifies the target table exists
    /// with a protocol-level catalog query. Startup fails if the table is
    /// absent (spec.md §4.6); the writer never issues DDL.
    pub async fn start(
        config: DatabaseConfig,
    ) -> Result<(PersistenceQueue, mpsc::Receiver<PersistenceRecord>, Self)> {
        let (sender, receiver) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let queue = PersistenceQueue { sender };

        if !config.enabled {
            let writer = PersistenceWriter { config, pool: None };
            return Ok((queue, receiver, writer));
        }

        let pool = build_pool(&config).await?;
        Self::verify_table(&pool, &config.table_name).await?;

        let writer = PersistenceWriter {
            config,
            pool: Some(pool),
        };
        Ok((queue, receiver, writer))
    }

    async fn verify_table(pool: &Pool<ConnectionManager>, table_name: &str) -> Result<()> {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| SilodError::Database(format!("failed to acquire connection: {e}")))?;
        let rows = conn
            .query(
                "SELECT 1 FROM sys.tables WHERE name = @P1",
                &[&table_name],
            )
            .await
            .map_err(|e| SilodError::Database(format!("table check failed: {e}")))?
            .into_first_result()
            .await
            .map_err(|e| SilodError::Database(format!("table check failed: {e}")))?;

        if rows.is_empty() {
            return Err(SilodError::Database(format!(
                "table {table_name} does not exist"
            )));
        }
        Ok(())
    }

    /// Runs until `receiver` closes (shutdown). Accumulates records until
    /// either `batch_size` is reached or `write_interval` elapses since the
    /// first record in the current accumulation, then flushes one
    /// transaction per batch.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<PersistenceRecord>) {
        if self.pool.is_none() {
            info!("persistence disabled, writer idling until shutdown");
            while receiver.recv().await.is_some() {}
            return;
        }

        let write_interval = Duration::from_secs(self.config.write_interval_seconds);
        let mut batch: Vec<PersistenceRecord> = Vec::new();
        let mut batch_started: Option<Instant> = None;

        loop {
            let deadline = match batch_started {
                Some(start) => write_interval.saturating_sub(start.elapsed()),
                None => Duration::from_secs(write_interval.as_secs().max(1)),
            };

            match timeout(deadline, receiver.recv()).await {
                Ok(Some(record)) => {
                    if batch.is_empty() {
                        batch_started = Some(Instant::now());
                    }
                    batch.push(record);
                    if batch.len() >= self.config.batch_size {
                        self.flush(&mut batch).await;
                        batch_started = None;
                    }
                }
                Ok(None) => {
                    // Channel closed: drain whatever remains, then exit.
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    break;
                }
                Err(_) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                        batch_started = None;
                    }
                }
            }
        }
    }

    async fn flush(&mut self, batch: &mut Vec<PersistenceRecord>) {
        if batch.is_empty() {
            return;
        }
        let pool = self.pool.as_ref().expect("flush only called when enabled");
        let table = &self.config.table_name;

        let result: Result<()> = async {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| SilodError::Database(format!("failed to acquire connection: {e}")))?;

            conn.simple_query("BEGIN TRAN")
                .await
                .map_err(|e| SilodError::Database(e.to_string()))?
                .into_results()
                .await
                .map_err(|e| SilodError::Database(e.to_string()))?;

            for record in batch.iter() {
                let query = format!(
                    "INSERT INTO {table} (external_code, quantity, updated_at) VALUES (@P1, @P2, @P3)"
                );
                let value = record.value as i32;
                let timestamp = record.timestamp.naive_local();
                let outcome = conn
                    .execute(query, &[&record.external_code, &value, &timestamp])
                    .await;
                if let Err(e) = outcome {
                    conn.simple_query("ROLLBACK TRAN")
                        .await
                        .map_err(|re| SilodError::Database(re.to_string()))?
                        .into_results()
                        .await
                        .map_err(|re| SilodError::Database(re.to_string()))?;
                    return Err(SilodError::Database(e.to_string()));
                }
            }

            conn.simple_query("COMMIT TRAN")
                .await
                .map_err(|e| SilodError::Database(e.to_string()))?
                .into_results()
                .await
                .map_err(|e| SilodError::Database(e.to_string()))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!(rows = batch.len(), "flushed persistence batch"),
            Err(e) => error!(error = %e, rows = batch.len(), "persistence batch rolled back and dropped"),
        }
        batch.clear();
    }
}

/// Spawns the writer task against its paired receiver (both returned
/// together from `PersistenceWriter::start`). Callers hold the returned
/// join handle and race it against `DRAIN_TIMEOUT_SECS` at shutdown.
pub fn spawn(
    writer: PersistenceWriter,
    receiver: mpsc::Receiver<PersistenceRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(writer.run(receiver))
}

pub const DRAIN_TIMEOUT_SECS: u64 = DRAIN_TIMEOUT.as_secs();

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u16) -> PersistenceRecord {
        PersistenceRecord {
            external_code: format!("S{n:02}"),
            value: n,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_drops_past_capacity_without_blocking() {
        let (sender, mut receiver) = mpsc::channel(2);
        let queue = PersistenceQueue { sender };

        queue.enqueue(record(1));
        queue.enqueue(record(2));
        queue.enqueue(record(3)); // dropped: channel full, try_send never blocks

        assert_eq!(receiver.recv().await.unwrap().value, 1);
        assert_eq!(receiver.recv().await.unwrap().value, 2);

        // Give the dropped third record no chance to appear.
        let third = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await;
        assert!(third.is_err(), "no third record should ever arrive");
    }

    #[tokio::test]
    async fn disabled_writer_idles_until_channel_closes() {
        let (queue, receiver, writer) = PersistenceWriter::start(DatabaseConfig::default())
            .await
            .unwrap();
        queue.enqueue(record(9));
        drop(queue);

        tokio::time::timeout(Duration::from_secs(1), writer.run(receiver))
            .await
            .expect("disabled writer should drain and exit promptly");
    }
}
