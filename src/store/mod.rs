//! SQLite persistence of pins.

mod migrations;
mod queries;

pub use queries::{count_pins, load_pins, replace_pins, PinRow};

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::collaborators::PinStore;
use crate::models::Pin;

enum WriteRequest {
    Save(Vec<Pin>),
    Flush(oneshot::Sender<()>),
}

/// Pin store backed by a SQLite file.
///
/// Saves are queued to a single writer task. A burst of saves is collapsed
/// into one write of the newest list.
#[derive(Debug, Clone)]
pub struct SqlitePinStore {
    pool: SqlitePool,
    writes: mpsc::UnboundedSender<WriteRequest>,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Save(pins) => write!(f, "Save({} pins)", pins.len()),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl SqlitePinStore {
    /// Open (creating if needed) the database and start the writer task.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or migrations fail.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        migrations::run(&pool).await?;
        info!(path = %path.display(), "Pin database ready");

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(pool.clone(), rx));

        Ok(Self { pool, writes })
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write `pins` immediately, bypassing the writer queue.
    pub async fn save_pins_now(&self, pins: &[Pin]) -> Result<()> {
        replace_pins(&self.pool, pins).await
    }

    /// Wait until every save queued so far has been written.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.writes
            .send(WriteRequest::Flush(tx))
            .context("Pin writer is not running")?;
        rx.await.context("Pin writer stopped before flushing")
    }
}

#[async_trait]
impl PinStore for SqlitePinStore {
    async fn load_all_pins(&self) -> Result<Vec<Pin>> {
        load_pins(&self.pool).await
    }

    fn save_pins(&self, pins: Vec<Pin>) {
        if self.writes.send(WriteRequest::Save(pins)).is_err() {
            warn!("Pin writer is not running, dropping save");
        }
    }
}

async fn run_writer(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut flushes = Vec::new();
        let mut next = Some(first);
        while let Some(request) = next {
            match request {
                WriteRequest::Save(pins) => latest = Some(pins),
                WriteRequest::Flush(done) => flushes.push(done),
            }
            next = rx.try_recv().ok();
        }

        if let Some(pins) = latest {
            match replace_pins(&pool, &pins).await {
                Ok(()) => debug!(pins = pins.len(), "Saved pins"),
                Err(e) => error!("Failed to save pins: {e:#}"),
            }
        }
        for done in flushes {
            let _ = done.send(());
        }
    }
    debug!("Pin writer stopped");
}
