use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Loadable, Pin, PinId, ThreadDescriptor};

/// A row of the `pins` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PinRow {
    pub id: i64,
    pub loadable_id: i64,
    pub site: String,
    pub board: String,
    pub thread_no: i64,
    pub watching: bool,
    pub is_error: bool,
    pub archived: bool,
    pub pin_order: i32,
    pub watch_last_count: i32,
    pub watch_new_count: i32,
    pub quote_last_count: i32,
    pub quote_new_count: i32,
    pub title: String,
    pub thumbnail_url: String,
}

impl From<PinRow> for Pin {
    fn from(row: PinRow) -> Self {
        let thread = ThreadDescriptor::new(row.site, row.board, row.thread_no as u64);
        Self {
            id: PinId(row.id),
            loadable: Loadable::new(row.loadable_id, thread),
            watching: row.watching,
            is_error: row.is_error,
            archived: row.archived,
            order: row.pin_order,
            watch_last_count: row.watch_last_count,
            watch_new_count: row.watch_new_count,
            quote_last_count: row.quote_last_count,
            quote_new_count: row.quote_new_count,
            title: row.title,
            thumbnail_url: row.thumbnail_url,
        }
    }
}

/// All pins in display order.
pub async fn load_pins(pool: &SqlitePool) -> Result<Vec<Pin>> {
    let rows: Vec<PinRow> = sqlx::query_as(
        r"
        SELECT id, loadable_id, site, board, thread_no, watching, is_error, archived,
               pin_order, watch_last_count, watch_new_count, quote_last_count,
               quote_new_count, title, thumbnail_url
        FROM pins
        ORDER BY pin_order ASC, id ASC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load pins")?;

    Ok(rows.into_iter().map(Pin::from).collect())
}

/// Replace the stored pins with `pins` in one transaction.
pub async fn replace_pins(pool: &SqlitePool, pins: &[Pin]) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    sqlx::query("DELETE FROM pins")
        .execute(&mut *tx)
        .await
        .context("Failed to clear pins")?;

    for pin in pins {
        sqlx::query(
            r"
            INSERT INTO pins (
                id, loadable_id, site, board, thread_no, watching, is_error, archived,
                pin_order, watch_last_count, watch_new_count, quote_last_count,
                quote_new_count, title, thumbnail_url
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(pin.id.0)
        .bind(pin.loadable.id)
        .bind(&pin.loadable.thread.site)
        .bind(&pin.loadable.thread.board)
        .bind(pin.loadable.thread.thread_no as i64)
        .bind(pin.watching)
        .bind(pin.is_error)
        .bind(pin.archived)
        .bind(pin.order)
        .bind(pin.watch_last_count)
        .bind(pin.watch_new_count)
        .bind(pin.quote_last_count)
        .bind(pin.quote_new_count)
        .bind(&pin.title)
        .bind(&pin.thumbnail_url)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert pin {}", pin.thread()))?;
    }

    tx.commit().await.context("Failed to commit pins")?;
    Ok(())
}

pub async fn count_pins(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pins")
        .fetch_one(pool)
        .await
        .context("Failed to count pins")?;
    Ok(count)
}
