//! `vendas_offline` partition: sales queued while the backend was unreachable.
//!
//! Records are never deleted; a replayed sale stays behind with `synced = true`.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{from_millis, Database};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSale {
  pub id: i64,
  /// Opaque sale payload, forwarded verbatim on replay
  pub data: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub attempts: u32,
  pub last_attempt_at: Option<DateTime<Utc>>,
}

const SALE_COLUMNS: &str = "id, data, timestamp, synced, attempts, last_attempt_at";

type SaleRow = (i64, String, i64, bool, u32, Option<i64>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<SaleRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn into_sale(row: SaleRow) -> Result<PendingSale> {
  let (id, data, timestamp, synced, attempts, last_attempt_at) = row;
  let data: Value =
    serde_json::from_str(&data).map_err(|e| eyre!("Corrupt offline sale {}: {}", id, e))?;

  Ok(PendingSale {
    id,
    data,
    created_at: from_millis(timestamp)?,
    synced,
    attempts,
    last_attempt_at: last_attempt_at.map(from_millis).transpose()?,
  })
}

impl Database {
  /// Queue a sale. Returns its id.
  pub fn add_sale(&self, data: &Value, created_at: DateTime<Utc>) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO vendas_offline (data, timestamp, synced) VALUES (?, ?, 0)",
        params![data.to_string(), created_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store offline sale: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  pub fn get_sale(&self, id: i64) -> Result<Option<PendingSale>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!("SELECT {} FROM vendas_offline WHERE id = ?", SALE_COLUMNS),
        params![id],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read offline sale {}: {}", id, e))?;

    row.map(into_sale).transpose()
  }

  /// All sales with the given synced flag, oldest first.
  pub fn sales_by_synced(&self, synced: bool) -> Result<Vec<PendingSale>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM vendas_offline WHERE synced = ? ORDER BY id",
        SALE_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<SaleRow> = stmt
      .query_map(params![synced], read_row)
      .map_err(|e| eyre!("Failed to query offline sales: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read offline sales: {}", e))?;

    rows.into_iter().map(into_sale).collect()
  }

  /// Sales still waiting for replay.
  pub fn unsynced_sales(&self) -> Result<Vec<PendingSale>> {
    self.sales_by_synced(false)
  }

  /// Bump the attempt counter before a replay.
  pub fn record_sale_attempt(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE vendas_offline SET attempts = attempts + 1, last_attempt_at = ? WHERE id = ?",
        params![at.timestamp_millis(), id],
      )
      .map_err(|e| eyre!("Failed to record attempt for sale {}: {}", id, e))?;
    Ok(())
  }

  /// Mark a sale as replayed. Missing ids are ignored.
  pub fn mark_sale_synced(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE vendas_offline SET synced = 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark sale {} as synced: {}", id, e))?;
    Ok(())
  }
}
