//! `data` partition: API payloads captured for offline reads.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{from_millis, Database};

/// A captured API payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineRecord {
  pub url: String,
  pub data: Value,
  pub captured_at: DateTime<Utc>,
}

impl OfflineRecord {
  /// A record is usable while strictly younger than `ttl`.
  pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    now - self.captured_at < ttl
  }
}

impl Database {
  pub fn put_offline_data(&self, url: &str, data: &Value, captured_at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO data (url, data, timestamp) VALUES (?, ?, ?)",
        params![url, data.to_string(), captured_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store offline data for {}: {}", url, e))?;
    Ok(())
  }

  /// Raw lookup, ignoring freshness.
  pub fn get_offline_record(&self, url: &str) -> Result<Option<OfflineRecord>> {
    let conn = self.lock()?;
    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT data, timestamp FROM data WHERE url = ?",
        params![url],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read offline data for {}: {}", url, e))?;

    match row {
      Some((data, timestamp)) => {
        let data: Value = serde_json::from_str(&data)
          .map_err(|e| eyre!("Corrupt offline data for {}: {}", url, e))?;
        Ok(Some(OfflineRecord {
          url: url.to_string(),
          data,
          captured_at: from_millis(timestamp)?,
        }))
      }
      None => Ok(None),
    }
  }

  /// Payload for `url` if one exists and is younger than `ttl`.
  pub fn get_offline_data(&self, url: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Option<Value>> {
    Ok(
      self
        .get_offline_record(url)?
        .filter(|record| record.is_fresh(ttl, now))
        .map(|record| record.data),
    )
  }
}
