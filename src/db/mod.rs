//! Local persistent store.
//!
//! One SQLite database holding the offline partitions (`data`,
//! `vendas_offline`, `produtos_cache`) and the response cache. A single
//! connection behind a mutex serializes every operation, which gives each
//! partition transactional isolation. Nothing spans partitions atomically.

pub mod offline_data;
pub mod products;
pub mod responses;
pub mod sales;
mod schema;

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

pub use products::ProductCacheEntry;
pub use sales::PendingSale;

/// Named partitions of the offline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
  /// API payloads keyed by url
  Data,
  /// Pending sales keyed by id
  OfflineSales,
  /// Product snapshots keyed by id
  ProductCache,
}

impl Partition {
  pub fn table(&self) -> &'static str {
    match self {
      Self::Data => "data",
      Self::OfflineSales => "vendas_offline",
      Self::ProductCache => "produtos_cache",
    }
  }

  pub const ALL: [Partition; 3] = [Self::Data, Self::OfflineSales, Self::ProductCache];

  fn key_column(&self) -> &'static str {
    match self {
      Self::Data => "url",
      Self::OfflineSales | Self::ProductCache => "id",
    }
  }
}

impl FromStr for Partition {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|p| p.table() == s)
      .ok_or_else(|| eyre!("Unknown partition: {} (expected data, vendas_offline or produtos_cache)", s))
  }
}

/// Key for a single-record delete.
#[derive(Debug, Clone)]
pub enum RecordKey<'a> {
  Url(&'a str),
  Id(i64),
}

/// Database connection wrapper
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Volatile database for tests.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Create the schema on first open. Refuses databases written by a newer version.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    let version: i64 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if version > schema::SCHEMA_VERSION {
      return Err(eyre!(
        "Database schema version {} is newer than supported version {}",
        version,
        schema::SCHEMA_VERSION
      ));
    }

    if version < schema::SCHEMA_VERSION {
      tracing::info!(from = version, to = schema::SCHEMA_VERSION, "Upgrading offline database");
      conn
        .execute_batch(schema::SCHEMA)
        .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
      conn
        .pragma_update(None, "user_version", schema::SCHEMA_VERSION)
        .map_err(|e| eyre!("Failed to set schema version: {}", e))?;
    }

    Ok(())
  }

  pub fn schema_version(&self) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Delete one record from a partition. Returns whether it existed.
  pub fn delete(&self, partition: Partition, key: RecordKey<'_>) -> Result<bool> {
    let conn = self.lock()?;
    let sql = format!(
      "DELETE FROM {} WHERE {} = ?",
      partition.table(),
      partition.key_column()
    );

    let deleted = match key {
      RecordKey::Url(url) => conn.execute(&sql, params![url]),
      RecordKey::Id(id) => conn.execute(&sql, params![id]),
    }
    .map_err(|e| eyre!("Failed to delete from {}: {}", partition.table(), e))?;

    Ok(deleted > 0)
  }

  /// Remove every record from a partition.
  pub fn clear(&self, partition: Partition) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(&format!("DELETE FROM {}", partition.table()), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", partition.table(), e))
  }

  pub fn count(&self, partition: Partition) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", partition.table()),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", partition.table(), e))?;
    Ok(count as usize)
  }
}

/// Convert epoch milliseconds from SQLite.
fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}
