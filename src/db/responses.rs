//! Response cache, partitioned by cache generation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

use super::{from_millis, Database};
use crate::backend::types::Response;

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

impl Database {
  pub fn match_response(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM responses
         WHERE cache_name = ? AND url = ?",
        params![cache_name, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached response for {}: {}", url, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Corrupt cached headers for {}: {}", url, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: from_millis(cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  pub fn put_response(
    &self,
    cache_name: &str,
    url: &str,
    response: &Response,
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.lock()?;
    put_row(&conn, cache_name, url, response, cached_at)
  }

  /// Store several responses atomically: either all land or none do.
  pub fn put_responses(
    &self,
    cache_name: &str,
    entries: &[(String, Response)],
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (url, response) in entries {
      put_row(&tx, cache_name, url, response, cached_at)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  pub fn delete_response(&self, cache_name: &str, url: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute(
        "DELETE FROM responses WHERE cache_name = ? AND url = ?",
        params![cache_name, url],
      )
      .map_err(|e| eyre!("Failed to delete cached response for {}: {}", url, e))?;
    Ok(deleted > 0)
  }

  /// Names of every cache generation with stored responses.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM responses ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache names: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache names: {}", e))?;
    Ok(names)
  }

  /// Drop a whole generation. Returns the number of responses removed.
  pub fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM responses WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))
  }
}

fn put_row(
  conn: &rusqlite::Connection,
  cache_name: &str,
  url: &str,
  response: &Response,
  cached_at: DateTime<Utc>,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses (cache_name, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        cache_name,
        url,
        response.status,
        headers,
        response.body,
        cached_at.timestamp_millis()
      ],
    )
    .map_err(|e| eyre!("Failed to cache response for {}: {}", url, e))?;
  Ok(())
}
