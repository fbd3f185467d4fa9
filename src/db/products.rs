//! `produtos_cache` partition: product snapshot for offline lookup during sale entry.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Database;

/// Denormalized product as served by the catalog endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCacheEntry {
  pub id: i64,
  #[serde(rename = "codigo_barras", default, skip_serializing_if = "Option::is_none")]
  pub barcode: Option<String>,
  #[serde(rename = "nome_comercial", default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Remaining fields, kept verbatim
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn decode(data: &str) -> Result<ProductCacheEntry> {
  serde_json::from_str(data).map_err(|e| eyre!("Corrupt cached product: {}", e))
}

impl Database {
  /// Replace the whole catalog in one transaction. No merge with previous contents.
  pub fn replace_products(&self, products: &[ProductCacheEntry]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM produtos_cache", [])
      .map_err(|e| eyre!("Failed to clear product cache: {}", e))?;

    for product in products {
      let data =
        serde_json::to_string(product).map_err(|e| eyre!("Failed to serialize product: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO produtos_cache (id, codigo_barras, nome_comercial, data)
         VALUES (?, ?, ?, ?)",
        params![product.id, product.barcode, product.name, data],
      )
      .map_err(|e| eyre!("Failed to store product {}: {}", product.id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(products.len())
  }

  pub fn get_product(&self, id: i64) -> Result<Option<ProductCacheEntry>> {
    let conn = self.lock()?;
    let data: Option<String> = conn
      .query_row(
        "SELECT data FROM produtos_cache WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read product {}: {}", id, e))?;

    data.as_deref().map(decode).transpose()
  }

  pub fn products_by_barcode(&self, barcode: &str) -> Result<Vec<ProductCacheEntry>> {
    self.query_products(
      "SELECT data FROM produtos_cache WHERE codigo_barras = ? ORDER BY id",
      barcode,
    )
  }

  /// Case-insensitive prefix match on the display name.
  pub fn products_by_name(&self, prefix: &str) -> Result<Vec<ProductCacheEntry>> {
    let escaped = prefix
      .replace('\\', "\\\\")
      .replace('%', "\\%")
      .replace('_', "\\_");
    self.query_products(
      "SELECT data FROM produtos_cache WHERE nome_comercial LIKE ? ESCAPE '\\'
       ORDER BY nome_comercial, id",
      &format!("{}%", escaped),
    )
  }

  pub fn all_products(&self) -> Result<Vec<ProductCacheEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM produtos_cache ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query products: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read products: {}", e))?;

    rows.iter().map(|data| decode(data)).collect()
  }

  fn query_products(&self, sql: &str, arg: &str) -> Result<Vec<ProductCacheEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<String> = stmt
      .query_map(params![arg], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query products: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read products: {}", e))?;

    rows.iter().map(|data| decode(data)).collect()
  }
}
