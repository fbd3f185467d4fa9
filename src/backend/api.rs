use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::client::Transport;
use super::csrf::{CsrfSource, CSRF_HEADER};
use super::types::{Request, Response};
use crate::config::Config;
use crate::db::Database;

const PRINTERS: &str = "/documentos/listar-impressoras/";
const PRINT: &str = "/documentos/imprimir/";
const DRAWER: &str = "/documentos/abrir-gaveta/";
const GENERATE: &str = "/documentos/gerar/";
const SALES: &str = "/api/v1/vendas/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
  pub id: i64,
  #[serde(default, rename = "nome")]
  pub name: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Fiscal document types understood by `/documentos/gerar/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
  /// NFC-e
  Invoice,
  Receipt,
}

impl DocumentKind {
  pub fn type_id(self) -> u8 {
    match self {
      Self::Invoice => 1,
      Self::Receipt => 3,
    }
  }
}

#[derive(Debug, Default, Deserialize)]
struct ActionResult {
  #[serde(default)]
  success: bool,
  error: Option<String>,
  documento_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
  pub produto_id: i64,
  pub quantidade: f64,
  pub preco_unitario: f64,
  #[serde(default)]
  pub desconto_item: f64,
}

/// A sale as submitted by the point of sale. Totals, hash and ATCUD are
/// computed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSale {
  pub empresa: i64,
  pub loja: i64,
  #[serde(default)]
  pub cliente: Option<i64>,
  pub forma_pagamento: Value,
  #[serde(default = "default_sale_type")]
  pub tipo_venda: String,
  pub itens: Vec<SaleItem>,
}

fn default_sale_type() -> String {
  "FR".to_string()
}

impl NewSale {
  pub fn validate(&self) -> Result<()> {
    if self.itens.is_empty() {
      return Err(eyre!("A sale needs at least one item"));
    }
    Ok(())
  }
}

/// Fiscal fields of a signed sale.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FiscalDocument {
  pub numero_venda: String,
  pub atcud: String,
  pub hash_documento: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaleOutcome {
  Created(FiscalDocument),
  /// The backend refused the sale
  Rejected(String),
  /// Backend unreachable; stored for background sync
  Queued { id: i64 },
}

/// Typed calls to the point-of-sale backend.
pub struct BackendApi<T: Transport> {
  transport: T,
  csrf: CsrfSource<T>,
  storage: Arc<Database>,
  base: Url,
}

impl<T: Transport> BackendApi<T> {
  pub fn new(transport: T, storage: Arc<Database>, config: &Config) -> Result<Self> {
    Ok(Self {
      csrf: CsrfSource::new(transport.clone(), config)?,
      transport,
      storage,
      base: config.base_url()?,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  async fn post(&self, path: &str, body: &Value) -> Result<Response> {
    let token = self.csrf.token().await;
    let request = Request::post_json(self.endpoint(path)?, body).with_header(CSRF_HEADER, &token);
    self.transport.fetch(&request).await
  }

  async fn action(&self, path: &str, body: &Value) -> Result<ActionResult> {
    let response = self.post(path, body).await?;
    response
      .json_body()
      .map_err(|e| eyre!("Invalid response from {}: {}", path, e))
  }

  pub async fn printers(&self) -> Result<Vec<Printer>> {
    let response = self
      .transport
      .fetch(&Request::get(self.endpoint(PRINTERS)?))
      .await?;

    if !response.is_ok() {
      return Err(eyre!("Failed to list printers: status {}", response.status));
    }
    response
      .json_body()
      .map_err(|e| eyre!("Failed to parse printers: {}", e))
  }

  /// Send a generated document to a printer (the backend default when `None`).
  pub async fn print_document(&self, document_id: i64, printer_id: Option<i64>) -> Result<()> {
    let result = self
      .action(
        PRINT,
        &json!({"documento_id": document_id, "impressora_id": printer_id}),
      )
      .await
      .map_err(|e| eyre!("Printer communication failed: {}", e))?;

    if !result.success {
      return Err(eyre!(
        "Print failed: {}",
        result.error.unwrap_or_else(|| "unknown error".to_string())
      ));
    }
    info!(document_id, "Document printed");
    Ok(())
  }

  pub async fn open_drawer(&self, printer_id: i64) -> Result<bool> {
    let result = self
      .action(DRAWER, &json!({"impressora_id": printer_id}))
      .await?;
    Ok(result.success)
  }

  pub async fn generate_document(&self, sale_id: i64, kind: DocumentKind) -> Result<i64> {
    let result = self
      .action(
        GENERATE,
        &json!({"venda_id": sale_id, "tipo_documento_id": kind.type_id()}),
      )
      .await?;

    match (result.success, result.documento_id) {
      (true, Some(id)) => Ok(id),
      _ => Err(eyre!(
        "Document generation failed for sale {}: {}",
        sale_id,
        result.error.unwrap_or_else(|| "no document returned".to_string())
      )),
    }
  }

  /// Generate the sale's document and print it. Returns the document id.
  pub async fn print_sale(&self, sale_id: i64, kind: DocumentKind) -> Result<i64> {
    let document_id = self.generate_document(sale_id, kind).await?;
    self.print_document(document_id, None).await?;
    Ok(document_id)
  }

  pub async fn create_sale(&self, sale: &NewSale) -> Result<SaleOutcome> {
    sale.validate()?;
    let body = serde_json::to_value(sale).map_err(|e| eyre!("Failed to encode sale: {}", e))?;

    let response = match self.post(SALES, &body).await {
      Ok(response) => response,
      Err(e) => {
        warn!(error = %e, "Backend unreachable, queueing sale offline");
        let id = self.storage.add_sale(&body, Utc::now())?;
        return Ok(SaleOutcome::Queued { id });
      }
    };

    let data: Value = response.json_body().unwrap_or(Value::Null);

    if response.is_ok() {
      let document: FiscalDocument = serde_json::from_value(data["documento"].clone())
        .map_err(|e| eyre!("Sale created but fiscal data is missing: {}", e))?;
      info!(numero = document.numero_venda.as_str(), "Sale created");
      return Ok(SaleOutcome::Created(document));
    }

    let message = match data.get("message").and_then(Value::as_str) {
      Some(m) => m.to_string(),
      None => data.get("itens").unwrap_or(&data).to_string(),
    };
    debug!(status = response.status, "Sale rejected");
    Ok(SaleOutcome::Rejected(message))
  }
}
