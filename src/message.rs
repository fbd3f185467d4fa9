use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

const KNOWN_TYPES: [&str; 3] = ["SKIP_WAITING", "STORE_OFFLINE_SALE", "REQUEST_SYNC"];

/// Control messages posted to the worker by the application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  /// Activate a waiting worker immediately
  SkipWaiting,
  /// Queue a sale that could not reach the backend
  StoreOfflineSale { sale: Value },
  /// Register the offline-sales background sync
  RequestSync,
  /// Anything else; handled as a no-op
  #[serde(other)]
  Unknown,
}

impl Message {
  /// Whether handling this message may wait on the network.
  pub fn needs_network(&self) -> bool {
    matches!(self, Self::RequestSync)
  }

  /// Malformed payloads become `Unknown` rather than errors.
  pub fn parse(value: &Value) -> Self {
    match serde_json::from_value(value.clone()) {
      Ok(message) => message,
      Err(e) => {
        match known_type(value) {
          Some(kind) => warn!(kind, error = %e, "Dropping malformed message"),
          None => debug!(error = %e, "Unrecognized message payload"),
        }
        Self::Unknown
      }
    }
  }
}

/// The `type` of a payload when it names a known message.
fn known_type(value: &Value) -> Option<&str> {
  value
    .get("type")
    .and_then(Value::as_str)
    .filter(|kind| KNOWN_TYPES.contains(kind))
}
