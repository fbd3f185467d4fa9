use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::worker::Event;

/// Event source for the long-running worker: control messages read as JSON
/// lines plus a periodic tick
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler reading messages from `input`
  pub fn new<R>(tick_rate: Duration, input: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    // Message reader
    tokio::spawn(async move {
      let mut lines = input.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if let Some(payload) = parse_line(&line) {
              if tx.send(Event::Message(payload)).is_err() {
                break;
              }
            }
          }
          Ok(None) => {
            debug!("Message input closed");
            break;
          }
          Err(e) => {
            warn!(error = %e, "Failed to read message input");
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Blank lines are skipped; invalid JSON is logged and skipped.
fn parse_line(line: &str) -> Option<Value> {
  let line = line.trim();
  if line.is_empty() {
    return None;
  }
  match serde_json::from_str(line) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!(error = %e, "Ignoring malformed message line");
      None
    }
  }
}
