use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use url::Url;

use crate::backend::client::Transport;
use crate::backend::types::Request;

/// Result of one reachability ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
  Online,
  Offline,
  /// Was offline, now reachable
  Restored,
  /// Was online, now unreachable
  Lost,
}

impl Reachability {
  pub fn is_online(self) -> bool {
    matches!(self, Self::Online | Self::Restored)
  }
}

/// Tracks backend reachability via `HEAD` pings.
///
/// Any resolved response counts as reachable, whatever its status.
#[derive(Debug)]
pub struct Connectivity {
  ping_url: Url,
  online: AtomicBool,
}

impl Connectivity {
  /// Starts out assuming the backend is reachable.
  pub fn new(ping_url: Url) -> Self {
    Self {
      ping_url,
      online: AtomicBool::new(true),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub async fn ping<T: Transport>(&self, transport: &T) -> Reachability {
    let request = Request::new(Method::HEAD, self.ping_url.clone());
    let reachable = match transport.fetch(&request).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Ping failed");
        false
      }
    };

    let was_online = self.online.swap(reachable, Ordering::SeqCst);
    match (was_online, reachable) {
      (true, true) => Reachability::Online,
      (false, false) => Reachability::Offline,
      (false, true) => {
        info!("Connectivity restored");
        Reachability::Restored
      }
      (true, false) => {
        info!("Connectivity lost, offline mode active");
        Reachability::Lost
      }
    }
  }
}
