//! Test doubles shared across module test suites.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::backend::client::Transport;
use crate::backend::types::{Request, Response};
use crate::config::Config;

pub const BASE: &str = "http://pos.local/";

pub fn url(path: &str) -> Url {
  Url::parse(BASE).unwrap().join(path).unwrap()
}

pub fn test_config() -> Config {
  let mut config = Config::default();
  config.backend.url = BASE.to_string();
  config.cache.name = "test-v1".to_string();
  config
}

/// A request seen by the fake transport.
#[derive(Debug, Clone)]
pub struct Call {
  pub method: Method,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Call {
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }
}

#[derive(Default)]
struct FakeState {
  routes: HashMap<String, Response>,
  /// Remaining forced failures per url
  failures: HashMap<String, usize>,
  /// Urls whose requests never resolve
  hanging: HashSet<String>,
  offline: bool,
  calls: Vec<Call>,
}

/// Scripted transport. Unrouted urls answer 404.
#[derive(Clone, Default)]
pub struct FakeTransport {
  state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, path: &str, response: Response) {
    self
      .state
      .lock()
      .unwrap()
      .routes
      .insert(url(path).to_string(), response);
  }

  /// Network failure for every request to `path`.
  pub fn fail(&self, path: &str) {
    self.fail_next(path, usize::MAX);
  }

  /// Network failure for the next `n` requests to `path`.
  pub fn fail_next(&self, path: &str, n: usize) {
    self
      .state
      .lock()
      .unwrap()
      .failures
      .insert(url(path).to_string(), n);
  }

  /// Requests to `path` never complete.
  pub fn hang(&self, path: &str) {
    self
      .state
      .lock()
      .unwrap()
      .hanging
      .insert(url(path).to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn calls(&self) -> Vec<Call> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    let target = url(path).to_string();
    self
      .state
      .lock()
      .unwrap()
      .calls
      .iter()
      .filter(|c| c.url == target)
      .count()
  }
}

impl Transport for FakeTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = request.url.to_string();

    let hangs = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(Call {
        method: request.method.clone(),
        url: key.clone(),
        headers: request.headers.clone(),
        body: request.body.clone(),
      });
      state.hanging.contains(&key)
    };
    if hangs {
      std::future::pending::<()>().await;
    }

    let mut state = self.state.lock().unwrap();

    if state.offline {
      return Err(eyre!("network unreachable"));
    }

    if let Some(remaining) = state.failures.get_mut(&key) {
      if *remaining > 0 {
        *remaining -= 1;
        return Err(eyre!("connection reset"));
      }
    }

    Ok(
      state
        .routes
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
