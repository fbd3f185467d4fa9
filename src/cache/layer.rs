//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::{Duration, Utc};
use color_eyre::Result;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::router::is_page_request;
use super::traits::{Served, Strategy};
use crate::backend::client::Transport;
use crate::backend::types::{Request, Response};
use crate::config::Config;
use crate::db::Database;

const STATIC_UNAVAILABLE: &str = "Resource not available offline";
const UNAVAILABLE: &str = "Not available offline";
const OFFLINE_DATA_UNAVAILABLE: &str = "data unavailable offline";

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy terminates in a network response, a cached copy, a stored
/// offline record or a synthesized response. No strategy retries within a
/// single request.
pub struct CacheLayer<T: Transport> {
  storage: Arc<Database>,
  transport: T,
  /// Current cache generation
  cache_name: String,
  offline_url: Url,
  /// How long offline records stay usable
  offline_ttl: Duration,
  /// Detached stale-while-revalidate refreshes
  refreshes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<T: Transport> CacheLayer<T> {
  pub fn new(storage: Arc<Database>, transport: T, config: &Config) -> Result<Self> {
    Ok(Self {
      storage,
      transport,
      cache_name: config.cache.name.clone(),
      offline_url: config.resolve(&config.cache.offline_url)?,
      offline_ttl: config.offline_data_ttl()?,
      refreshes: Arc::new(Mutex::new(Vec::new())),
    })
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  /// Run `strategy` for `request`, ending the fallback chain if it yields nothing.
  pub async fn handle(&self, strategy: Strategy, request: &Request) -> Served {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::NetworkFirstOffline => self.network_first_offline(request).await,
      Strategy::StaleWhileRevalidate => match self.stale_while_revalidate(request).await {
        Some(served) => served,
        None => self.unavailable(request),
      },
    }
  }

  /// Serve from cache without touching the network; fetch and store on a miss.
  pub async fn cache_first(&self, request: &Request) -> Served {
    if let Some(cached) = self.lookup(request) {
      return Served::cache(cached);
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store(request, &response);
        }
        Served::network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failure for static resource");
        Served::synthesized(Response::text(503, STATIC_UNAVAILABLE))
      }
    }
  }

  /// Try the network first; fall back to cache, then the offline page or a 503.
  pub async fn network_first(&self, request: &Request) -> Served {
    match self.transport.fetch(request).await {
      Ok(response) => {
        if response.is_success_or_redirect() {
          self.store(request, &response);
        }
        Served::network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failure, trying cache");
        match self.lookup(request) {
          Some(cached) => Served::cache(cached),
          None => self.unavailable(request),
        }
      }
    }
  }

  /// Network-first for API data. Successful JSON payloads are persisted as
  /// offline records and served back while fresh when the network fails.
  pub async fn network_first_offline(&self, request: &Request) -> Served {
    let key = request.cache_key();

    let failure = match self.transport.fetch(request).await {
      Ok(response) if response.is_ok() => match response.json_body::<Value>() {
        Ok(data) => {
          if let Err(e) = self.storage.put_offline_data(key, &data, Utc::now()) {
            warn!(url = key, error = %e, "Failed to store offline data");
          }
          self.store(request, &response);
          return Served::network(response);
        }
        Err(e) => format!("malformed JSON: {}", e),
      },
      Ok(response) => return Served::network(response),
      Err(e) => e.to_string(),
    };

    debug!(url = key, error = %failure, "Offline request");

    match self
      .storage
      .get_offline_data(key, self.offline_ttl, Utc::now())
    {
      Ok(Some(data)) => return Served::offline_store(Response::json(200, &data)),
      Ok(None) => {}
      Err(e) => warn!(url = key, error = %e, "Failed to read offline data"),
    }

    Served::synthesized(Response::json(
      503,
      &json!({
        "success": false,
        "error": OFFLINE_DATA_UNAVAILABLE,
        "offline": true
      }),
    ))
  }

  /// Return the cached copy at once and refresh it in the background. Without a
  /// cached copy the network result is awaited; `None` when that fails too.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Option<Served> {
    if let Some(cached) = self.lookup(request) {
      self.spawn_refresh(request.clone());
      return Some(Served::cache(cached));
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store(request, &response);
        }
        Some(Served::network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Revalidation failed with nothing cached");
        None
      }
    }
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let handles: Vec<JoinHandle<()>> = match self.refreshes.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(_) => Vec::new(),
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Background refresh panicked");
      }
    }
  }

  fn spawn_refresh(&self, request: Request) {
    let transport = self.transport.clone();
    let storage = Arc::clone(&self.storage);
    let cache_name = self.cache_name.clone();

    let handle = tokio::spawn(async move {
      match transport.fetch(&request).await {
        Ok(response) if response.is_ok() => {
          if let Err(e) =
            storage.put_response(&cache_name, request.cache_key(), &response, Utc::now())
          {
            warn!(url = %request.url, error = %e, "Failed to store refreshed response");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Refresh not cached");
        }
        // Swallowed: the cached copy was already served.
        Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
      }
    });

    if let Ok(mut pending) = self.refreshes.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Cached offline landing page for navigations, else a plain 503.
  fn unavailable(&self, request: &Request) -> Served {
    if is_page_request(request) {
      if let Some(page) = self.cached(self.offline_url.as_str()) {
        return Served::cache(page);
      }
    }
    Served::synthesized(Response::text(503, UNAVAILABLE))
  }

  /// Only GET responses are cacheable.
  fn lookup(&self, request: &Request) -> Option<Response> {
    if request.method != Method::GET {
      return None;
    }
    self.cached(request.cache_key())
  }

  fn cached(&self, url: &str) -> Option<Response> {
    match self.storage.match_response(&self.cache_name, url) {
      Ok(hit) => hit.map(|c| c.response),
      Err(e) => {
        // A broken cache read is a miss
        warn!(url, error = %e, "Failed to read response cache");
        None
      }
    }
  }

  fn store(&self, request: &Request, response: &Response) {
    if request.method != Method::GET {
      return;
    }
    if let Err(e) =
      self
        .storage
        .put_response(&self.cache_name, request.cache_key(), response, Utc::now())
    {
      warn!(url = %request.url, error = %e, "Failed to cache response");
    }
  }
}

impl<T: Transport> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: self.transport.clone(),
      cache_name: self.cache_name.clone(),
      offline_url: self.offline_url.clone(),
      offline_ttl: self.offline_ttl,
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::types::RequestMode;
  use crate::cache::traits::ResponseSource;
  use crate::testing::{test_config, url, FakeTransport};

  fn layer(transport: &FakeTransport) -> (CacheLayer<FakeTransport>, Arc<Database>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let layer = CacheLayer::new(Arc::clone(&db), transport.clone(), &test_config()).unwrap();
    (layer, db)
  }

  const CSS: &str = "/static/css/dashboard.css";
  const SEARCH: &str = "/ajax/produtos/search/";

  #[tokio::test]
  async fn test_cache_first_serves_second_request_from_cache() {
    let transport = FakeTransport::new();
    transport.route(CSS, Response::new(200, "body { margin: 0 }"));
    let (layer, _) = layer(&transport);
    let request = Request::get(url(CSS));

    let first = layer.cache_first(&request).await;
    assert_eq!(first.source, ResponseSource::Network);

    let second = layer.cache_first(&request).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, b"body { margin: 0 }".to_vec());
    assert_eq!(transport.call_count(CSS), 1);
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_is_503() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let (layer, _) = layer(&transport);

    let served = layer.cache_first(&Request::get(url("/static/js/pdv.js"))).await;
    assert_eq!(served.source, ResponseSource::Synthesized);
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.body_text(), STATIC_UNAVAILABLE);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let transport = FakeTransport::new();
    let (layer, db) = layer(&transport);

    let served = layer.cache_first(&Request::get(url("/static/missing.css"))).await;
    assert_eq!(served.response.status, 404);
    assert!(db.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let transport = FakeTransport::new();
    transport.route("/relatorios/", Response::new(200, "report"));
    let (layer, _) = layer(&transport);
    let request = Request::get(url("/relatorios/"));

    assert_eq!(layer.network_first(&request).await.source, ResponseSource::Network);

    transport.set_offline(true);
    let served = layer.network_first(&request).await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body_text(), "report");
  }

  #[tokio::test]
  async fn test_network_first_navigation_gets_offline_page() {
    let transport = FakeTransport::new();
    let (layer, db) = layer(&transport);
    db.put_response(
      "test-v1",
      url("/offline/").as_str(),
      &Response::new(200, "<h1>Offline</h1>"),
      Utc::now(),
    )
    .unwrap();
    transport.set_offline(true);

    let nav = Request::get(url("/vendas/")).with_mode(RequestMode::Navigate);
    let served = layer.network_first(&nav).await;
    assert_eq!(served.response.body_text(), "<h1>Offline</h1>");

    let xhr = Request::get(url("/vendas/"));
    let served = layer.network_first(&xhr).await;
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.body_text(), UNAVAILABLE);
  }

  #[tokio::test]
  async fn test_offline_store_round_trip() {
    let transport = FakeTransport::new();
    let payload = json!({"success": true, "produtos": [{"id": 7, "nome": "Benuron"}]});
    transport.route(SEARCH, Response::json(200, &payload));
    let (layer, _) = layer(&transport);
    let request = Request::get(url(SEARCH));

    let online = layer.network_first_offline(&request).await;
    assert_eq!(online.source, ResponseSource::Network);

    transport.set_offline(true);
    let offline = layer.network_first_offline(&request).await;
    assert_eq!(offline.source, ResponseSource::OfflineStore);
    assert_eq!(offline.response.status, 200);
    assert_eq!(offline.response.header("content-type"), Some("application/json"));
    assert_eq!(offline.response.json_body::<Value>().unwrap(), payload);
  }

  #[tokio::test]
  async fn test_offline_store_serves_two_hour_old_record() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let (layer, db) = layer(&transport);
    let payload = json!({"produtos": []});
    db.put_offline_data(url(SEARCH).as_str(), &payload, Utc::now() - Duration::hours(2))
      .unwrap();

    let served = layer.network_first_offline(&Request::get(url(SEARCH))).await;
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.json_body::<Value>().unwrap(), payload);
  }

  #[tokio::test]
  async fn test_offline_store_without_record_is_structured_503() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let (layer, db) = layer(&transport);
    db.put_offline_data(url(SEARCH).as_str(), &json!(1), Utc::now() - Duration::hours(30))
      .unwrap();

    let served = layer.network_first_offline(&Request::get(url(SEARCH))).await;
    assert_eq!(served.source, ResponseSource::Synthesized);
    assert_eq!(served.response.status, 503);
    assert_eq!(
      served.response.json_body::<Value>().unwrap(),
      json!({"success": false, "error": "data unavailable offline", "offline": true})
    );
  }

  #[tokio::test]
  async fn test_offline_store_malformed_json_takes_failure_path() {
    let transport = FakeTransport::new();
    transport.route(SEARCH, Response::new(200, "<html>login</html>"));
    let (layer, db) = layer(&transport);
    db.put_offline_data(url(SEARCH).as_str(), &json!({"cached": true}), Utc::now())
      .unwrap();

    let served = layer.network_first_offline(&Request::get(url(SEARCH))).await;
    assert_eq!(served.source, ResponseSource::OfflineStore);
    assert_eq!(served.response.json_body::<Value>().unwrap(), json!({"cached": true}));
  }

  #[tokio::test]
  async fn test_offline_store_passes_through_http_errors() {
    let transport = FakeTransport::new();
    transport.route(SEARCH, Response::new(500, "boom"));
    let (layer, db) = layer(&transport);

    let served = layer.network_first_offline(&Request::get(url(SEARCH))).await;
    assert_eq!(served.response.status, 500);
    assert!(db.get_offline_record(url(SEARCH).as_str()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_in_background() {
    let transport = FakeTransport::new();
    let (layer, db) = layer(&transport);
    let page = url("/dashboard/");
    db.put_response("test-v1", page.as_str(), &Response::new(200, "old"), Utc::now())
      .unwrap();
    transport.route("/dashboard/", Response::new(200, "new"));

    let request = Request::navigate(page.clone());
    let served = layer.stale_while_revalidate(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body_text(), "old");

    layer.settle().await;
    let cached = db.match_response("test-v1", page.as_str()).unwrap().unwrap();
    assert_eq!(cached.response.body_text(), "new");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refresh_errors_are_swallowed() {
    let transport = FakeTransport::new();
    let (layer, db) = layer(&transport);
    let page = url("/dashboard/");
    db.put_response("test-v1", page.as_str(), &Response::new(200, "old"), Utc::now())
      .unwrap();
    transport.set_offline(true);

    let served = layer
      .stale_while_revalidate(&Request::navigate(page.clone()))
      .await
      .unwrap();
    assert_eq!(served.response.body_text(), "old");
    layer.settle().await;
    let cached = db.match_response("test-v1", page.as_str()).unwrap().unwrap();
    assert_eq!(cached.response.body_text(), "old");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let transport = FakeTransport::new();
    transport.route("/pdv/", Response::new(200, "pdv"));
    let (layer, _) = layer(&transport);

    let served = layer
      .stale_while_revalidate(&Request::navigate(url("/pdv/")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);

    transport.set_offline(true);
    assert!(layer
      .stale_while_revalidate(&Request::navigate(url("/other/")))
      .await
      .is_none());
  }

  #[tokio::test]
  async fn test_handle_ends_navigation_chain_with_offline_page() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let (layer, db) = layer(&transport);
    db.put_response(
      "test-v1",
      url("/offline/").as_str(),
      &Response::new(200, "offline page"),
      Utc::now(),
    )
    .unwrap();

    let served = layer
      .handle(Strategy::StaleWhileRevalidate, &Request::navigate(url("/pdv/")))
      .await;
    assert_eq!(served.response.body_text(), "offline page");
  }

  #[tokio::test]
  async fn test_post_is_never_cached() {
    let transport = FakeTransport::new();
    transport.route("/ajax/vendas/finalizar/", Response::new(200, "{}"));
    let (layer, db) = layer(&transport);

    let post = Request::post_json(url("/ajax/vendas/finalizar/"), &json!({"id": 1}));
    layer.network_first(&post).await;
    assert!(db.cache_names().unwrap().is_empty());

    transport.set_offline(true);
    assert_eq!(layer.network_first(&post).await.response.status, 503);
  }
}
