use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use super::{SyncReport, SyncTag};
use crate::backend::client::Transport;
use crate::backend::csrf::{CsrfSource, CSRF_HEADER};
use crate::backend::types::Request;
use crate::cache::{CacheLayer, ResponseSource};
use crate::config::Config;
use crate::db::{Database, PendingSale, ProductCacheEntry};

/// Drains offline sales to the backend and refreshes reference data.
///
/// Runs independently of request handling and shares only the store with it.
pub struct SyncCoordinator<T: Transport> {
  storage: Arc<Database>,
  transport: T,
  csrf: CsrfSource<T>,
  cache: CacheLayer<T>,
  sales_url: Url,
  catalog_url: Url,
  reference_urls: Vec<Url>,
  /// Replay attempts per sale before it is left alone; unlimited when `None`
  max_attempts: Option<u32>,
}

impl<T: Transport> SyncCoordinator<T> {
  pub fn new(
    storage: Arc<Database>,
    transport: T,
    cache: CacheLayer<T>,
    config: &Config,
  ) -> Result<Self> {
    let reference_urls = config
      .sync
      .reference_endpoints
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      csrf: CsrfSource::new(transport.clone(), config)?,
      storage,
      transport,
      cache,
      sales_url: config.resolve(&config.sync.sales_endpoint)?,
      catalog_url: config.resolve(&config.sync.catalog_endpoint)?,
      reference_urls,
      max_attempts: config.sync.max_attempts,
    })
  }

  pub async fn run(&self, tag: SyncTag) -> Result<SyncReport> {
    match tag {
      SyncTag::OfflineSales => self.sync_offline_sales().await,
      SyncTag::DataCache => self.sync_data_cache().await,
    }
  }

  /// Replay every unsynced sale in creation order.
  ///
  /// A sale is marked synced only on a 2xx answer. Failures leave it for the
  /// next trigger and never abort the batch.
  pub async fn sync_offline_sales(&self) -> Result<SyncReport> {
    let mut report = SyncReport::new(SyncTag::OfflineSales);
    let sales = self.storage.unsynced_sales()?;

    if sales.is_empty() {
      return Ok(report);
    }

    info!(count = sales.len(), "Syncing offline sales");
    let token = self.csrf.token().await;

    for sale in sales {
      if self.is_exhausted(&sale) {
        report.skipped += 1;
        continue;
      }

      report.attempted += 1;
      match self.replay(&sale, &token).await {
        Ok(()) => {
          report.synced += 1;
          info!(id = sale.id, "Offline sale synced");
        }
        Err(e) => {
          report.failed += 1;
          error!(id = sale.id, error = %e, "Failed to sync offline sale");
        }
      }
    }

    info!("{}", report);
    Ok(report)
  }

  fn is_exhausted(&self, sale: &PendingSale) -> bool {
    self
      .max_attempts
      .is_some_and(|max| sale.attempts >= max)
  }

  async fn replay(&self, sale: &PendingSale, token: &str) -> Result<()> {
    self.storage.record_sale_attempt(sale.id, Utc::now())?;

    let request =
      Request::post_json(self.sales_url.clone(), &sale.data).with_header(CSRF_HEADER, token);
    let response = self.transport.fetch(&request).await?;

    if !response.is_ok() {
      return Err(eyre!("Backend answered {}", response.status));
    }

    self.storage.mark_sale_synced(sale.id)
  }

  /// Replace the product catalog and refresh the reference caches.
  ///
  /// Each fetch is independent; one failing does not stop the others.
  pub async fn sync_data_cache(&self) -> Result<SyncReport> {
    let mut report = SyncReport::new(SyncTag::DataCache);
    info!("Syncing data cache");

    report.attempted += 1;
    match self.refresh_catalog().await {
      Ok(count) => {
        report.synced += 1;
        info!(count, "Product cache replaced");
      }
      Err(e) => {
        report.failed += 1;
        error!(error = %e, "Failed to refresh product cache");
      }
    }

    for url in &self.reference_urls {
      report.attempted += 1;
      let served = self
        .cache
        .network_first_offline(&Request::get(url.clone()))
        .await;

      if served.source == ResponseSource::Network && served.response.is_ok() {
        report.synced += 1;
      } else {
        report.failed += 1;
        warn!(url = %url, status = served.response.status, "Failed to refresh reference cache");
      }
    }

    info!("{}", report);
    Ok(report)
  }

  async fn refresh_catalog(&self) -> Result<usize> {
    let response = self
      .transport
      .fetch(&Request::get(self.catalog_url.clone()))
      .await?;

    if !response.is_ok() {
      return Err(eyre!("Catalog endpoint answered {}", response.status));
    }

    let products: Vec<ProductCacheEntry> = response
      .json_body()
      .map_err(|e| eyre!("Invalid catalog payload: {}", e))?;

    self.storage.replace_products(&products)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::types::Response;
  use crate::db::Partition;
  use crate::testing::{test_config, url, FakeTransport};
  use chrono::Duration;
  use reqwest::Method;
  use serde_json::{json, Value};

  fn coordinator(
    transport: &FakeTransport,
    config: &Config,
  ) -> (SyncCoordinator<FakeTransport>, Arc<Database>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache = CacheLayer::new(Arc::clone(&db), transport.clone(), config).unwrap();
    let coordinator =
      SyncCoordinator::new(Arc::clone(&db), transport.clone(), cache, config).unwrap();
    (coordinator, db)
  }

  const SALES: &str = "/ajax/vendas/sync-offline/";

  #[tokio::test]
  async fn test_replay_marks_sales_synced() {
    let transport = FakeTransport::new();
    transport.route("/ajax/csrf-token/", Response::json(200, &json!({"token": "t0k"})));
    transport.route(SALES, Response::json(200, &json!({"success": true})));
    let (coordinator, db) = coordinator(&transport, &test_config());

    let first = db.add_sale(&json!({"loja": 1, "total": 10}), Utc::now()).unwrap();
    let second = db.add_sale(&json!({"loja": 1, "total": 20}), Utc::now()).unwrap();

    let report = coordinator.sync_offline_sales().await.unwrap();
    assert_eq!(report.synced, 2);
    assert!(report.is_complete());
    assert!(db.get_sale(first).unwrap().unwrap().synced);
    assert!(db.get_sale(second).unwrap().unwrap().synced);

    let posts: Vec<_> = transport
      .calls()
      .into_iter()
      .filter(|c| c.method == Method::POST)
      .collect();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].header(CSRF_HEADER), Some("t0k"));
    let body: Value = serde_json::from_slice(posts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({"loja": 1, "total": 10}));

    // Synced sales are excluded from the next batch
    let again = coordinator.sync_offline_sales().await.unwrap();
    assert_eq!(again.attempted, 0);
    assert_eq!(transport.call_count(SALES), 2);
  }

  #[tokio::test]
  async fn test_failed_replay_stays_unsynced() {
    let transport = FakeTransport::new();
    transport.route(SALES, Response::new(500, "error"));
    let (coordinator, db) = coordinator(&transport, &test_config());
    let id = db.add_sale(&json!({"total": 1}), Utc::now()).unwrap();

    let report = coordinator.sync_offline_sales().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(!report.is_complete());

    let sale = db.get_sale(id).unwrap().unwrap();
    assert!(!sale.synced);
    assert_eq!(sale.attempts, 1);
  }

  #[tokio::test]
  async fn test_one_failure_does_not_abort_batch() {
    let transport = FakeTransport::new();
    transport.route(SALES, Response::new(200, "{}"));
    transport.fail_next(SALES, 1);
    let (coordinator, db) = coordinator(&transport, &test_config());
    let a = db.add_sale(&json!(1), Utc::now()).unwrap();
    let b = db.add_sale(&json!(2), Utc::now()).unwrap();

    let report = coordinator.sync_offline_sales().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);
    assert!(!db.get_sale(a).unwrap().unwrap().synced);
    assert!(db.get_sale(b).unwrap().unwrap().synced);

    // The failed sale is picked up by the next trigger
    let retry = coordinator.sync_offline_sales().await.unwrap();
    assert_eq!(retry.synced, 1);
    assert_eq!(db.count(Partition::OfflineSales).unwrap(), 2);
  }

  #[tokio::test]
  async fn test_max_attempts_skips_exhausted_sales() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let mut config = test_config();
    config.sync.max_attempts = Some(2);
    let (coordinator, db) = coordinator(&transport, &config);
    let id = db.add_sale(&json!({}), Utc::now() - Duration::minutes(5)).unwrap();

    coordinator.sync_offline_sales().await.unwrap();
    coordinator.sync_offline_sales().await.unwrap();
    let third = coordinator.sync_offline_sales().await.unwrap();

    assert_eq!(third.attempted, 0);
    assert_eq!(third.skipped, 1);
    let sale = db.get_sale(id).unwrap().unwrap();
    assert_eq!(sale.attempts, 2);
    assert!(!sale.synced);
  }

  #[tokio::test]
  async fn test_data_cache_replaces_catalog() {
    let transport = FakeTransport::new();
    let catalog = json!([
      {"id": 1, "codigo_barras": "111", "nome_comercial": "Benuron"},
      {"id": 2, "codigo_barras": "222", "nome_comercial": "Brufen"}
    ]);
    transport.route("/ajax/produtos/cache-offline/", Response::json(200, &catalog));
    transport.route("/ajax/formas-pagamento/", Response::json(200, &json!([{"id": 1}])));
    transport.route("/ajax/clientes/", Response::json(200, &json!([])));
    let (coordinator, db) = coordinator(&transport, &test_config());

    let report = coordinator.sync_data_cache().await.unwrap();
    assert_eq!(report.synced, 3);
    let first = db.all_products().unwrap();
    assert_eq!(first.len(), 2);

    // Unchanged catalog leaves identical contents
    coordinator.sync_data_cache().await.unwrap();
    assert_eq!(db.all_products().unwrap(), first);

    let payments = db
      .get_offline_data(
        url("/ajax/formas-pagamento/").as_str(),
        Duration::hours(24),
        Utc::now(),
      )
      .unwrap();
    assert_eq!(payments, Some(json!([{"id": 1}])));
  }

  #[tokio::test]
  async fn test_data_cache_fetches_are_independent() {
    let transport = FakeTransport::new();
    transport.fail("/ajax/produtos/cache-offline/");
    transport.fail("/ajax/formas-pagamento/");
    transport.route("/ajax/clientes/", Response::json(200, &json!([{"id": 4}])));
    let (coordinator, db) = coordinator(&transport, &test_config());

    let report = coordinator.sync_data_cache().await.unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.synced, 1);
    assert!(db
      .get_offline_record(url("/ajax/clientes/").as_str())
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_failed_catalog_keeps_previous_products() {
    let transport = FakeTransport::new();
    transport.route("/ajax/produtos/cache-offline/", Response::new(502, "bad gateway"));
    let (coordinator, db) = coordinator(&transport, &test_config());
    let existing: Vec<ProductCacheEntry> =
      serde_json::from_value(json!([{"id": 5, "nome_comercial": "Velho"}])).unwrap();
    db.replace_products(&existing).unwrap();

    coordinator.run(SyncTag::DataCache).await.unwrap();
    assert_eq!(db.all_products().unwrap(), existing);
  }
}
