//! The offline worker: one explicitly constructed context and a dispatcher
//! keyed by event kind.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::api::BackendApi;
use crate::backend::client::Transport;
use crate::backend::types::{Request, Response};
use crate::cache::{CacheLayer, Router, Served};
use crate::config::Config;
use crate::db::Database;
use crate::message::Message;
use crate::sync::{Connectivity, Reachability, SyncCoordinator, SyncRegistry, SyncReport, SyncTag};

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Activated,
  /// Install failed
  Redundant,
}

/// Events the worker reacts to.
#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  /// Background sync by tag name
  Sync(String),
  /// Raw message payload from the application
  Message(Value),
  /// Periodic reachability tick
  Tick,
}

/// What handling an event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Installed { precached: usize },
  Activated { removed: Vec<String> },
  Response(Served),
  Synced(SyncReport),
  SaleStored { id: i64 },
  SyncRegistered { tag: SyncTag, report: Option<SyncReport> },
  Tick { reachability: Reachability, reports: Vec<SyncReport> },
  /// Unknown tag or message, or nothing to do
  Ignored,
}

pub struct Worker<T: Transport> {
  config: Arc<Config>,
  storage: Arc<Database>,
  transport: T,
  router: Router,
  cache: CacheLayer<T>,
  sync: SyncCoordinator<T>,
  registry: SyncRegistry,
  connectivity: Connectivity,
  state: Mutex<LifecycleState>,
}

impl<T: Transport> Worker<T> {
  pub fn new(config: Config, storage: Database, transport: T) -> Result<Self> {
    let storage = Arc::new(storage);
    let cache = CacheLayer::new(Arc::clone(&storage), transport.clone(), &config)?;
    let sync = SyncCoordinator::new(
      Arc::clone(&storage),
      transport.clone(),
      cache.clone(),
      &config,
    )?;
    let connectivity = Connectivity::new(config.resolve(&config.sync.ping_endpoint)?);

    Ok(Self {
      router: Router::new(config.routes.clone()),
      config: Arc::new(config),
      storage,
      transport,
      cache,
      sync,
      registry: SyncRegistry::default(),
      connectivity,
      state: Mutex::new(LifecycleState::Parsed),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn storage(&self) -> &Database {
    &self.storage
  }

  /// Backend client sharing this worker's transport and store.
  pub fn api(&self) -> Result<BackendApi<T>> {
    BackendApi::new(self.transport.clone(), Arc::clone(&self.storage), &self.config)
  }

  /// Whether every essential resource, the offline page included, is
  /// cached in the current generation.
  pub fn is_installed(&self) -> Result<bool> {
    for path in self.essential_paths() {
      let url = self.config.resolve(&path)?;
      if self
        .storage
        .match_response(self.cache.cache_name(), url.as_str())?
        .is_none()
      {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Essential resources plus the offline page, which is always essential.
  fn essential_paths(&self) -> Vec<String> {
    let mut paths = self.config.cache.essential_resources.clone();
    if !paths.contains(&self.config.cache.offline_url) {
      paths.push(self.config.cache.offline_url.clone());
    }
    paths
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, next: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      debug!(from = ?*state, to = ?next, "Lifecycle transition");
      *state = next;
    }
  }

  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    match event {
      Event::Install => {
        let precached = self.install().await?;
        Ok(Outcome::Installed { precached })
      }
      Event::Activate => {
        let removed = self.activate()?;
        Ok(Outcome::Activated { removed })
      }
      Event::Fetch(request) => Ok(Outcome::Response(self.fetch(&request).await)),
      Event::Sync(tag) => match tag.parse::<SyncTag>() {
        Ok(tag) => Ok(Outcome::Synced(self.sync(tag).await?)),
        Err(e) => {
          warn!(error = %e, "Ignoring sync event");
          Ok(Outcome::Ignored)
        }
      },
      Event::Message(payload) => self.message(Message::parse(&payload)).await,
      Event::Tick => Ok(self.tick().await),
    }
  }

  /// Precache the essential resources atomically, then the point-of-sale
  /// resources best-effort.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(LifecycleState::Installing);
    info!(cache = self.cache.cache_name(), "Caching essential resources");

    let essentials = match self.fetch_all(&self.essential_paths()).await {
      Ok(entries) => entries,
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        return Err(e);
      }
    };

    if let Err(e) = self
      .storage
      .put_responses(self.cache.cache_name(), &essentials, Utc::now())
    {
      self.set_state(LifecycleState::Redundant);
      return Err(e);
    }

    let mut precached = essentials.len();
    for path in &self.config.cache.pdv_resources {
      match self.precache_one(path).await {
        Ok(()) => precached += 1,
        Err(e) => warn!(path = path.as_str(), error = %e, "Skipping point-of-sale resource"),
      }
    }

    self.set_state(LifecycleState::Installed);
    info!(precached, "Worker installed");

    if self.config.cache.skip_waiting_on_install {
      self.activate()?;
    }
    Ok(precached)
  }

  /// Fetch every path; any failure fails the whole set.
  async fn fetch_all(&self, paths: &[String]) -> Result<Vec<(String, Response)>> {
    let urls = paths
      .iter()
      .map(|p| self.config.resolve(p))
      .collect::<Result<Vec<_>>>()?;

    let results = join_all(urls.iter().map(|url| {
      let request = Request::get(url.clone());
      async move { self.transport.fetch(&request).await }
    }))
    .await;

    let mut entries = Vec::with_capacity(urls.len());
    for (url, result) in urls.into_iter().zip(results) {
      let response = result?;
      if !response.is_ok() {
        return Err(eyre!("Precache of {} failed with status {}", url, response.status));
      }
      entries.push((url.to_string(), response));
    }
    Ok(entries)
  }

  async fn precache_one(&self, path: &str) -> Result<()> {
    let url = self.config.resolve(path)?;
    let response = self.transport.fetch(&Request::get(url.clone())).await?;
    if !response.is_ok() {
      return Err(eyre!("status {}", response.status));
    }
    self
      .storage
      .put_response(self.cache.cache_name(), url.as_str(), &response, Utc::now())
  }

  /// Remove every cache generation except the current one.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.set_state(LifecycleState::Activating);
    let current = self.cache.cache_name();

    let mut removed = Vec::new();
    for name in self.storage.cache_names()? {
      if name != current {
        info!(cache = name.as_str(), "Removing old cache");
        self.storage.delete_cache(&name)?;
        removed.push(name);
      }
    }

    self.set_state(LifecycleState::Activated);
    Ok(removed)
  }

  /// Activate now if installed and waiting.
  pub fn skip_waiting(&self) -> Result<Option<Vec<String>>> {
    if self.state() == LifecycleState::Installed {
      return self.activate().map(Some);
    }
    debug!(state = ?self.state(), "Skip waiting without a waiting worker");
    Ok(None)
  }

  /// Route a request to its strategy. Always produces a response.
  pub async fn fetch(&self, request: &Request) -> Served {
    let kind = self.router.classify(request);
    let strategy = kind.strategy();
    debug!(url = %request.url, ?kind, %strategy, "Intercepted request");

    let served = self.cache.handle(strategy, request).await;
    debug!(url = %request.url, status = served.response.status, source = %served.source, "Responded");
    served
  }

  /// Run a sync job now. A complete run clears its registration.
  pub async fn sync(&self, tag: SyncTag) -> Result<SyncReport> {
    let report = self.sync.run(tag).await?;
    if report.is_complete() {
      self.registry.unregister(tag);
    }
    Ok(report)
  }

  /// Fire every registered tag; failures stay registered.
  pub async fn fire_registered(&self) -> Vec<SyncReport> {
    let mut reports = Vec::new();
    for tag in self.registry.registered() {
      match self.sync(tag).await {
        Ok(report) => reports.push(report),
        Err(e) => error!(%tag, error = %e, "Background sync failed"),
      }
    }
    reports
  }

  pub async fn message(&self, message: Message) -> Result<Outcome> {
    match message {
      Message::SkipWaiting => Ok(match self.skip_waiting()? {
        Some(removed) => Outcome::Activated { removed },
        None => Outcome::Ignored,
      }),
      Message::StoreOfflineSale { sale } => {
        let id = self.store_offline_sale(&sale)?;
        Ok(Outcome::SaleStored { id })
      }
      Message::RequestSync => {
        let tag = SyncTag::OfflineSales;
        self.registry.register(tag);
        let report = if self.connectivity.is_online() {
          Some(self.sync(tag).await?)
        } else {
          None
        };
        Ok(Outcome::SyncRegistered { tag, report })
      }
      Message::Unknown => {
        warn!("Ignoring unrecognized message");
        Ok(Outcome::Ignored)
      }
    }
  }

  pub fn store_offline_sale(&self, sale: &Value) -> Result<i64> {
    let id = self.storage.add_sale(sale, Utc::now())?;
    info!(id, "Sale stored offline");
    Ok(id)
  }

  /// Ping the backend; when it is reachable, fire registered syncs.
  pub async fn tick(&self) -> Outcome {
    let reachability = self.connectivity.ping(&self.transport).await;
    let reports = if reachability.is_online() {
      self.fire_registered().await
    } else {
      Vec::new()
    };
    Outcome::Tick {
      reachability,
      reports,
    }
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }
}
