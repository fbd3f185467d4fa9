//! CLI commands and their executors.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::backend::api::{DocumentKind, NewSale, SaleOutcome};
use crate::backend::client::Transport;
use crate::backend::types::Request;
use crate::cache::Served;
use crate::db::{Partition, PendingSale, RecordKey};
use crate::event::EventHandler;
use crate::message::Message;
use crate::sync::{SyncReport, SyncTag};
use crate::worker::{Event, Outcome, Worker};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Precache the essential and point-of-sale resources
  Install,
  /// Drop every cache generation except the current one
  Activate,
  /// Route a request through the caching strategies
  Fetch {
    /// Path or absolute URL
    path: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Accept header
    #[arg(long)]
    accept: Option<String>,
  },
  /// Post a control message, e.g. '{"type":"REQUEST_SYNC"}'
  Message { json: String },
  /// Queue the sale in FILE for background sync
  StoreSale { file: PathBuf },
  /// Register the offline-sales sync and run it if the backend is reachable
  RequestSync,
  /// Run a sync job now (sync-vendas-offline or sync-data-cache)
  Sync { tag: String },
  /// List sales waiting to be synced
  Pending {
    /// Include sales already synced
    #[arg(long)]
    all: bool,
  },
  /// Query the offline product cache
  Products {
    #[arg(long, conflicts_with_all = ["barcode", "name"])]
    id: Option<i64>,
    #[arg(long, conflicts_with = "name")]
    barcode: Option<String>,
    /// Name prefix
    #[arg(long)]
    name: Option<String>,
  },
  /// Show cache generations and partition sizes
  Status,
  /// Empty a partition (data, vendas_offline or produtos_cache)
  Clear { partition: String },
  /// Delete one record: a url in data, an id elsewhere
  Delete { partition: String, key: String },
  /// Drop one cached response from the current generation
  Evict { path: String },
  /// Run the worker: tick loop plus JSON-line messages on stdin
  Run {
    /// Ping interval (defaults to sync.ping_interval_secs)
    #[arg(long)]
    tick_secs: Option<u64>,
  },
  /// Create the sale in FILE, queueing it when the backend is unreachable
  Sale { file: PathBuf },
  /// List the backend's printers
  Printers,
  /// Print a generated document
  Print {
    document: i64,
    #[arg(long)]
    printer: Option<i64>,
  },
  /// Generate a sale's invoice (or receipt) and print it
  PrintSale {
    sale: i64,
    #[arg(long)]
    receipt: bool,
  },
  /// Open the cash drawer attached to PRINTER
  Drawer { printer: i64 },
}

pub async fn execute<T: Transport>(command: Command, worker: Arc<Worker<T>>) -> Result<()> {
  match command {
    Command::Install => {
      let outcome = worker.dispatch(Event::Install).await?;
      println!("{}: {}", worker.config().cache.name, describe(&outcome));
    }
    Command::Activate => {
      let outcome = worker.dispatch(Event::Activate).await?;
      println!("{}", describe(&outcome));
    }
    Command::Fetch {
      path,
      method,
      navigate,
      accept,
    } => {
      let request = build_request(&worker, &path, &method, navigate, accept.as_deref())?;
      let outcome = worker.dispatch(Event::Fetch(request)).await?;
      worker.settle().await;
      match outcome {
        Outcome::Response(served) => print_served(&served),
        other => println!("{}", describe(&other)),
      }
    }
    Command::Message { json } => {
      let payload: Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid message JSON: {}", e))?;
      let outcome = worker.dispatch(Event::Message(payload)).await?;
      println!("{}", describe(&outcome));
    }
    Command::StoreSale { file } => {
      let sale = read_json(&file)?;
      let message = json!({"type": "STORE_OFFLINE_SALE", "sale": sale});
      match worker.dispatch(Event::Message(message)).await? {
        Outcome::SaleStored { id } => {
          if let Some(stored) = worker.storage().get_sale(id)? {
            println!("{}", pending_line(&stored));
          }
        }
        other => return Err(eyre!("Sale not stored: {}", describe(&other))),
      }
    }
    Command::RequestSync => {
      let message = json!({"type": "REQUEST_SYNC"});
      let outcome = worker.dispatch(Event::Message(message)).await?;
      println!("{}", describe(&outcome));
    }
    Command::Sync { tag } => {
      // Unknown tags are an error here, not a silently ignored event
      let tag: SyncTag = tag.parse()?;
      let outcome = worker.dispatch(Event::Sync(tag.to_string())).await?;
      println!("{}", describe(&outcome));
    }
    Command::Pending { all } => {
      let storage = worker.storage();
      let mut sales = storage.unsynced_sales()?;
      if all {
        sales.extend(storage.sales_by_synced(true)?);
        sales.sort_by_key(|s| s.id);
      }
      if sales.is_empty() {
        println!("No pending sales");
      }
      for sale in &sales {
        println!("{}", pending_line(sale));
      }
    }
    Command::Products { id, barcode, name } => {
      let storage = worker.storage();
      let products = match (id, barcode, name) {
        (Some(id), _, _) => storage.get_product(id)?.into_iter().collect(),
        (None, Some(barcode), _) => storage.products_by_barcode(&barcode)?,
        (None, None, Some(name)) => storage.products_by_name(&name)?,
        (None, None, None) => storage.all_products()?,
      };
      println!("{}", to_pretty(&products)?);
    }
    Command::Status => {
      let storage = worker.storage();
      println!("cache:     {}", worker.config().cache.name);
      println!("installed: {}", worker.is_installed()?);
      println!("schema:    v{}", storage.schema_version()?);
      println!("generations: {}", storage.cache_names()?.join(", "));
      for partition in Partition::ALL {
        println!("{:<15} {}", partition.table(), storage.count(partition)?);
      }
    }
    Command::Clear { partition } => {
      let partition: Partition = partition.parse()?;
      let removed = worker.storage().clear(partition)?;
      println!("Removed {} records from {}", removed, partition.table());
    }
    Command::Delete { partition, key } => {
      let partition: Partition = partition.parse()?;
      let key = record_key(partition, &key)?;
      if !worker.storage().delete(partition, key)? {
        return Err(eyre!("No such record in {}", partition.table()));
      }
      println!("Deleted");
    }
    Command::Evict { path } => {
      let url = worker.config().resolve(&path)?;
      let removed = worker
        .storage()
        .delete_response(&worker.config().cache.name, url.as_str())?;
      println!("{}", if removed { "Evicted" } else { "Not cached" });
    }
    Command::Run { tick_secs } => {
      let secs = tick_secs.unwrap_or(worker.config().sync.ping_interval_secs);
      run(Arc::clone(&worker), Duration::from_secs(secs.max(1))).await?;
    }
    Command::Sale { file } => {
      let sale: NewSale = serde_json::from_value(read_json(&file)?)
        .map_err(|e| eyre!("Invalid sale in {}: {}", file.display(), e))?;
      match worker.api()?.create_sale(&sale).await? {
        SaleOutcome::Created(document) => println!(
          "Sale {} signed\n  ATCUD: {}\n  Hash:  {}",
          document.numero_venda, document.atcud, document.hash_documento
        ),
        SaleOutcome::Rejected(message) => return Err(eyre!("Sale rejected: {}", message)),
        SaleOutcome::Queued { id } => {
          println!("Backend unreachable; sale queued offline as #{}", id)
        }
      }
    }
    Command::Printers => {
      let printers = worker.api()?.printers().await?;
      println!("{}", to_pretty(&printers)?);
    }
    Command::Print { document, printer } => {
      worker.api()?.print_document(document, printer).await?;
      println!("Document {} printed", document);
    }
    Command::PrintSale { sale, receipt } => {
      let kind = if receipt {
        DocumentKind::Receipt
      } else {
        DocumentKind::Invoice
      };
      let document = worker.api()?.print_sale(sale, kind).await?;
      println!("Sale {} printed as document {}", sale, document);
    }
    Command::Drawer { printer } => {
      if !worker.api()?.open_drawer(printer).await? {
        return Err(eyre!("Drawer on printer {} did not open", printer));
      }
      println!("Drawer opened");
    }
  }
  Ok(())
}

/// Long-running mode. Installs the current generation first when needed.
async fn run<T: Transport>(worker: Arc<Worker<T>>, tick_rate: Duration) -> Result<()> {
  if !worker.is_installed()? {
    worker.dispatch(Event::Install).await?;
  }

  let stdin = BufReader::new(tokio::io::stdin());
  let events = EventHandler::new(tick_rate, stdin);
  info!(tick_secs = tick_rate.as_secs(), "Worker running");

  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!(error = %e, "Failed to listen for Ctrl-C");
      std::future::pending::<()>().await;
    }
    info!("Shutting down");
  };
  drive(worker, events, shutdown).await;
  Ok(())
}

/// Event loop until `shutdown` resolves or the events run dry.
///
/// Anything that may wait on the network runs as its own task, so a hung
/// request never stalls the loop. Local messages are handled in line and keep
/// their order. At most one tick is in flight.
async fn drive<T, F>(worker: Arc<Worker<T>>, mut events: EventHandler, shutdown: F)
where
  T: Transport,
  F: Future<Output = ()>,
{
  tokio::pin!(shutdown);
  let mut tick: Option<JoinHandle<()>> = None;
  let mut tasks = JoinSet::new();

  loop {
    tokio::select! {
      event = events.next() => {
        let Some(event) = event else { break };
        match event {
          Event::Tick => {
            if tick.as_ref().is_some_and(|t| !t.is_finished()) {
              debug!("Previous tick still running");
              continue;
            }
            let worker = Arc::clone(&worker);
            tick = Some(tokio::spawn(async move {
              log_outcome(worker.dispatch(Event::Tick).await);
            }));
          }
          Event::Message(payload) => {
            let message = Message::parse(&payload);
            if message.needs_network() {
              let worker = Arc::clone(&worker);
              tasks.spawn(async move { log_outcome(worker.message(message).await) });
            } else {
              log_outcome(worker.message(message).await);
            }
          }
          other => {
            let worker = Arc::clone(&worker);
            tasks.spawn(async move { log_outcome(worker.dispatch(other).await) });
          }
        }
      }
      Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
      _ = &mut shutdown => break,
    }
  }

  if let Some(tick) = tick {
    tick.abort();
  }
  tasks.abort_all();
  worker.settle().await;
}

fn log_outcome(result: Result<Outcome>) {
  match result {
    Ok(Outcome::Tick { reports, .. }) if reports.is_empty() => {}
    Ok(outcome) => info!("{}", describe(&outcome)),
    Err(e) => error!(error = %e, "Event handling failed"),
  }
}

fn build_request<T: Transport>(
  worker: &Worker<T>,
  path: &str,
  method: &str,
  navigate: bool,
  accept: Option<&str>,
) -> Result<Request> {
  let url = worker.config().resolve(path)?;
  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  request.method = method;
  if let Some(accept) = accept {
    request = request.with_header("accept", accept);
  }
  Ok(request)
}

fn record_key(partition: Partition, key: &str) -> Result<RecordKey<'_>> {
  match partition {
    Partition::Data => Ok(RecordKey::Url(key)),
    Partition::OfflineSales | Partition::ProductCache => key
      .parse()
      .map(RecordKey::Id)
      .map_err(|e| eyre!("Invalid id {}: {}", key, e)),
  }
}

fn read_json(path: &Path) -> Result<Value> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&contents).map_err(|e| eyre!("Invalid JSON in {}: {}", path.display(), e))
}

fn to_pretty<S: serde::Serialize>(value: &S) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))
}

fn print_served(served: &Served) {
  println!("{} ({})", served.response.status, served.source);
  for (name, value) in &served.response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", served.response.body_text());
}

fn pending_line(sale: &PendingSale) -> String {
  let last = sale
    .last_attempt_at
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "never".to_string());
  format!(
    "#{:<5} {}  attempts={} last={}  {}",
    sale.id,
    sale.created_at.format("%Y-%m-%d %H:%M:%S"),
    sale.attempts,
    last,
    sale.data
  )
}

fn report_summary(report: &SyncReport) -> Value {
  json!({
    "tag": report.tag.as_str(),
    "attempted": report.attempted,
    "synced": report.synced,
    "failed": report.failed,
    "skipped": report.skipped,
  })
}

/// One-line summary of an outcome for the terminal and the log.
pub fn describe(outcome: &Outcome) -> String {
  match outcome {
    Outcome::Installed { precached } => format!("installed ({} cached)", precached),
    Outcome::Activated { removed } if removed.is_empty() => "activated".to_string(),
    Outcome::Activated { removed } => format!("activated, removed {}", removed.join(", ")),
    Outcome::Response(served) => format!("{} from {}", served.response.status, served.source),
    Outcome::Synced(report) => report.to_string(),
    Outcome::SaleStored { id } => format!("sale #{} stored offline", id),
    Outcome::SyncRegistered { tag, report: None } => {
      format!("{} registered; waiting for connectivity", tag)
    }
    Outcome::SyncRegistered {
      report: Some(report),
      ..
    } => report.to_string(),
    Outcome::Tick {
      reachability,
      reports,
    } => {
      let reports: Vec<Value> = reports.iter().map(report_summary).collect();
      format!("{:?} {}", reachability, Value::Array(reports))
    }
    Outcome::Ignored => "ignored".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::types::{RequestMode, Response};
  use crate::db::Database;
  use crate::sync::{Reachability, SyncTag};
  use crate::testing::{test_config, FakeTransport};
  use clap::Parser;

  #[derive(Parser)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  fn parse(args: &[&str]) -> Command {
    Cli::try_parse_from(std::iter::once("visto-offline").chain(args.iter().copied()))
      .unwrap()
      .command
  }

  #[test]
  fn test_parse_commands() {
    assert!(matches!(
      parse(&["fetch", "/pdv/", "--navigate"]),
      Command::Fetch { navigate: true, .. }
    ));
    assert!(matches!(
      parse(&["print-sale", "12", "--receipt"]),
      Command::PrintSale {
        sale: 12,
        receipt: true
      }
    ));
    assert!(matches!(
      parse(&["sync", "sync-data-cache"]),
      Command::Sync { .. }
    ));
    assert!(Cli::try_parse_from(["visto-offline", "products", "--barcode", "1", "--name", "a"]).is_err());
  }

  #[test]
  fn test_record_key() {
    assert!(matches!(
      record_key(Partition::OfflineSales, "12").unwrap(),
      RecordKey::Id(12)
    ));
    assert!(matches!(
      record_key(Partition::Data, "http://pos.local/ajax/clientes/").unwrap(),
      RecordKey::Url("http://pos.local/ajax/clientes/")
    ));
    assert!(record_key(Partition::ProductCache, "abc").is_err());
  }

  #[test]
  fn test_build_request() {
    let worker = Worker::new(
      test_config(),
      Database::open_in_memory().unwrap(),
      FakeTransport::new(),
    )
    .unwrap();

    let nav = build_request(&worker, "/pdv/", "get", true, None).unwrap();
    assert_eq!(nav.mode, RequestMode::Navigate);
    assert_eq!(nav.url.as_str(), "http://pos.local/pdv/");

    let post = build_request(&worker, "/ajax/vendas/nova/", "post", false, Some("application/json")).unwrap();
    assert_eq!(post.method, Method::POST);
    assert_eq!(post.header("accept"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_commands_go_through_the_dispatcher() {
    let transport = FakeTransport::new();
    for path in test_config().cache.essential_resources {
      transport.route(&path, Response::new(200, "ok"));
    }
    let worker = Arc::new(
      Worker::new(
        test_config(),
        Database::open_in_memory().unwrap(),
        transport.clone(),
      )
      .unwrap(),
    );

    execute(Command::Install, Arc::clone(&worker)).await.unwrap();
    assert!(worker.is_installed().unwrap());
    assert_eq!(worker.state(), crate::worker::LifecycleState::Activated);

    let bogus = Command::Sync {
      tag: "sync-everything".to_string(),
    };
    assert!(execute(bogus, Arc::clone(&worker)).await.is_err());
  }

  #[tokio::test]
  async fn test_hung_ping_does_not_stall_queued_sales() {
    const PING: &str = "/ajax/ping/";
    let transport = FakeTransport::new();
    transport.hang(PING);
    let worker = Arc::new(
      Worker::new(
        test_config(),
        Database::open_in_memory().unwrap(),
        transport.clone(),
      )
      .unwrap(),
    );

    let input: &'static [u8] = b"{\"type\": \"STORE_OFFLINE_SALE\", \"sale\": {\"total\": 5}}\n\
{\"type\": \"STORE_OFFLINE_SALE\", \"sale\": {\"total\": 7}}\n";
    let events = EventHandler::new(Duration::from_millis(5), input);

    let watched = Arc::clone(&worker);
    let pinged = transport.clone();
    let both_stored = async move {
      while watched.storage().count(Partition::OfflineSales).unwrap() < 2
        || pinged.call_count(PING) == 0
      {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    };

    tokio::time::timeout(
      Duration::from_secs(5),
      drive(Arc::clone(&worker), events, both_stored),
    )
    .await
    .expect("event loop stalled behind the ping");

    let sales = worker.storage().unsynced_sales().unwrap();
    assert_eq!(sales[0].data, json!({"total": 5}));
    assert_eq!(sales[1].data, json!({"total": 7}));
    // Later ticks are skipped while the first one is still waiting
    assert_eq!(transport.call_count(PING), 1);
  }

  #[test]
  fn test_describe() {
    let mut report = SyncReport::new(SyncTag::OfflineSales);
    report.attempted = 1;
    report.synced = 1;

    assert_eq!(
      describe(&Outcome::SyncRegistered {
        tag: SyncTag::OfflineSales,
        report: None
      }),
      "sync-vendas-offline registered; waiting for connectivity"
    );
    assert_eq!(
      describe(&Outcome::Response(Served::synthesized(Response::new(503, "")))),
      format!("503 from {}", crate::cache::ResponseSource::Synthesized)
    );
    let tick = describe(&Outcome::Tick {
      reachability: Reachability::Restored,
      reports: vec![report],
    });
    assert!(tick.starts_with("Restored"));
    assert!(tick.contains("\"synced\":1"));
  }
}
