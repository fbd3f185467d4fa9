//! Background sync: deferred replay of offline sales and reference cache refresh.

mod connectivity;
mod coordinator;

pub use connectivity::{Connectivity, Reachability};
pub use coordinator::SyncCoordinator;

use color_eyre::{eyre::eyre, Report};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Known background sync tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTag {
  /// Replay sales created while offline
  OfflineSales,
  /// Refresh the product catalog and reference caches
  DataCache,
}

impl SyncTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::OfflineSales => "sync-vendas-offline",
      Self::DataCache => "sync-data-cache",
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "sync-vendas-offline" => Ok(Self::OfflineSales),
      "sync-data-cache" => Ok(Self::DataCache),
      other => Err(eyre!("Unknown sync tag: {}", other)),
    }
  }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub tag: SyncTag,
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
  /// Records left alone because they exhausted the retry policy
  pub skipped: usize,
}

impl SyncReport {
  pub fn new(tag: SyncTag) -> Self {
    Self {
      tag,
      attempted: 0,
      synced: 0,
      failed: 0,
      skipped: 0,
    }
  }

  /// No failure that a later run could fix.
  pub fn is_complete(&self) -> bool {
    self.failed == 0
  }
}

impl fmt::Display for SyncReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}: {} attempted, {} synced, {} failed, {} skipped",
      self.tag, self.attempted, self.synced, self.failed, self.skipped
    )
  }
}

/// Tags registered by the application and waiting to fire.
#[derive(Debug, Default)]
pub struct SyncRegistry {
  tags: Mutex<BTreeSet<SyncTag>>,
}

impl SyncRegistry {
  pub fn register(&self, tag: SyncTag) {
    if let Ok(mut tags) = self.tags.lock() {
      tags.insert(tag);
    }
  }

  pub fn unregister(&self, tag: SyncTag) {
    if let Ok(mut tags) = self.tags.lock() {
      tags.remove(&tag);
    }
  }

  pub fn registered(&self) -> Vec<SyncTag> {
    self
      .tags
      .lock()
      .map(|tags| tags.iter().copied().collect())
      .unwrap_or_default()
  }
}
