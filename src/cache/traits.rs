//! Core types shared by the caching strategies.

use std::fmt;

use crate::backend::types::Response;

/// Precedence between the local cache and a live fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  /// Network-first that also persists JSON payloads as offline records
  NetworkFirstOffline,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::NetworkFirstOffline => "network-first-offline",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Response cache
  Cache,
  /// Built from a stored offline record
  OfflineStore,
  /// Canned fallback (503 or offline error body)
  Synthesized,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflineStore => "offline-store",
      Self::Synthesized => "synthesized",
    };
    f.write_str(name)
  }
}

/// A response together with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline_store(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::OfflineStore,
    }
  }

  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthesized,
    }
  }
}
