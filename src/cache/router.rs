//! Request classification.

use reqwest::Method;

use crate::backend::types::{Request, RequestMode};
use crate::config::RoutesConfig;

use super::traits::Strategy;

/// Category of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  StaticAsset,
  ApiData,
  PageNavigation,
  Other,
}

impl RequestKind {
  pub fn strategy(self) -> Strategy {
    match self {
      Self::StaticAsset => Strategy::CacheFirst,
      Self::ApiData => Strategy::NetworkFirstOffline,
      Self::PageNavigation => Strategy::StaleWhileRevalidate,
      Self::Other => Strategy::NetworkFirst,
    }
  }
}

/// Ordered predicate checks; the first match wins.
#[derive(Debug, Clone)]
pub struct Router {
  routes: RoutesConfig,
}

impl Router {
  pub fn new(routes: RoutesConfig) -> Self {
    Self { routes }
  }

  pub fn classify(&self, request: &Request) -> RequestKind {
    let path = request.url.path();

    if self.is_static(path) {
      RequestKind::StaticAsset
    } else if self.is_api(path) {
      RequestKind::ApiData
    } else if is_page_request(request) {
      RequestKind::PageNavigation
    } else {
      RequestKind::Other
    }
  }

  fn is_static(&self, path: &str) -> bool {
    self
      .routes
      .static_prefixes
      .iter()
      .any(|prefix| path.contains(prefix.as_str()))
      || self
        .routes
        .static_extensions
        .iter()
        .any(|ext| path.ends_with(ext.as_str()))
  }

  fn is_api(&self, path: &str) -> bool {
    self
      .routes
      .api
      .iter()
      .any(|route| path.contains(route.as_str()))
  }
}

/// Navigation, or a GET that accepts HTML. A missing Accept header does not count.
pub fn is_page_request(request: &Request) -> bool {
  request.mode == RequestMode::Navigate
    || (request.method == Method::GET
      && request
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html")))
}
