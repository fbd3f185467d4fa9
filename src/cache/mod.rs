//! Request routing and caching strategies.
//!
//! Each intercepted request is classified by the [`Router`] and answered by
//! the [`CacheLayer`] using the strategy for its category:
//! - static assets are served cache-first
//! - API data goes network-first and falls back to the offline store
//! - page navigations are served stale-while-revalidate
//! - everything else goes network-first

mod layer;
mod router;
mod traits;

pub use layer::CacheLayer;
pub use router::Router;
pub use traits::{ResponseSource, Served};
