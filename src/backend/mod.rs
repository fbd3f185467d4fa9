//! Everything that talks to the point-of-sale backend.

pub mod api;
pub mod client;
pub mod csrf;
pub mod types;
