use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tracing::error;
use url::Url;

use super::client::Transport;
use super::types::Request;
use crate::config::Config;

#[derive(Debug, Deserialize)]
struct TokenResponse {
  token: String,
}

/// Where mutating requests get their `X-CSRFToken` header from.
///
/// A page-embedded token (configuration or VISTO_CSRF_TOKEN) wins; otherwise
/// the token endpoint is asked on every call.
#[derive(Clone)]
pub struct CsrfSource<T: Transport> {
  transport: T,
  embedded: Option<String>,
  endpoint: Url,
}

pub const CSRF_HEADER: &str = "x-csrftoken";

impl<T: Transport> CsrfSource<T> {
  pub fn new(transport: T, config: &Config) -> Result<Self> {
    Ok(Self {
      transport,
      embedded: config.backend.csrf_token.clone(),
      endpoint: config.resolve(&config.sync.csrf_endpoint)?,
    })
  }

  /// Current token, or an empty string when none can be obtained.
  pub async fn token(&self) -> String {
    if let Some(token) = &self.embedded {
      return token.clone();
    }

    match self.fetch_token().await {
      Ok(token) => token,
      Err(e) => {
        error!(error = %e, "Failed to obtain CSRF token");
        String::new()
      }
    }
  }

  async fn fetch_token(&self) -> Result<String> {
    let response = self
      .transport
      .fetch(&Request::get(self.endpoint.clone()))
      .await?;

    let body: TokenResponse = response
      .json_body()
      .map_err(|e| eyre!("Invalid CSRF token response: {}", e))?;
    Ok(body.token)
  }
}
