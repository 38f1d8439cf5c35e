//! REST transport used by every cache.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;

/// Options for a single call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub method: Method,
  pub body: Option<Value>,
  pub query: Vec<(String, String)>,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      method: Method::GET,
      body: None,
      query: Vec::new(),
    }
  }
}

impl FetchOptions {
  pub fn get() -> Self {
    Self::default()
  }

  pub fn post(body: Value) -> Self {
    Self {
      method: Method::POST,
      body: Some(body),
      ..Self::default()
    }
  }

  pub fn patch(body: Value) -> Self {
    Self {
      method: Method::PATCH,
      body: Some(body),
      ..Self::default()
    }
  }

  pub fn delete() -> Self {
    Self {
      method: Method::DELETE,
      ..Self::default()
    }
  }

  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((key.into(), value.into()));
    self
  }
}

/// JSON-over-HTTP collaborator. Errors on network failure or non-2xx status.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch_json(&self, endpoint: &str, options: FetchOptions) -> Result<Value>;
}

/// `reqwest`-backed transport with bearer-token auth.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: base_url(&config.base_url)?,
      token,
    })
  }

  fn url_for(&self, endpoint: &str) -> Result<Url> {
    self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid endpoint {}: {}", endpoint, e))
  }
}

/// Parse the base URL, making sure relative joins keep its path.
fn base_url(raw: &str) -> Result<Url> {
  let mut raw = raw.trim().to_string();
  if !raw.ends_with('/') {
    raw.push('/');
  }
  Url::parse(&raw).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch_json(&self, endpoint: &str, options: FetchOptions) -> Result<Value> {
    let url = self.url_for(endpoint)?;
    debug!(method = %options.method, url = %url, "api request");

    let mut request = self
      .client
      .request(options.method.clone(), url)
      .header(header::ACCEPT, "application/json");

    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if !options.query.is_empty() {
      request = request.query(&options.query);
    }
    if let Some(body) = &options.body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", endpoint, e))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", endpoint, e))?;

    if !status.is_success() {
      return Err(eyre!("{} {} returned {}: {}", options.method, endpoint, status, text));
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_str(&text).map_err(|e| eyre!("Invalid JSON from {}: {}", endpoint, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoints_join_below_base_path() {
    let config = ApiConfig {
      base_url: "https://farm.example.com/api/v1".into(),
      ..ApiConfig::default()
    };
    let transport = HttpTransport::new(&config, None).unwrap();

    assert_eq!(
      transport.url_for("/alerts").unwrap().as_str(),
      "https://farm.example.com/api/v1/alerts"
    );
    assert_eq!(
      transport.url_for("chat/conversations/4/messages").unwrap().as_str(),
      "https://farm.example.com/api/v1/chat/conversations/4/messages"
    );
  }

  #[test]
  fn test_invalid_base_url_is_an_error() {
    let config = ApiConfig {
      base_url: "not a url".into(),
      ..ApiConfig::default()
    };
    assert!(HttpTransport::new(&config, None).is_err());
  }
}
