//! Network side of the cache: how a key turns into a JSON payload.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::resource::Resource;

/// Loads the payload for a cache key.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, key: &str) -> Result<Value>;
}

/// Fetcher backed by a closure. Mostly useful in tests and small hosts.
pub struct FnFetcher<F> {
  f: F,
}

impl<F, Fut> FnFetcher<F>
where
  F: Fn(String) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  pub fn new(f: F) -> Self {
    Self { f }
  }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
  F: Fn(String) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  async fn fetch(&self, key: &str) -> Result<Value> {
    (self.f)(key.to_string()).await
  }
}

/// Fetcher that GETs each resource from the JoyBor REST backend.
#[derive(Clone)]
pub struct RestFetcher {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  endpoints: HashMap<String, String>,
}

impl RestFetcher {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base = Url::parse(&normalized).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
      endpoints: HashMap::new(),
    })
  }

  /// Override the path used for `key`.
  pub fn with_endpoint(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
    self.endpoints.insert(key.into(), path.into());
    self
  }

  fn endpoint(&self, key: &str) -> Result<Url> {
    let path = match self.endpoints.get(key) {
      Some(path) => path.as_str(),
      None => key
        .parse::<Resource>()
        .map(Resource::default_endpoint)
        .map_err(|_| eyre!("No endpoint configured for cache key {}", key))?,
    };
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid endpoint {} for {}: {}", path, key, e))
  }
}

#[async_trait]
impl Fetcher for RestFetcher {
  async fn fetch(&self, key: &str) -> Result<Value> {
    let url = self.endpoint(key)?;

    let mut request = self.client.get(url.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("GET {} failed: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("GET {} returned {}", url, status));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn fetcher(server: &MockServer, token: Option<&str>) -> RestFetcher {
    RestFetcher::new(
      &format!("{}/api", server.uri()),
      token.map(String::from),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_fetches_default_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/students/"))
      .and(header("authorization", "Bearer secret"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
      .expect(1)
      .mount(&server)
      .await;

    let data = fetcher(&server, Some("secret")).fetch("students").await.unwrap();
    assert_eq!(data, json!([{"id": 1}]));
  }

  #[tokio::test]
  async fn test_endpoint_override() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/admin/monthly-revenue/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 12})))
      .mount(&server)
      .await;

    let data = fetcher(&server, None)
      .with_endpoint("monthlyRevenue", "/admin/monthly-revenue/")
      .fetch("monthlyRevenue")
      .await
      .unwrap();
    assert_eq!(data, json!({"total": 12}));
  }

  #[tokio::test]
  async fn test_non_success_status_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/payments/"))
      .respond_with(ResponseTemplate::new(502))
      .mount(&server)
      .await;

    let err = fetcher(&server, None).fetch("payments").await.unwrap_err();
    assert!(err.to_string().contains("502"));
  }

  #[tokio::test]
  async fn test_unknown_key_without_endpoint() {
    let server = MockServer::start().await;
    let err = fetcher(&server, None).fetch("notifications").await.unwrap_err();
    assert!(err.to_string().contains("No endpoint configured"));
  }
}
