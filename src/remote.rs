use crate::config::Config;
use crate::model::ProductFields;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure of a single call against the inventory service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Timeouts, refused connections, 5xx, 408 and 429.
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("record not found upstream")]
    NotFound,
    #[error("remote rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The request could not be built or the success response was unreadable.
    #[error("invalid remote exchange: {0}")]
    Invalid(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            RemoteError::Invalid(err.to_string())
        } else {
            RemoteError::Transient(err.to_string())
        }
    }
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> RemoteError {
    if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Transient(format!("{}: {}", status, body))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

/// The stored record returned by the service. Only the authoritative id is
/// needed; it may arrive as a JSON string or number.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteProduct {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or numeric id, got {}",
            other
        ))),
    }
}

#[async_trait]
pub trait InventoryApi: Send + Sync {
    async fn create_product(&self, fields: &ProductFields) -> Result<RemoteProduct, RemoteError>;

    async fn update_product(&self, id: &str, fields: &ProductFields) -> Result<(), RemoteError>;

    async fn delete_product(&self, id: &str) -> Result<(), RemoteError>;
}

#[derive(Clone)]
pub struct HttpInventoryClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    health_path: String,
}

impl fmt::Debug for HttpInventoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpInventoryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpInventoryClient {
    pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("inventory-sync/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            health_path: "health".into(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
        let mut client = Self::new(
            base_url,
            cfg.remote.token.clone(),
            Duration::from_millis(cfg.remote.timeout_ms),
        )?;
        client.health_path = cfg.connectivity.probe_path.clone();
        Ok(client)
    }

    /// Base URL joined with percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("remote base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&ProductFields>,
    ) -> Result<reqwest::Request> {
        let url = self.endpoint(segments)?;
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build inventory request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "sending inventory request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        debug!(%status, "inventory response");
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&ProductFields>,
    ) -> Result<reqwest::Request, RemoteError> {
        self.build_request(method, segments, body)
            .map_err(|err| RemoteError::Invalid(format!("{:#}", err)))
    }

    /// `true` when the health endpoint answers with any 2xx.
    pub async fn ping(&self) -> bool {
        let segments: Vec<&str> = self
            .health_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let Ok(url) = self.endpoint(&segments) else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(res) => res.status().is_success(),
            Err(err) => {
                debug!(%err, "health probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl InventoryApi for HttpInventoryClient {
    async fn create_product(&self, fields: &ProductFields) -> Result<RemoteProduct, RemoteError> {
        let request = self.request(Method::POST, &["products"], Some(fields))?;
        let res = self.execute(request).await?;
        // The record was stored; a body we cannot read must not be retried.
        res.json::<RemoteProduct>()
            .await
            .map_err(|err| RemoteError::Invalid(format!("unreadable create response: {}", err)))
    }

    async fn update_product(&self, id: &str, fields: &ProductFields) -> Result<(), RemoteError> {
        let request = self.request(Method::PATCH, &["products", id], Some(fields))?;
        self.execute(request).await?;
        Ok(())
    }

    async fn delete_product(&self, id: &str) -> Result<(), RemoteError> {
        let request = self.request(Method::DELETE, &["products", id], None)?;
        self.execute(request).await?;
        Ok(())
    }
}
