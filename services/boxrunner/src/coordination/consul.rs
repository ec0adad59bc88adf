//! Consul agent HTTP client.
//!
//! Reference: https://developer.hashicorp.com/consul/api-docs

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    go_duration, CoordinationClient, CoordinationError, HealthCheckInfo, KvPair, SessionInfo,
};

/// Consul HTTP API client.
///
/// No request timeout is configured: blocking KV reads are expected to hang
/// until the agent answers.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    /// Create a client for the agent at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, CoordinationError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Agent base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    /// URL of `key` in the KV store, with the key percent-encoded.
    fn kv_url(&self, key: &str) -> Result<reqwest::Url, CoordinationError> {
        let mut url = reqwest::Url::parse(&self.url("kv"))
            .map_err(|e| CoordinationError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| CoordinationError::InvalidUrl(self.base_url.clone()))?
            .push(key);
        Ok(url)
    }

    /// Turn a non-success response into an API error.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, CoordinationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        error!(status = %status, message = %message, "Consul API error");
        Err(CoordinationError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreateRequest<'a> {
    name: &'a str,
    checks: &'a [String],
    lock_delay: String,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct SessionEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Serialize)]
struct CheckRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "HTTP")]
    http: &'a str,
    #[serde(rename = "Interval")]
    interval: String,
    /// Consul starts new checks as critical otherwise.
    #[serde(rename = "Status")]
    status: &'static str,
}

#[derive(Deserialize)]
struct AgentCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    modify_index: u64,
}

impl KvEntry {
    fn into_pair(self) -> Result<KvPair, CoordinationError> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| CoordinationError::Decode(format!("KV value: {e}")))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()),
            modify_index: self.modify_index,
        })
    }
}

#[async_trait]
impl CoordinationClient for ConsulClient {
    async fn create_session(
        &self,
        name: &str,
        checks: &[String],
        lock_delay: Duration,
    ) -> Result<String, CoordinationError> {
        debug!(name = name, checks = ?checks, "Creating session");
        let request = SessionCreateRequest {
            name,
            checks,
            lock_delay: go_duration(lock_delay),
        };

        let response = self
            .client
            .put(self.url("session/create"))
            .json(&request)
            .send()
            .await?;
        let body: IdResponse = Self::ensure_success(response).await?.json().await?;
        Ok(body.id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, CoordinationError> {
        let response = self.client.get(self.url("session/list")).send().await?;
        let entries: Vec<SessionEntry> = Self::ensure_success(response).await?.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| SessionInfo {
                id: e.id,
                name: e.name,
            })
            .collect())
    }

    async fn register_health_check(
        &self,
        id: &str,
        url: &str,
        interval: Duration,
    ) -> Result<(), CoordinationError> {
        debug!(check_id = id, url = url, "Registering health check");
        let registration = CheckRegistration {
            id,
            name: id,
            http: url,
            interval: go_duration(interval),
            status: "passing",
        };

        let response = self
            .client
            .put(self.url("agent/check/register"))
            .json(&registration)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn list_health_checks(&self) -> Result<Vec<HealthCheckInfo>, CoordinationError> {
        let response = self.client.get(self.url("agent/checks")).send().await?;
        let checks: HashMap<String, AgentCheck> =
            Self::ensure_success(response).await?.json().await?;
        Ok(checks
            .into_values()
            .map(|c| HealthCheckInfo { id: c.check_id })
            .collect())
    }

    async fn kv_get(
        &self,
        key: &str,
        wait_index: Option<u64>,
    ) -> Result<Option<KvPair>, CoordinationError> {
        let mut request = self.client.get(self.kv_url(key)?);
        if let Some(index) = wait_index {
            request = request.query(&[("index", index)]);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let entries: Vec<KvEntry> = Self::ensure_success(response).await?.json().await?;
        entries.into_iter().next().map(KvEntry::into_pair).transpose()
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> Result<bool, CoordinationError> {
        let response = self
            .client
            .put(self.kv_url(key)?)
            .query(&[("acquire", session)])
            .body(value.to_vec())
            .send()
            .await?;
        let acquired: bool = Self::ensure_success(response).await?.json().await?;
        Ok(acquired)
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let response = self
            .client
            .put(self.kv_url(key)?)
            .query(&[("release", session)])
            .send()
            .await?;
        let released: bool = Self::ensure_success(response).await?.json().await?;
        Ok(released)
    }
}
