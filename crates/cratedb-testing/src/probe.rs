//! Readiness probing: how many nodes does a member currently see?

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Statement sent to a node to count the members it can see.
pub const NODE_COUNT_STMT: &str = "select count(*) as nodes from sys.nodes";

/// Upper bound for a single probe request.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single probe attempt failed. Failed attempts are retried until the
/// readiness deadline.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The member a probe is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub node: usize,
    pub host: String,
    pub http_port: u16,
}

impl ProbeTarget {
    pub fn address(&self) -> String {
        crate::config::socket_address(&self.host, self.http_port)
    }
}

/// A lightweight status call against one cluster member.
pub trait ReadinessProbe: Send + Sync {
    /// Returns the number of nodes `target` currently sees.
    fn visible_nodes(
        &self,
        target: &ProbeTarget,
    ) -> impl Future<Output = Result<usize, ProbeError>> + Send;
}

/// Probes the `_sql` HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SqlResponse {
    rows: Vec<Vec<serde_json::Value>>,
}

impl HttpProbe {
    /// Builds a probe with a per-request timeout and proxies disabled.
    pub fn try_new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Like [`HttpProbe::try_new`], falling back to a default client.
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|e| {
            warn!(error = %e, "probe client setup failed, using default client");
            Self {
                client: reqwest::Client::new(),
            }
        })
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProbe for HttpProbe {
    async fn visible_nodes(&self, target: &ProbeTarget) -> Result<usize, ProbeError> {
        let url = format!("http://{}/_sql", target.address());
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "stmt": NODE_COUNT_STMT }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body: SqlResponse = response.json().await?;
        body.rows
            .first()
            .and_then(|row| row.first())
            .and_then(serde_json::Value::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| ProbeError::Malformed("rows[0][0] is not a node count".to_string()))
    }
}
