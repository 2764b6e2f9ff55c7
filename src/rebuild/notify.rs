use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("serving process not reachable: {0}")]
    Unreachable(String),

    #[error("reload timed out after {0}s")]
    Timeout(u64),

    #[error("reload rejected: {0}")]
    Rejected(String),
}

/// Tells the serving process to pick up a freshly saved store.
pub trait ReloadNotifier: Send + Sync {
    /// Returns the identity count the serving process reports.
    fn notify(&self) -> Result<usize, ReloadError>;
}

#[derive(Deserialize)]
struct ReloadReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    num_identities: usize,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpReloadNotifier {
    url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl HttpReloadNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reload client")?;

        Ok(Self {
            url: url.to_string(),
            timeout,
            client,
        })
    }
}

impl ReloadNotifier for HttpReloadNotifier {
    fn notify(&self) -> Result<usize, ReloadError> {
        log::info!("requesting store reload at {}", self.url);

        let response = self.client.post(&self.url).send().map_err(|e| {
            if e.is_timeout() {
                ReloadError::Timeout(self.timeout.as_secs())
            } else {
                ReloadError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body: Option<ReloadReply> = response.json().ok();
            let detail = body
                .and_then(|reply| reply.error)
                .unwrap_or_else(|| format!("serving process answered {status}"));
            return Err(ReloadError::Rejected(detail));
        }

        let reply: ReloadReply = response
            .json()
            .map_err(|e| ReloadError::Rejected(format!("malformed reload reply: {e}")))?;

        if !reply.success {
            return Err(ReloadError::Rejected(
                reply.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(reply.num_identities)
    }
}
