//! Deployer HTTP client
//!
//! Every worker node runs a deployer service that reports installed
//! artifacts and switches their versions. Right after a node restarts the
//! deployer may not be listening yet, so a connection-refused condition is
//! retried a bounded number of times with a fixed backoff before it is
//! escalated; every other failure is surfaced immediately.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Attempts for connection-refused conditions.
pub const CONNECT_RETRIES: u32 = 3;
/// Fixed backoff between attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A deployable artifact as reported by a node's deployer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub group: String,
    pub artifact: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("deployer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("deployer at {url} refused connection after {attempts} attempt(s)")]
    Unreachable { url: String, attempts: u32 },

    #[error("deployer returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
}

/// Injected collaborator for the per-node deployer service.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Deployable-name -> deployment map of one node.
    async fn deployments(&self, base_url: &str)
        -> Result<HashMap<String, Deployment>, DeployerError>;

    /// Ordered list of versions offered for an artifact.
    async fn versions(
        &self,
        base_url: &str,
        group: &str,
        artifact: &str,
    ) -> Result<Vec<String>, DeployerError>;

    /// Switch a deployable to a version.
    async fn set_version(
        &self,
        base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<(), DeployerError>;

    /// Remove a deployable from the node.
    async fn undeploy(&self, base_url: &str, name: &str) -> Result<(), DeployerError>;
}

/// Production client over HTTP.
pub struct HttpDeployer {
    http: Client,
    retries: u32,
    backoff: Duration,
}

impl HttpDeployer {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");
        Self {
            http,
            retries: CONNECT_RETRIES,
            backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    async fn send_with_retry(
        &self,
        url: &str,
        make: impl Fn(&Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DeployerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match make(&self.http).send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(DeployerError::Status {
                            url: url.to_string(),
                            status: response.status().as_u16(),
                        });
                    }
                    return Ok(response);
                }
                Err(e) if e.is_connect() && attempt < self.retries => {
                    warn!(
                        "deployer at {} refused connection (attempt {}/{}), retrying",
                        url, attempt, self.retries
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) if e.is_connect() => {
                    return Err(DeployerError::Unreachable {
                        url: url.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(DeployerError::Http(e)),
            }
        }
    }
}

impl Default for HttpDeployer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Deployer for HttpDeployer {
    async fn deployments(
        &self,
        base_url: &str,
    ) -> Result<HashMap<String, Deployment>, DeployerError> {
        let response = self
            .send_with_retry(base_url, |client| client.get(base_url))
            .await?;
        Ok(response.json().await?)
    }

    async fn versions(
        &self,
        base_url: &str,
        group: &str,
        artifact: &str,
    ) -> Result<Vec<String>, DeployerError> {
        let url = format!("{}/repository/versions", base_url.trim_end_matches('/'));
        let response = self
            .send_with_retry(&url, |client| {
                client
                    .get(&url)
                    .query(&[("groupId", group), ("artifactId", artifact)])
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn set_version(
        &self,
        base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<(), DeployerError> {
        let field = format!("{}.version", name);
        self.send_with_retry(base_url, |client| {
            client
                .post(base_url)
                .form(&[(field.as_str(), version)])
        })
        .await?;
        Ok(())
    }

    async fn undeploy(&self, base_url: &str, name: &str) -> Result<(), DeployerError> {
        let field = format!("{}.state", name);
        self.send_with_retry(base_url, |client| {
            client
                .post(base_url)
                .form(&[(field.as_str(), "undeployed")])
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn unused_base_url() -> String {
        // bind and drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    #[test]
    fn test_deployment_json_shape() {
        let json = r#"{
            "shop-ui": {
                "group": "com.example.shop",
                "artifact": "shop-ui",
                "version": "1.4.2",
                "type": "war"
            },
            "shop-api": {
                "group": "com.example.shop",
                "artifact": "shop-api",
                "version": "2.0.0",
                "type": "war",
                "error": "context failed to start"
            }
        }"#;
        let parsed: HashMap<String, Deployment> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["shop-ui"].version, "1.4.2");
        assert_eq!(parsed["shop-ui"].kind, "war");
        assert!(parsed["shop-ui"].error.is_none());
        assert!(parsed["shop-api"].error.is_some());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retried_then_escalated() {
        let base = unused_base_url();
        let client = HttpDeployer::new().with_retry(2, Duration::from_millis(10));
        let started = std::time::Instant::now();
        let result = client.deployments(&base).await;
        match result {
            Err(DeployerError::Unreachable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected Unreachable, got {:?}", other.map(|_| ())),
        }
        // at least one backoff sleep happened
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
