use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{RbError, Result};
use crate::plugin::PluginAccess;

/// Remote health-check endpoints under `/instance/{id}/healthcheck`.
#[async_trait]
pub trait HealthCheckApi: Send + Sync {
    /// Start a health check and return its handle.
    async fn start_health_check(&self, instance_id: &str) -> Result<String>;
    /// Current status string of a running health check (e.g. `RUNNING`).
    async fn health_check_status(&self, instance_id: &str, handle: &str) -> Result<String>;
    async fn delete_health_check(&self, instance_id: &str, handle: &str) -> Result<()>;
}

/// Resource status endpoint `/instance/{id}/status`.
#[async_trait]
pub trait InstanceStatusApi: Send + Sync {
    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Gvk {
    #[serde(rename = "Group", default)]
    pub group: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Kind", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceStatus {
    pub name: String,
    #[serde(rename = "GVK")]
    pub gvk: Gvk,
    #[serde(default)]
    pub status: Value,
}

impl ResourceStatus {
    /// `status.phase` as reported by the cluster, if any.
    pub fn phase(&self) -> Option<&str> {
        self.status
            .get("status")
            .and_then(|inner| inner.get("phase"))
            .and_then(Value::as_str)
    }

    pub fn is_pod(&self) -> bool {
        self.gvk.kind == "Pod"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct InstanceStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(rename = "resourceCount", default)]
    pub resource_count: u32,
    #[serde(rename = "resourcesStatus", default)]
    pub resources_status: Vec<ResourceStatus>,
}

impl InstanceStatus {
    /// Names of pods whose phase is anything other than `Running`.
    pub fn pods_not_running(&self) -> Vec<String> {
        self.resources_status
            .iter()
            .filter(|resource| resource.is_pod() && resource.phase() != Some("Running"))
            .map(|resource| {
                format!(
                    "{} ({})",
                    resource.name,
                    resource.phase().unwrap_or("unknown")
                )
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct HealthCheckHandle {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HealthCheckState {
    status: String,
}

/// Async client for `/instance` endpoints of the orchestration plugin.
#[derive(Clone)]
pub struct InstanceClient {
    client: Client,
    access: PluginAccess,
}

impl InstanceClient {
    pub fn new(access: PluginAccess) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(access.default_headers()?)
            .build()
            .map_err(|err| RbError::Transport(err.to_string()))?;
        Ok(Self { client, access })
    }

    /// Raw instance details, including the deployed resource list.
    pub async fn instance_details(&self, instance_id: &str) -> Result<Value> {
        self.get_json(&format!("/instance/{instance_id}")).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.access.endpoint(path);
        debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| RbError::Transport(format!("GET {url}: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RbError::Transport(format!("failed to read body of {url}: {err}")))?;
        if !status.is_success() {
            return Err(RbError::Http {
                method: "GET",
                url,
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body)
            .map_err(|err| RbError::Transport(format!("invalid response from {url}: {err}")))
    }
}

#[async_trait]
impl HealthCheckApi for InstanceClient {
    async fn start_health_check(&self, instance_id: &str) -> Result<String> {
        let url = self
            .access
            .endpoint(&format!("/instance/{instance_id}/healthcheck"));
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|err| RbError::Transport(format!("POST {url}: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RbError::Transport(format!("failed to read body of {url}: {err}")))?;
        if !status.is_success() {
            return Err(RbError::Http {
                method: "POST",
                url,
                status: status.as_u16(),
                body,
            });
        }
        let handle: HealthCheckHandle = serde_json::from_str(&body)
            .map_err(|err| RbError::Transport(format!("invalid health check handle: {err}")))?;
        Ok(handle.id)
    }

    async fn health_check_status(&self, instance_id: &str, handle: &str) -> Result<String> {
        let state: HealthCheckState = self
            .get_json(&format!("/instance/{instance_id}/healthcheck/{handle}"))
            .await?;
        Ok(state.status)
    }

    async fn delete_health_check(&self, instance_id: &str, handle: &str) -> Result<()> {
        let url = self
            .access
            .endpoint(&format!("/instance/{instance_id}/healthcheck/{handle}"));
        debug!("DELETE {url}");
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|err| RbError::Transport(format!("DELETE {url}: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RbError::Http {
            method: "DELETE",
            url,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl InstanceStatusApi for InstanceClient {
    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        self.get_json(&format!("/instance/{instance_id}/status"))
            .await
    }
}
