use std::sync::Arc;

use futures::future::try_join_all;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{RbError, Result};
use crate::healthcheck::HealthCheckSettings;
use crate::plugin::InstanceStatusApi;

/// Waits until every pod of every instance reports phase `Running`.
pub struct PodStatusChecker<A> {
    api: Arc<A>,
    settings: HealthCheckSettings,
}

impl<A: InstanceStatusApi> PodStatusChecker<A> {
    pub fn new(api: Arc<A>, settings: HealthCheckSettings) -> Self {
        Self { api, settings }
    }

    /// Number of polls it took for all pods to run. Transport errors abort;
    /// an exhausted poll budget is a `Timeout`.
    pub async fn wait_until_running(&self, instance_ids: &[String]) -> Result<u32> {
        let mut pending = Vec::new();
        for attempt in 1..=self.settings.max_polls {
            pending = self.not_running(instance_ids).await?;
            if pending.is_empty() {
                info!("all pods running after {attempt} poll(s)");
                return Ok(attempt);
            }
            info!(
                "waiting for {} pod(s) ({attempt}/{})",
                pending.len(),
                self.settings.max_polls
            );
            if attempt < self.settings.max_polls {
                sleep(self.settings.poll_interval).await;
            }
        }

        warn!("pods still not running: {}", pending.join(", "));
        Err(RbError::Timeout(format!(
            "pods not running after {} poll(s): {}",
            self.settings.max_polls,
            pending.join(", ")
        )))
    }

    async fn not_running(&self, instance_ids: &[String]) -> Result<Vec<String>> {
        let statuses = try_join_all(
            instance_ids
                .iter()
                .map(|instance_id| self.api.instance_status(instance_id)),
        )
        .await?;
        Ok(instance_ids
            .iter()
            .zip(statuses)
            .flat_map(|(instance_id, status)| {
                status
                    .pods_not_running()
                    .into_iter()
                    .map(move |pod| format!("{instance_id}: {pod}"))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::InstanceStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Reports the pod as Pending for the first `pending_polls` calls.
    struct WarmingUp {
        pending_polls: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl InstanceStatusApi for WarmingUp {
        async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            let phase = if *calls <= self.pending_polls {
                "Pending"
            } else {
                "Running"
            };
            Ok(serde_json::from_value(json!({
                "ready": phase == "Running",
                "resourceCount": 1,
                "resourcesStatus": [{
                    "name": format!("{instance_id}-pod"),
                    "GVK": {"Kind": "Pod"},
                    "status": {"status": {"phase": phase}}
                }]
            }))
            .unwrap())
        }
    }

    fn checker(pending_polls: u32, max_polls: u32) -> PodStatusChecker<WarmingUp> {
        PodStatusChecker::new(
            Arc::new(WarmingUp {
                pending_polls,
                calls: Mutex::new(0),
            }),
            HealthCheckSettings {
                poll_interval: Duration::from_secs(10),
                max_polls,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_pods_run() {
        let polls = checker(2, 5)
            .wait_until_running(&["inst-1".to_string()])
            .await
            .unwrap();
        assert_eq!(polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_pods_stay_pending() {
        let err = checker(10, 3)
            .wait_until_running(&["inst-1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RbError::Timeout(_)));
        assert!(err.to_string().contains("inst-1: inst-1-pod (Pending)"));
    }
}
