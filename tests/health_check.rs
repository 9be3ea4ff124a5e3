use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rb_deployer::plugin::HealthCheckApi;
use rb_deployer::{
    HealthCheckOrchestrator, HealthCheckSettings, RbError, Result, SessionState, TerminalStatus,
};
use tokio::time::Instant;

/// Each instance reports RUNNING for `running_polls` polls, then `final_status`.
struct FleetStub {
    plans: HashMap<String, (u32, &'static str)>,
    polls: Mutex<HashMap<String, u32>>,
    deletes: Mutex<HashMap<String, u32>>,
    poll_errors: Vec<String>,
}

impl FleetStub {
    fn new(plans: &[(&str, u32, &'static str)]) -> Self {
        Self {
            plans: plans
                .iter()
                .map(|(id, running, status)| (id.to_string(), (*running, *status)))
                .collect(),
            polls: Mutex::default(),
            deletes: Mutex::default(),
            poll_errors: Vec::new(),
        }
    }

    fn deletes_for(&self, instance: &str) -> u32 {
        self.deletes
            .lock()
            .unwrap()
            .get(instance)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl HealthCheckApi for FleetStub {
    async fn start_health_check(&self, instance_id: &str) -> Result<String> {
        Ok(format!("{instance_id}-hc"))
    }

    async fn health_check_status(&self, instance_id: &str, handle: &str) -> Result<String> {
        assert_eq!(handle, format!("{instance_id}-hc"));
        if self.poll_errors.iter().any(|id| id == instance_id) {
            return Err(RbError::Transport("status endpoint unavailable".into()));
        }
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(instance_id.to_string()).or_insert(0);
        *count += 1;
        let (running, status) = self.plans.get(instance_id).copied().unwrap_or((u32::MAX, "RUNNING"));
        if *count <= running {
            Ok("Running".to_string())
        } else {
            Ok(status.to_string())
        }
    }

    async fn delete_health_check(&self, instance_id: &str, _handle: &str) -> Result<()> {
        *self
            .deletes
            .lock()
            .unwrap()
            .entry(instance_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

fn settings(max_polls: u32) -> HealthCheckSettings {
    HealthCheckSettings {
        poll_interval: Duration::from_secs(10),
        max_polls,
    }
}

#[tokio::test(start_paused = true)]
async fn mixed_fleet_aggregates_per_instance_results() {
    let stub = Arc::new(FleetStub::new(&[
        ("upf", 2, "SUCCEEDED"),
        ("amf", 0, "FAILED"),
        ("smf", 0, "succeeded"),
    ]));
    let orchestrator = HealthCheckOrchestrator::new(Arc::clone(&stub), settings(4));
    let started = Instant::now();

    let result = orchestrator.run(["upf", "amf", "smf", "stuck"]).await;

    assert!(!result.all_succeeded);
    assert_eq!(result.outcome("upf"), Some(&TerminalStatus::Succeeded));
    assert_eq!(result.outcome("smf"), Some(&TerminalStatus::Succeeded));
    assert!(matches!(result.outcome("amf"), Some(TerminalStatus::Failed { .. })));
    assert_eq!(result.outcome("stuck"), Some(&TerminalStatus::Timeout));
    assert_eq!(result.failures(), vec!["amf", "stuck"]);

    for instance in ["upf", "amf", "smf", "stuck"] {
        assert_eq!(stub.deletes_for(instance), 1, "{instance} cleanup");
        assert_eq!(result.sessions[instance].state, SessionState::CleanedUp);
    }
    assert_eq!(result.sessions["upf"].polls, 3);
    assert_eq!(result.sessions["stuck"].polls, 4);

    // the slowest session bounds the wall clock: 4 polls, 3 waits
    assert_eq!(started.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn poll_errors_fail_only_their_session() {
    let mut stub = FleetStub::new(&[("upf", 1, "SUCCEEDED")]);
    stub.poll_errors.push("flaky".to_string());
    let stub = Arc::new(stub);
    let orchestrator = HealthCheckOrchestrator::new(Arc::clone(&stub), settings(30));

    let result = orchestrator
        .run(vec!["flaky".to_string(), "upf".to_string()])
        .await;

    assert!(matches!(
        result.outcome("flaky"),
        Some(TerminalStatus::Failed { reason }) if reason.contains("status endpoint unavailable")
    ));
    assert_eq!(result.outcome("upf"), Some(&TerminalStatus::Succeeded));
    assert_eq!(stub.deletes_for("flaky"), 1);
}

#[tokio::test(start_paused = true)]
async fn aggregate_serializes_for_reporting() {
    let stub = Arc::new(FleetStub::new(&[("upf", 0, "SUCCEEDED")]));
    let result = HealthCheckOrchestrator::new(stub, HealthCheckSettings::default())
        .run(["upf"])
        .await;

    let value = serde_json::to_value(&result).expect("serializable");
    assert_eq!(value["all_succeeded"], true);
    assert_eq!(value["sessions"]["upf"]["state"], "CLEANED_UP");
    assert_eq!(value["sessions"]["upf"]["outcome"]["result"], "succeeded");
    assert_eq!(value["sessions"]["upf"]["handle"], "upf-hc");
}
