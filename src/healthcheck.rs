//! Concurrent health-check sessions against the plugin's instance API.
//!
//! Each instance gets its own task: start, poll on a fixed interval until the
//! status leaves `RUNNING` or the poll budget runs out, then delete the remote
//! check. Sessions never cancel each other; the orchestrator only joins them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, info, info_span, warn};

use crate::plugin::HealthCheckApi;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_POLLS: u32 = 30;

const STATUS_RUNNING: &str = "RUNNING";
const STATUS_SUCCEEDED: &str = "SUCCEEDED";
const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initiated,
    Running,
    Succeeded,
    Failed,
    Timeout,
    CleanedUp,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Initiated => 0,
            SessionState::Running => 1,
            SessionState::Succeeded | SessionState::Failed | SessionState::Timeout => 2,
            SessionState::CleanedUp => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() >= 2
    }
}

/// Final verdict of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed { reason: String },
    Timeout,
}

impl TerminalStatus {
    /// Classify a non-`RUNNING` status string reported by the plugin.
    pub fn from_remote(status: &str) -> Self {
        if status.eq_ignore_ascii_case(STATUS_SUCCEEDED) {
            TerminalStatus::Succeeded
        } else if status.eq_ignore_ascii_case(STATUS_FAILED) {
            TerminalStatus::Failed {
                reason: "health check reported FAILED".to_string(),
            }
        } else {
            TerminalStatus::Failed {
                reason: format!("unexpected health check status '{status}'"),
            }
        }
    }

    fn state(&self) -> SessionState {
        match self {
            TerminalStatus::Succeeded => SessionState::Succeeded,
            TerminalStatus::Failed { .. } => SessionState::Failed,
            TerminalStatus::Timeout => SessionState::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckSession {
    pub instance_id: String,
    pub handle: Option<String>,
    pub state: SessionState,
    pub outcome: Option<TerminalStatus>,
    pub polls: u32,
    #[serde(skip)]
    pub started_at: Instant,
    pub elapsed_ms: u64,
}

impl HealthCheckSession {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            handle: None,
            state: SessionState::Initiated,
            outcome: None,
            polls: 0,
            started_at: Instant::now(),
            elapsed_ms: 0,
        }
    }

    /// Move forward in the state machine. Returns `false` (and leaves the
    /// state untouched) for any transition that would not make progress.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }

    fn finish(&mut self, outcome: TerminalStatus) {
        if self.advance(outcome.state()) {
            self.outcome = Some(outcome);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

/// Per-instance sessions plus the overall verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealthResult {
    pub all_succeeded: bool,
    pub sessions: BTreeMap<String, HealthCheckSession>,
}

impl AggregateHealthResult {
    fn from_sessions(sessions: BTreeMap<String, HealthCheckSession>) -> Self {
        let all_succeeded = sessions
            .values()
            .all(|session| session.outcome.as_ref().is_some_and(TerminalStatus::is_success));
        Self {
            all_succeeded,
            sessions,
        }
    }

    pub fn outcome(&self, instance_id: &str) -> Option<&TerminalStatus> {
        self.sessions
            .get(instance_id)
            .and_then(|session| session.outcome.as_ref())
    }

    /// Instance ids whose session did not succeed.
    pub fn failures(&self) -> Vec<&str> {
        self.sessions
            .iter()
            .filter(|(_, session)| !session.outcome.as_ref().is_some_and(TerminalStatus::is_success))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

pub struct HealthCheckOrchestrator<A> {
    api: Arc<A>,
    settings: HealthCheckSettings,
}

impl<A: HealthCheckApi + 'static> HealthCheckOrchestrator<A> {
    pub fn new(api: Arc<A>, settings: HealthCheckSettings) -> Self {
        Self { api, settings }
    }

    /// Run one session per distinct instance id and wait for all of them.
    pub async fn run<I, S>(&self, instance_ids: I) -> AggregateHealthResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = instance_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            warn!("no instances to health check");
        }

        let results: Arc<Mutex<BTreeMap<String, HealthCheckSession>>> = Arc::default();
        let handles: Arc<Mutex<BTreeMap<String, String>>> = Arc::default();
        let mut tasks = JoinSet::new();
        for instance_id in &ids {
            let api = Arc::clone(&self.api);
            let results = Arc::clone(&results);
            let handles = Arc::clone(&handles);
            let settings = self.settings;
            let span = info_span!("health_check", instance = %instance_id);
            let instance_id = instance_id.clone();
            tasks.spawn(
                async move {
                    let session =
                        run_session(api.as_ref(), instance_id, settings, &handles).await;
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(session.instance_id.clone(), session);
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("health check task ended abnormally: {err}");
            }
        }

        let mut sessions = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        let mut handles = std::mem::take(&mut *handles.lock().unwrap_or_else(PoisonError::into_inner));
        for instance_id in ids {
            if sessions.contains_key(&instance_id) {
                continue;
            }
            // The task died before its own cleanup; delete any check it started.
            let mut session = HealthCheckSession::new(instance_id.clone());
            session.handle = handles.remove(&instance_id);
            session.finish(TerminalStatus::Failed {
                reason: "health check task aborted".to_string(),
            });
            cleanup(self.api.as_ref(), &mut session).await;
            sessions.insert(instance_id, session);
        }

        let aggregate = AggregateHealthResult::from_sessions(sessions);
        info!(
            "health check finished for {} instance(s), all succeeded: {}",
            aggregate.sessions.len(),
            aggregate.all_succeeded
        );
        aggregate
    }
}

async fn run_session<A: HealthCheckApi + ?Sized>(
    api: &A,
    instance_id: String,
    settings: HealthCheckSettings,
    handles: &Mutex<BTreeMap<String, String>>,
) -> HealthCheckSession {
    let mut session = HealthCheckSession::new(instance_id);

    match api.start_health_check(&session.instance_id).await {
        Ok(handle) => {
            info!("started health check {handle}");
            handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.instance_id.clone(), handle.clone());
            session.handle = Some(handle);
            session.advance(SessionState::Running);
            let outcome = poll(api, &mut session, settings).await;
            session.finish(outcome);
        }
        Err(err) => {
            warn!("failed to start health check: {err}");
            session.finish(TerminalStatus::Failed {
                reason: format!("start failed: {err}"),
            });
        }
    }

    cleanup(api, &mut session).await;
    session
}

async fn poll<A: HealthCheckApi + ?Sized>(
    api: &A,
    session: &mut HealthCheckSession,
    settings: HealthCheckSettings,
) -> TerminalStatus {
    let Some(handle) = session.handle.clone() else {
        return TerminalStatus::Failed {
            reason: "no health check handle".to_string(),
        };
    };

    for attempt in 1..=settings.max_polls {
        session.polls = attempt;
        match api.health_check_status(&session.instance_id, &handle).await {
            Ok(status) if status.eq_ignore_ascii_case(STATUS_RUNNING) => {
                info!("health check {handle} still running ({attempt}/{})", settings.max_polls);
            }
            Ok(status) => {
                info!("health check {handle} finished with {status}");
                return TerminalStatus::from_remote(&status);
            }
            Err(err) => {
                warn!("health check {handle} status poll failed: {err}");
                return TerminalStatus::Failed {
                    reason: format!("status poll failed: {err}"),
                };
            }
        }
        if attempt < settings.max_polls {
            sleep(settings.poll_interval).await;
        }
    }

    warn!(
        "health check {handle} still running after {} poll(s)",
        settings.max_polls
    );
    TerminalStatus::Timeout
}

async fn cleanup<A: HealthCheckApi + ?Sized>(api: &A, session: &mut HealthCheckSession) {
    if let Some(handle) = session.handle.as_deref() {
        if let Err(err) = api.delete_health_check(&session.instance_id, handle).await {
            warn!("failed to delete health check {handle}: {err}");
        }
    }
    session.elapsed_ms = u64::try_from(session.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    session.advance(SessionState::CleanedUp);
}
