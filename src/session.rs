use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::agent::{AgentClient, TaskOutcome};
use crate::platforms::AntiDetectionParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Idle,
    Error,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Error => "error",
            SessionStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// One platform's live interaction with the agent.
pub struct BrowserSession {
    pub platform: String,
    pub agent: AgentClient,
    pub params: AntiDetectionParams,
    pub started_at: DateTime<Local>,
    pub last_activity: DateTime<Local>,
    pub status: SessionStatus,
    pub jobs_found: usize,
    pub applications_made: usize,
    pub error_count: usize,
    pub live_view_url: Option<String>,
    pub recording_url: Option<String>,
}

impl BrowserSession {
    pub fn new(platform: &str, agent: AgentClient, params: AntiDetectionParams) -> Self {
        let now = Local::now();
        Self {
            platform: platform.to_string(),
            agent,
            params,
            started_at: now,
            last_activity: now,
            status: SessionStatus::Initializing,
            jobs_found: 0,
            applications_made: 0,
            error_count: 0,
            live_view_url: None,
            recording_url: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.agent.current_session_id()
    }

    /// Folds a task outcome into the session's activity counters.
    pub fn record(&mut self, outcome: &TaskOutcome) {
        self.last_activity = Local::now();
        match outcome {
            TaskOutcome::Completed(report) => {
                if report.live_view_url.is_some() {
                    self.live_view_url = report.live_view_url.clone();
                }
                if report.recording_url.is_some() {
                    self.recording_url = report.recording_url.clone();
                }
            }
            TaskOutcome::Failed { .. } => self.error_count += 1,
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        debug!(platform = %self.platform, from = %self.status, to = %status, "Session status");
        self.status = status;
        self.last_activity = Local::now();
    }

    pub fn duration_secs(&self) -> f64 {
        (Local::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            platform: self.platform.clone(),
            status: self.status,
            session_id: self.session_id().map(str::to_string),
            started_at: self.started_at,
            last_activity: self.last_activity,
            duration_secs: self.duration_secs(),
            jobs_found: self.jobs_found,
            applications_made: self.applications_made,
            error_count: self.error_count,
            live_view_url: self.live_view_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub platform: String,
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub started_at: DateTime<Local>,
    pub last_activity: DateTime<Local>,
    pub duration_secs: f64,
    pub jobs_found: usize,
    pub applications_made: usize,
    pub error_count: usize,
    pub live_view_url: Option<String>,
}

/// Active sessions keyed by platform. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionSnapshot>>>,
}

impl SessionRegistry {
    fn table(&self) -> MutexGuard<'_, HashMap<String, SessionSnapshot>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers the session. It stays listed until the returned guard drops.
    pub fn register(&self, session: &BrowserSession) -> Registration {
        self.table().insert(session.platform.clone(), session.snapshot());
        info!(platform = %session.platform, "Session registered");
        Registration {
            registry: self.clone(),
            platform: session.platform.clone(),
        }
    }

    pub fn update(&self, session: &BrowserSession) {
        if let Some(entry) = self.table().get_mut(&session.platform) {
            *entry = session.snapshot();
        }
    }

    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self.table().values().cloned().collect();
        sessions.sort_by(|a, b| a.platform.cmp(&b.platform));
        sessions
    }
}

pub struct Registration {
    registry: SessionRegistry,
    platform: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.table().remove(&self.platform);
        info!(platform = %self.platform, "Session deregistered");
    }
}
