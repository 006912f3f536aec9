use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentClient, AgentTransport, TaskOutcome};
use crate::error::StoreError;
use crate::extract::{ExtractedJob, ExtractionContext, Extractor};
use crate::models::{normalize_url, ApplicationProof, JobRecord, JobStatus, Statistics};
use crate::platforms::PlatformResolver;
use crate::profile::UserProfile;
use crate::session::{BrowserSession, SessionRegistry, SessionSnapshot, SessionStatus};
use crate::settings::Settings;
use crate::store::JobStore;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

// --- Results ---

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    pub success: bool,
    pub jobs: Vec<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationOutcome {
    pub index: usize,
    pub job_url: String,
    pub success: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformReport {
    pub platform: String,
    pub success: bool,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub jobs_found: usize,
    pub job_indices: Vec<usize>,
    pub applications_made: usize,
    pub searches: Vec<SearchOutcome>,
    pub applications: Vec<ApplicationOutcome>,
    pub session_duration_secs: f64,
    pub live_view_url: Option<String>,
    pub recording_url: Option<String>,
}

impl PlatformReport {
    fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            success: false,
            error: None,
            session_id: None,
            jobs_found: 0,
            job_indices: Vec::new(),
            applications_made: 0,
            searches: Vec::new(),
            applications: Vec::new(),
            session_duration_secs: 0.0,
            live_view_url: None,
            recording_url: None,
        }
    }

    fn failed(platform: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(platform)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// True when at least one platform session succeeded.
    pub success: bool,
    pub total_platforms: usize,
    pub scheduled_platforms: Vec<String>,
    pub skipped_platforms: Vec<String>,
    pub successful_platforms: usize,
    pub total_jobs_found: usize,
    pub total_applications: usize,
    pub platform_results: BTreeMap<String, PlatformReport>,
    pub statistics: Statistics,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusReport {
    pub active_sessions: usize,
    pub max_concurrent: usize,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Copy)]
struct FoundJob {
    index: usize,
    heuristic: bool,
}

// --- Orchestrator ---

struct Shared {
    resolver: PlatformResolver,
    store: Arc<JobStore>,
    transport: Arc<dyn AgentTransport>,
    settings: Settings,
    profile: UserProfile,
    extractor: Extractor,
    registry: SessionRegistry,
    /// Job indices some session is applying to right now.
    claims: Mutex<HashSet<usize>>,
}

/// Exclusive right to apply to one job, released on drop.
struct Claim<'a> {
    held: &'a Mutex<HashSet<usize>>,
    index: usize,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.index);
    }
}

/// Runs one agent session per enabled platform, concurrently, and collects
/// what each of them found and applied to.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        resolver: PlatformResolver,
        store: Arc<JobStore>,
        transport: Arc<dyn AgentTransport>,
        settings: Settings,
        profile: UserProfile,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                resolver,
                store,
                transport,
                settings,
                profile,
                extractor: Extractor::default(),
                registry: SessionRegistry::default(),
                claims: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Concurrency bound: the platform document wins over the environment.
    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent()
    }

    pub fn session_status(&self) -> SessionStatusReport {
        SessionStatusReport {
            active_sessions: self.shared.registry.active_count(),
            max_concurrent: self.max_concurrent(),
            sessions: self.shared.registry.snapshots(),
        }
    }

    /// Searches every scheduled platform for every query, applies where the
    /// automation settings allow it, and summarizes the run. Platform
    /// failures are captured in the summary and never abort the run.
    pub async fn run(&self, queries: &[String], matching_context: &str) -> RunSummary {
        let started = Instant::now();
        let shared = &self.shared;

        let enabled = shared.resolver.enabled_platforms();
        let bound = shared.max_concurrent();
        let split = enabled.len().min(bound);
        let scheduled = enabled[..split].to_vec();
        let skipped = enabled[split..].to_vec();

        if enabled.is_empty() {
            warn!("No enabled platforms configured");
        }
        if !skipped.is_empty() {
            warn!(
                bound,
                skipped = ?skipped,
                "More platforms enabled than the concurrency bound; extra platforms are not scheduled this run"
            );
        }
        info!(platforms = ?scheduled, queries = queries.len(), bound, "Starting multi-platform run");

        // Other processes may have applied since this handle last looked.
        if let Err(e) = shared.with_store(|store| store.reload()).await {
            let message = format!("{:#}", e);
            warn!(error = %message, "Could not refresh job store, using cached view");
        }
        let monitor = {
            let this = self.clone();
            tokio::spawn(async move { this.report_progress().await })
        };

        let gate = Arc::new(Semaphore::new(bound));
        let budget = Arc::new(AtomicUsize::new(
            shared.profile.preferences.automation_settings.max_applications_per_run,
        ));
        let queries: Arc<[String]> = queries.into();
        let context: Arc<str> = matching_context.into();

        let handles: Vec<(String, JoinHandle<PlatformReport>)> = scheduled
            .iter()
            .map(|platform| {
                let shared = Arc::clone(shared);
                let gate = Arc::clone(&gate);
                let budget = Arc::clone(&budget);
                let queries = Arc::clone(&queries);
                let context = Arc::clone(&context);
                let key = platform.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return PlatformReport::failed(&key, format!("Admission gate closed: {}", e)),
                    };
                    shared.run_session(&key, &queries, &context, &budget).await
                });
                (platform.clone(), handle)
            })
            .collect();

        let mut platform_results = BTreeMap::new();
        for (platform, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(platform = %platform, error = %e, "Platform session task failed");
                    PlatformReport::failed(&platform, format!("Session task failed: {}", e))
                }
            };
            platform_results.insert(platform, report);
        }
        monitor.abort();

        let successful_platforms = platform_results.values().filter(|r| r.success).count();
        let total_jobs_found = platform_results.values().map(|r| r.jobs_found).sum();
        let total_applications = platform_results.values().map(|r| r.applications_made).sum();

        let summary = RunSummary {
            success: successful_platforms > 0,
            total_platforms: enabled.len(),
            scheduled_platforms: scheduled,
            skipped_platforms: skipped,
            successful_platforms,
            total_jobs_found,
            total_applications,
            platform_results,
            statistics: shared
                .with_store(|store| Ok(store.statistics()))
                .await
                .unwrap_or_default(),
            duration_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            success = summary.success,
            successful = summary.successful_platforms,
            scheduled = summary.scheduled_platforms.len(),
            jobs_found = summary.total_jobs_found,
            applications = summary.total_applications,
            "Run complete"
        );
        summary
    }

    /// Logs the live session table until the task is aborted.
    async fn report_progress(&self) {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = self.session_status();
            info!(active = status.active_sessions, bound = status.max_concurrent, "Session progress");
            for s in &status.sessions {
                debug!(
                    platform = %s.platform,
                    status = %s.status,
                    jobs_found = s.jobs_found,
                    applications = s.applications_made,
                    errors = s.error_count,
                    duration_secs = s.duration_secs,
                    "Session"
                );
            }
        }
    }

    /// Applies to a single stored job outside of a run.
    pub async fn apply_to_index(&self, index: usize) -> Result<ApplicationOutcome> {
        let shared = &self.shared;
        let Some(_claim) = shared.claim(index) else {
            bail!("Job {} is already being applied to", index);
        };
        let (record, total) = shared
            .with_store(move |store| Ok((store.get(index), store.len())))
            .await?;
        let record = record.with_context(|| format!("Job index {} out of range ({} jobs)", index, total))?;
        if record.status == JobStatus::Applied {
            bail!("Job {} is already marked applied", index);
        }
        if normalize_url(&record.job_url).is_none() {
            bail!("Job {} has no URL to apply to", index);
        }

        let platform = if record.job_board.is_empty() { "manual" } else { record.job_board.as_str() };
        let mut session = shared.open_session(platform);
        session.set_status(SessionStatus::Active);
        let outcome = shared.apply_one(&mut session, index, &record).await;
        session.agent.close_session();
        outcome
    }

    pub async fn analyze(&self, job_url: &str) -> TaskOutcome {
        let mut session = self.shared.open_session("manual");
        let outcome = session
            .agent
            .analyze_job_page(job_url, self.shared.settings.analyze_max_steps)
            .await;
        session.agent.close_session();
        outcome
    }

    /// Logs into an application portal with the applicant's email and
    /// reports what the agent saw there.
    pub async fn check_status(&self, portal_url: &str, password: &str) -> TaskOutcome {
        let shared = &self.shared;
        let mut session = shared.open_session("manual");
        let outcome = session
            .agent
            .check_application_status(
                portal_url,
                &shared.profile.personal_info.email,
                password,
                shared.settings.application_max_steps,
            )
            .await;
        session.agent.close_session();
        outcome
    }
}

impl Shared {
    fn max_concurrent(&self) -> usize {
        self.resolver
            .global()
            .max_concurrent_browsers
            .unwrap_or(self.settings.max_concurrent_browsers)
            .max(1)
    }

    fn claim(&self, index: usize) -> Option<Claim<'_>> {
        let mut held = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.insert(index).then(|| Claim {
            held: &self.claims,
            index,
        })
    }

    fn open_session(&self, platform: &str) -> BrowserSession {
        let params = self.resolver.randomized_params(platform);
        let agent = AgentClient::new(Arc::clone(&self.transport), self.settings.use_custom_credentials)
            .with_session_options(params.clone());
        BrowserSession::new(platform, agent, params)
    }

    async fn with_store<T: Send + 'static>(
        &self,
        op: impl FnOnce(&JobStore) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T> {
        let store = Arc::clone(&self.store);
        let value = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .context("Job store task failed")??;
        Ok(value)
    }

    /// init, search, apply, cleanup. Cleanup runs whatever the earlier
    /// phases returned.
    async fn run_session(
        &self,
        platform: &str,
        queries: &[String],
        context: &str,
        budget: &AtomicUsize,
    ) -> PlatformReport {
        let mut session = self.open_session(platform);
        let registration = self.registry.register(&session);
        info!(platform, name = %self.resolver.display_name(platform), "Session initialized");

        let mut report = PlatformReport::new(platform);
        let result = self.drive(&mut session, &mut report, queries, context, budget).await;

        match &result {
            Ok(()) => session.set_status(SessionStatus::Completed),
            Err(_) => {
                session.error_count += 1;
                session.set_status(SessionStatus::Error);
            }
        }
        self.registry.update(&session);

        report.session_id = session.session_id().map(str::to_string);
        report.live_view_url = session.live_view_url.clone();
        report.recording_url = session.recording_url.clone();
        report.applications_made = session.applications_made;
        report.session_duration_secs = session.duration_secs();
        session.agent.close_session();
        drop(registration);

        match result {
            Ok(()) => {
                report.success = true;
                info!(
                    platform,
                    jobs_found = report.jobs_found,
                    applications = report.applications_made,
                    errors = session.error_count,
                    "Session completed"
                );
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(platform, error = %message, "Session failed");
                report.error = Some(message);
            }
        }
        report
    }

    async fn drive(
        &self,
        session: &mut BrowserSession,
        report: &mut PlatformReport,
        queries: &[String],
        context: &str,
        budget: &AtomicUsize,
    ) -> Result<()> {
        session.set_status(SessionStatus::Active);
        self.registry.update(session);

        let platform = session.platform.clone();
        if self.resolver.requires_login(&platform) {
            if !self.resolver.global().no_login_mode {
                bail!("Login required for {}", self.resolver.display_name(&platform));
            }
            warn!(platform = %platform, "Platform requires login; searching without an account");
        }

        let found = self.search_phase(session, report, queries, context).await?;
        self.apply_phase(session, report, &found, budget).await
    }

    async fn search_phase(
        &self,
        session: &mut BrowserSession,
        report: &mut PlatformReport,
        queries: &[String],
        context: &str,
    ) -> Result<Vec<FoundJob>> {
        let platform = session.platform.clone();
        let display = self.resolver.display_name(&platform);
        let search_url = self.resolver.search_url(&platform);
        let mut found: Vec<FoundJob> = Vec::new();

        for (i, query) in queries.iter().enumerate() {
            if i > 0 {
                self.pause(session, self.resolver.random_delay(&platform)).await;
            }

            let outcome = session
                .agent
                .search_jobs(query, context, &display, &search_url, self.settings.search_max_steps)
                .await;
            session.record(&outcome);

            match outcome {
                TaskOutcome::Completed(task) => {
                    let ctx = ExtractionContext {
                        query,
                        platform: &platform,
                        synthesize_placeholders: self.settings.synthesize_placeholder_jobs,
                        jobs_per_search: (self.settings.jobs_per_search_min, self.settings.jobs_per_search_max),
                    };
                    let mut indices = Vec::new();
                    for job in self.extractor.extract(&task.result_text, &ctx) {
                        let heuristic = job.heuristic;
                        let index = self.record_job(&platform, query, job).await?;
                        if !found.iter().any(|f| f.index == index) {
                            found.push(FoundJob { index, heuristic });
                        }
                        indices.push(index);
                    }
                    info!(platform = %platform, query = %query, jobs = indices.len(), "Search finished");
                    report.searches.push(SearchOutcome {
                        query: query.clone(),
                        success: true,
                        jobs: indices,
                        error: None,
                    });
                }
                TaskOutcome::Failed { error, .. } => {
                    warn!(platform = %platform, query = %query, error = %error, "Search failed, continuing with next query");
                    report.searches.push(SearchOutcome {
                        query: query.clone(),
                        success: false,
                        jobs: Vec::new(),
                        error: Some(error),
                    });
                }
            }

            session.jobs_found = found.len();
            self.registry.update(session);
        }

        report.jobs_found = found.len();
        report.job_indices = found.iter().map(|f| f.index).collect();
        Ok(found)
    }

    async fn record_job(&self, platform: &str, query: &str, job: ExtractedJob) -> Result<usize> {
        let mut info = Map::new();
        info.insert("source_platform".into(), Value::from(platform));
        info.insert("search_query".into(), Value::from(query));
        info.insert("requirements".into(), Value::from(job.requirements.clone()));
        info.insert("match_reason".into(), Value::from(job.match_reason.clone()));
        info.insert("heuristic".into(), Value::from(job.heuristic));

        let board = platform.to_string();
        let company = job.company.clone();
        let title = job.job_title.clone();
        let index = self
            .with_store(move |store| {
                let index = store.add(
                    &job.company,
                    &job.job_title,
                    &job.location,
                    &job.job_url,
                    &job.salary_range,
                    &board,
                )?;
                store.merge_additional_info(index, info)?;
                Ok(index)
            })
            .await?;

        info!(index, company = %company, job_title = %title, platform, "Recorded job");
        Ok(index)
    }

    async fn apply_phase(
        &self,
        session: &mut BrowserSession,
        report: &mut PlatformReport,
        found: &[FoundJob],
        budget: &AtomicUsize,
    ) -> Result<()> {
        let platform = session.platform.clone();
        let auto = &self.profile.preferences.automation_settings;

        if found.is_empty() {
            return Ok(());
        }
        if !auto.auto_apply_after_search {
            info!(platform = %platform, jobs = found.len(), "Auto-apply disabled, jobs left for review");
            return Ok(());
        }
        if auto.require_manual_approval {
            let pending: Vec<usize> = found.iter().map(|f| f.index).collect();
            info!(platform = %platform, ?pending, "Jobs awaiting manual approval");
            return Ok(());
        }

        let per_session = self.resolver.max_applications(&platform);
        let floor = Duration::from_secs(auto.application_delay_seconds);
        let mut attempts = 0;

        // The per-session limit caps attempts, failed ones included.
        for job in found {
            if attempts >= per_session {
                info!(platform = %platform, limit = per_session, "Session application limit reached");
                break;
            }
            if job.heuristic {
                debug!(index = job.index, "Skipping unconfirmed placeholder job");
                continue;
            }
            let Some(_claim) = self.claim(job.index) else {
                debug!(index = job.index, "Another session is applying to this job");
                continue;
            };
            let index = job.index;
            let Some(record) = self.with_store(move |store| Ok(store.get(index))).await? else {
                continue;
            };
            if record.status == JobStatus::Applied {
                debug!(index = job.index, "Already applied");
                continue;
            }
            if normalize_url(&record.job_url).is_none() {
                warn!(index = job.index, "Job has no URL, cannot apply");
                continue;
            }
            if !take_one(budget) {
                info!(platform = %platform, "Run application limit reached");
                break;
            }

            if attempts > 0 {
                let pacing = self.resolver.random_delay(&platform).max(floor);
                self.pause(session, pacing).await;
            }
            attempts += 1;

            let outcome = self.apply_one(session, job.index, &record).await?;
            if !outcome.success {
                budget.fetch_add(1, Ordering::SeqCst);
            }
            report.applications.push(outcome);
            self.registry.update(session);
        }
        Ok(())
    }

    /// Asks the agent to apply and, on success, records the proof and moves
    /// the job to applied. A failed application leaves the job untouched.
    async fn apply_one(
        &self,
        session: &mut BrowserSession,
        index: usize,
        record: &JobRecord,
    ) -> Result<ApplicationOutcome> {
        let outcome = session
            .agent
            .apply_to_job(&record.job_url, &self.profile.personal_info, self.settings.application_max_steps)
            .await;
        session.record(&outcome);

        let task = match outcome {
            TaskOutcome::Completed(task) => task,
            TaskOutcome::Failed { error, session_id } => {
                warn!(
                    index,
                    company = %record.company,
                    job_title = %record.job_title,
                    error = %error,
                    "Application failed, job left for manual follow-up"
                );
                return Ok(ApplicationOutcome {
                    index,
                    job_url: record.job_url.clone(),
                    success: false,
                    session_id,
                    error: Some(error),
                });
            }
        };

        let applied_at = Local::now();
        let proof = ApplicationProof {
            application_timestamp: applied_at,
            application_result: task.result_text.clone(),
            live_view_url: task.live_view_url.clone(),
            recording_url: task.recording_url.clone(),
            session_id: task.session_id.clone(),
            steps_taken: task.steps_taken,
            screenshot_requested: true,
        };
        let mut proof_info = Map::new();
        proof_info.insert(
            "application_proof".into(),
            serde_json::to_value(&proof).context("Failed to serialize application proof")?,
        );
        let note = format!(
            "Applied via {} session {} at {}",
            session.platform,
            task.session_id.as_deref().unwrap_or("unknown"),
            applied_at.format("%Y-%m-%d %H:%M:%S")
        );

        let updated = self
            .with_store(move |store| store.mark_applied(index, proof_info, &note))
            .await?;

        if updated {
            session.applications_made += 1;
            info!(index, company = %record.company, job_title = %record.job_title, "Application submitted");
        }
        Ok(ApplicationOutcome {
            index,
            job_url: record.job_url.clone(),
            success: updated,
            session_id: task.session_id,
            error: (!updated).then(|| "Job was already applied or is no longer tracked".to_string()),
        })
    }

    async fn pause(&self, session: &mut BrowserSession, delay: Duration) {
        debug!(platform = %session.platform, delay_secs = delay.as_secs(), "Pacing");
        session.set_status(SessionStatus::Idle);
        self.registry.update(session);
        tokio::time::sleep(delay).await;
        session.set_status(SessionStatus::Active);
    }
}

fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::{completed, FnTransport};
    use crate::agent::{TaskData, TaskRequest};
    use crate::profile::AutomationSettings;
    use crate::store::StoreOptions;
    use anyhow::anyhow;
    use tempfile::TempDir;

    const BOARDS: [&str; 3] = ["Alpha", "Beta", "Gamma"];

    fn platforms(bound: usize, beta_login: bool, no_login_mode: bool) -> PlatformResolver {
        PlatformResolver::from_json(&format!(
            r#"{{
                "platforms": {{
                    "alpha": {{"name": "Alpha", "enabled": true, "priority": 1, "delay_between_actions": "0-0", "max_applications_per_session": 2}},
                    "beta": {{"name": "Beta", "enabled": true, "priority": 2, "delay_between_actions": "0-0", "requires_login": {beta_login}}},
                    "gamma": {{"name": "Gamma", "enabled": true, "priority": 3, "delay_between_actions": "0-0"}},
                    "delta": {{"name": "Delta", "enabled": false}}
                }},
                "global_settings": {{"max_concurrent_browsers": {bound}, "no_login_mode": {no_login_mode}}}
            }}"#
        ))
    }

    fn profile(auto_apply: bool, per_run: usize, manual: bool) -> UserProfile {
        let mut profile = UserProfile::default();
        profile.preferences.automation_settings = AutomationSettings {
            auto_apply_after_search: auto_apply,
            max_applications_per_run: per_run,
            application_delay_seconds: 0,
            require_manual_approval: manual,
        };
        profile.personal_info.email = "ada@example.com".into();
        profile
    }

    fn board_of(req: &TaskRequest) -> Option<&'static str> {
        BOARDS
            .iter()
            .copied()
            .find(|b| req.instructions.contains(&format!("Go to {}", b)))
    }

    /// Searches return two jobs per board; applications always succeed.
    fn job_board(req: &TaskRequest) -> Result<TaskData> {
        let session = req.session_id.clone();
        if req.instructions.starts_with("Apply to the job") {
            return completed("Application submitted, confirmation shown", session.as_deref().unwrap_or("sess-apply"));
        }
        let board = board_of(req).ok_or_else(|| anyhow!("unknown board"))?;
        let lower = board.to_lowercase();
        let text = format!(
            "JOB_START\nCompany: {board} Co\nTitle: Engineer\nURL: https://{lower}.example/jobs/1\nJOB_END\n\
             JOB_START\nCompany: {board} Co\nTitle: Senior Engineer\nURL: https://{lower}.example/jobs/2\nJOB_END"
        );
        completed(&text, session.as_deref().unwrap_or(&format!("sess-{}", lower)))
    }

    fn setup(
        resolver: PlatformResolver,
        profile: UserProfile,
        transport: Arc<FnTransport>,
    ) -> (TempDir, Arc<JobStore>, Orchestrator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs.json"), StoreOptions::default()).unwrap());
        let orchestrator = Orchestrator::new(resolver, Arc::clone(&store), transport, Settings::default(), profile);
        (dir, store, orchestrator)
    }

    fn queries(q: &[&str]) -> Vec<String> {
        q.iter().map(|s| s.to_string()).collect()
    }

    fn apply_requests(transport: &FnTransport) -> Vec<TaskRequest> {
        transport
            .requests()
            .into_iter()
            .filter(|r| r.instructions.starts_with("Apply to the job"))
            .collect()
    }

    #[tokio::test]
    async fn test_failing_platform_is_isolated() {
        let transport = FnTransport::new(|req| {
            if board_of(req) == Some("Beta") {
                panic!("agent crashed mid-search");
            }
            job_board(req)
        });
        let (_dir, store, orchestrator) = setup(platforms(3, false, false), profile(false, 3, false), transport);

        let summary = orchestrator.run(&queries(&["Engineer", "Rust"]), "ctx").await;

        assert!(summary.success);
        assert_eq!(summary.total_platforms, 3);
        assert_eq!(summary.successful_platforms, 2);
        assert_eq!(summary.total_jobs_found, 4);
        assert_eq!(summary.total_applications, 0);
        assert!(summary.platform_results["alpha"].success);
        assert!(summary.platform_results["gamma"].success);
        let beta = &summary.platform_results["beta"];
        assert!(!beta.success);
        assert!(beta.error.is_some());

        // The second query finds the same postings again.
        let alpha = &summary.platform_results["alpha"];
        assert_eq!(alpha.searches.len(), 2);
        assert_eq!(alpha.searches[0].jobs, alpha.searches[1].jobs);
        assert_eq!(alpha.session_id.as_deref(), Some("sess-alpha"));

        assert_eq!(store.len(), 4);
        assert_eq!(summary.statistics.total_jobs, 4);
        let job = store.get(alpha.job_indices[0]).unwrap();
        assert_eq!(job.job_board, "alpha");
        assert_eq!(job.additional_info["source_platform"], "alpha");
        assert_eq!(job.additional_info["heuristic"], false);
        assert_eq!(orchestrator.session_status().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_login_required_fails_without_search() {
        let transport = FnTransport::new(job_board);
        let (_dir, _store, orchestrator) =
            setup(platforms(3, true, false), profile(false, 3, false), transport.clone());

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        let beta = &summary.platform_results["beta"];
        assert!(!beta.success);
        assert!(beta.error.as_deref().unwrap().contains("Login required"));
        assert!(beta.searches.is_empty());
        assert!(transport.requests().iter().all(|r| board_of(r) != Some("Beta")));
        assert_eq!(summary.successful_platforms, 2);
    }

    #[tokio::test]
    async fn test_no_login_mode_searches_anonymously() {
        let transport = FnTransport::new(job_board);
        let (_dir, _store, orchestrator) = setup(platforms(3, true, true), profile(false, 3, false), transport);

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;
        assert!(summary.platform_results["beta"].success);
        assert_eq!(summary.successful_platforms, 3);
    }

    #[tokio::test]
    async fn test_platforms_beyond_bound_are_skipped() {
        let transport = FnTransport::new(job_board);
        let (_dir, _store, orchestrator) =
            setup(platforms(2, false, false), profile(false, 3, false), transport.clone());
        assert_eq!(orchestrator.max_concurrent(), 2);

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        assert_eq!(summary.total_platforms, 3);
        assert_eq!(summary.scheduled_platforms, vec!["alpha", "beta"]);
        assert_eq!(summary.skipped_platforms, vec!["gamma"]);
        assert!(!summary.platform_results.contains_key("gamma"));
        assert!(transport.requests().iter().all(|r| board_of(r) != Some("Gamma")));
    }

    #[tokio::test]
    async fn test_auto_apply_respects_session_and_run_limits() {
        let transport = FnTransport::new(job_board);
        let (_dir, store, orchestrator) =
            setup(platforms(3, false, false), profile(true, 3, false), transport.clone());

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        assert!(summary.success);
        assert_eq!(summary.total_jobs_found, 6);
        assert_eq!(summary.total_applications, 3);
        assert_eq!(summary.statistics.applied_count, 3);
        assert_eq!(apply_requests(&transport).len(), 3);
        assert!(summary.platform_results["alpha"].applications_made <= 2);

        let (index, applied) = store.by_status(JobStatus::Applied).remove(0);
        let proof = &applied.additional_info["application_proof"];
        assert_eq!(proof["application_result"], "Application submitted, confirmation shown");
        assert_eq!(proof["screenshot_requested"], true);
        assert_eq!(proof["session_id"], format!("sess-{}", applied.job_board));
        assert!(summary.platform_results[&applied.job_board]
            .applications
            .iter()
            .any(|a| a.index == index && a.success));

        // Apply tasks continue the session opened by the search.
        for req in apply_requests(&transport) {
            assert!(req.session_id.as_deref().unwrap_or("").starts_with("sess-"));
            assert!(req.session_options.is_none());
        }
    }

    #[tokio::test]
    async fn test_already_applied_jobs_are_skipped() {
        let transport = FnTransport::new(job_board);
        let (_dir, store, orchestrator) =
            setup(platforms(1, false, false), profile(true, 10, false), transport.clone());
        let index = store
            .add("Alpha Co", "Engineer", "Remote", "https://alpha.example/jobs/1", "", "alpha")
            .unwrap();
        store.update_status(index, JobStatus::Applied, "applied by hand").unwrap();

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        let applies = apply_requests(&transport);
        assert_eq!(applies.len(), 1);
        assert!(applies[0].instructions.contains("https://alpha.example/jobs/2"));
        assert_eq!(summary.total_applications, 1);
        assert_eq!(store.by_status(JobStatus::Applied).len(), 2);
    }

    #[tokio::test]
    async fn test_manual_approval_leaves_apply_phase_empty() {
        let transport = FnTransport::new(job_board);
        let (_dir, store, orchestrator) =
            setup(platforms(3, false, false), profile(true, 3, true), transport.clone());

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        assert!(summary.success);
        assert_eq!(summary.successful_platforms, 3);
        assert!(apply_requests(&transport).is_empty());
        assert!(store.by_status(JobStatus::Applied).is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_and_application_do_not_abort_session() {
        let transport = FnTransport::new(|req| {
            if req.instructions.contains("\"Broken\"") {
                return Err(anyhow!("agent timed out"));
            }
            if req.instructions.contains("alpha.example/jobs/1") {
                return Err(anyhow!("form rejected"));
            }
            job_board(req)
        });
        let (_dir, store, orchestrator) =
            setup(platforms(1, false, false), profile(true, 10, false), transport.clone());

        let summary = orchestrator.run(&queries(&["Broken", "Engineer"]), "ctx").await;

        let alpha = &summary.platform_results["alpha"];
        assert!(alpha.success);
        assert!(!alpha.searches[0].success);
        assert_eq!(alpha.searches[0].error.as_deref(), Some("agent timed out"));
        assert!(alpha.searches[1].success);
        assert_eq!(alpha.jobs_found, 2);

        assert_eq!(alpha.applications.len(), 2);
        assert!(!alpha.applications[0].success);
        assert!(alpha.applications[1].success);
        assert_eq!(alpha.applications_made, 1);

        let first = store.get(alpha.job_indices[0]).unwrap();
        assert_eq!(first.status, JobStatus::Found);
        assert!(!first.additional_info.contains_key("application_proof"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_found_by_every_platform_is_applied_to_once() {
        let transport = FnTransport::new(|req| {
            if req.instructions.starts_with("Apply to the job") {
                // Keep the first application in flight while the others look.
                std::thread::sleep(Duration::from_millis(100));
                return completed("Application submitted", req.session_id.as_deref().unwrap_or("sess-apply"));
            }
            let board = board_of(req).ok_or_else(|| anyhow!("unknown board"))?;
            completed(
                "JOB_START\nCompany: Shared Co\nTitle: Engineer\nURL: https://shared.example/jobs/1\nJOB_END",
                &format!("sess-{}", board.to_lowercase()),
            )
        });
        let (_dir, store, orchestrator) =
            setup(platforms(3, false, false), profile(true, 10, false), transport.clone());

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        assert_eq!(summary.successful_platforms, 3);
        assert_eq!(store.len(), 1);
        assert_eq!(apply_requests(&transport).len(), 1);
        assert_eq!(summary.total_applications, 1);
        assert_eq!(summary.statistics.applied_count, 1);
        let successes: usize = summary
            .platform_results
            .values()
            .map(|r| r.applications.iter().filter(|a| a.success).count())
            .sum();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_session_limit_counts_failed_attempts() {
        let transport = FnTransport::new(|req| {
            if req.instructions.starts_with("Apply to the job") {
                return Err(anyhow!("form rejected"));
            }
            let text = (1..=5)
                .map(|n| format!("JOB_START\nCompany: Alpha Co\nTitle: Role {n}\nURL: https://alpha.example/jobs/{n}\nJOB_END"))
                .collect::<Vec<_>>()
                .join("\n");
            completed(&text, "sess-alpha")
        });
        let (_dir, store, orchestrator) =
            setup(platforms(1, false, false), profile(true, 10, false), transport.clone());

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;

        let alpha = &summary.platform_results["alpha"];
        assert!(alpha.success);
        assert_eq!(alpha.jobs_found, 5);
        assert_eq!(apply_requests(&transport).len(), 2);
        assert_eq!(alpha.applications.len(), 2);
        assert_eq!(alpha.applications_made, 0);
        assert!(store.by_status(JobStatus::Applied).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_status_during_run() {
        let transport = FnTransport::new(|req| {
            std::thread::sleep(Duration::from_millis(400));
            job_board(req)
        });
        let (_dir, _store, orchestrator) =
            setup(platforms(1, false, false), profile(false, 3, false), transport);

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(&queries(&["Engineer"]), "ctx").await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        let status = orchestrator.session_status();
        assert_eq!(status.max_concurrent, 1);
        assert_eq!(status.active_sessions, 1);
        assert_eq!(status.sessions[0].platform, "alpha");
        assert_eq!(status.sessions[0].status, SessionStatus::Active);

        let summary = running.await.unwrap();
        assert!(summary.success);
        assert_eq!(orchestrator.session_status().active_sessions, 0);
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let transport = FnTransport::new(job_board);
        let (_dir, _store, orchestrator) = setup(platforms(1, false, false), profile(false, 3, false), transport);
        let shared = &orchestrator.shared;

        let first = shared.claim(3).unwrap();
        assert!(shared.claim(3).is_none());
        assert!(shared.claim(4).is_some());
        drop(first);
        assert!(shared.claim(3).is_some());
    }

    #[tokio::test]
    async fn test_no_enabled_platforms_is_not_a_success() {
        let transport = FnTransport::new(job_board);
        let (_dir, _store, orchestrator) =
            setup(PlatformResolver::from_json("{}"), profile(false, 3, false), transport);

        let summary = orchestrator.run(&queries(&["Engineer"]), "ctx").await;
        assert!(!summary.success);
        assert_eq!(summary.total_platforms, 0);
        assert!(summary.platform_results.is_empty());
    }

    #[tokio::test]
    async fn test_apply_to_index() {
        let transport = FnTransport::new(job_board);
        let (_dir, store, orchestrator) = setup(platforms(3, false, false), profile(false, 0, false), transport);
        let index = store
            .add("Gamma Co", "Engineer", "Remote", "https://gamma.example/jobs/9", "", "gamma")
            .unwrap();
        let no_url = store.add("Nowhere", "Engineer", "", "", "", "").unwrap();

        let outcome = orchestrator.apply_to_index(index).await.unwrap();
        assert!(outcome.success);
        assert_eq!(store.get(index).unwrap().status, JobStatus::Applied);

        let again = orchestrator.apply_to_index(index).await.unwrap_err();
        assert!(again.to_string().contains("already marked applied"));
        assert!(orchestrator.apply_to_index(no_url).await.is_err());
        assert!(orchestrator.apply_to_index(99).await.is_err());
    }

    #[test]
    fn test_take_one_stops_at_zero() {
        let budget = AtomicUsize::new(2);
        assert!(take_one(&budget));
        assert!(take_one(&budget));
        assert!(!take_one(&budget));
        assert_eq!(budget.load(Ordering::SeqCst), 0);
    }
}
