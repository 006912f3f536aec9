use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::platforms::AntiDetectionParams;
use crate::profile::PersonalInfo;

// --- Request / response contract ---

/// One unit of work for the remote browsing agent.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub instructions: String,
    pub max_steps: u32,
    pub session_id: Option<String>,
    pub keep_open: bool,
    pub use_custom_credentials: bool,
    /// Only sent when a new session is being started.
    pub session_options: Option<AntiDetectionParams>,
}

/// What the transport hands back once the agent finishes a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskData {
    pub final_result: Option<String>,
    pub session_id: Option<String>,
    pub steps_taken: Option<u32>,
    pub live_view_url: Option<String>,
    pub recording_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub result_text: String,
    pub session_id: Option<String>,
    pub steps_taken: Option<u32>,
    pub live_view_url: Option<String>,
    pub recording_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskReport),
    Failed {
        error: String,
        session_id: Option<String>,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed(report) => report.session_id.as_deref(),
            TaskOutcome::Failed { session_id, .. } => session_id.as_deref(),
        }
    }
}

// --- Transport seam ---

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Starts the task and waits until the agent reports a terminal state.
    async fn start_and_wait(&self, request: &TaskRequest) -> Result<TaskData>;
}

// --- Client ---

/// Marshals intents into agent tasks and normalizes their outcome. One
/// client belongs to one session; it remembers the last session id so later
/// tasks continue in the same browser.
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    use_custom_credentials: bool,
    session_options: Option<AntiDetectionParams>,
    current_session_id: Option<String>,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, use_custom_credentials: bool) -> Self {
        Self {
            transport,
            use_custom_credentials,
            session_options: None,
            current_session_id: None,
        }
    }

    pub fn with_session_options(mut self, params: AntiDetectionParams) -> Self {
        self.session_options = Some(params);
        self
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    /// Runs a single task. Transport and agent errors come back as
    /// `TaskOutcome::Failed`; nothing is retried here.
    pub async fn run_task(
        &mut self,
        instructions: &str,
        max_steps: u32,
        session_id: Option<&str>,
        keep_open: bool,
    ) -> TaskOutcome {
        let session_id = session_id.map(str::to_string);
        let request = TaskRequest {
            instructions: instructions.to_string(),
            max_steps,
            session_options: if session_id.is_none() {
                self.session_options.clone()
            } else {
                None
            },
            session_id: session_id.clone(),
            keep_open,
            use_custom_credentials: self.use_custom_credentials,
        };

        info!(max_steps, reuse_session = session_id.is_some(), "Executing agent task");
        debug!(preview = %preview(instructions, 100), "Task instructions");

        match self.transport.start_and_wait(&request).await {
            Ok(data) => {
                if let Some(id) = &data.session_id {
                    self.current_session_id = Some(id.clone());
                }
                let report = TaskReport {
                    result_text: data.final_result.unwrap_or_default(),
                    session_id: data.session_id.or(session_id),
                    steps_taken: data.steps_taken,
                    live_view_url: data.live_view_url,
                    recording_url: data.recording_url,
                };
                info!(
                    steps = ?report.steps_taken,
                    live_view = ?report.live_view_url,
                    recording = ?report.recording_url,
                    "Agent task completed"
                );
                TaskOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "Agent task failed");
                TaskOutcome::Failed {
                    error: format!("{:#}", e),
                    session_id: session_id.or_else(|| self.current_session_id.clone()),
                }
            }
        }
    }

    pub async fn search_jobs(
        &mut self,
        query: &str,
        matching_context: &str,
        platform_name: &str,
        search_url: &str,
        max_steps: u32,
    ) -> TaskOutcome {
        info!(query, platform = platform_name, "Searching for jobs");
        let task = search_instructions(query, matching_context, platform_name, search_url);
        let session = self.current_session_id.clone();
        self.run_task(&task, max_steps, session.as_deref(), true).await
    }

    pub async fn apply_to_job(
        &mut self,
        job_url: &str,
        applicant: &PersonalInfo,
        max_steps: u32,
    ) -> TaskOutcome {
        info!(job_url, "Applying to job");
        let task = apply_instructions(job_url, applicant);
        let session = self.current_session_id.clone();
        self.run_task(&task, max_steps, session.as_deref(), true).await
    }

    pub async fn analyze_job_page(&mut self, job_url: &str, max_steps: u32) -> TaskOutcome {
        info!(job_url, "Analyzing job page");
        let task = analyze_instructions(job_url);
        let session = self.current_session_id.clone();
        self.run_task(&task, max_steps, session.as_deref(), true).await
    }

    pub async fn check_application_status(
        &mut self,
        portal_url: &str,
        email: &str,
        password: &str,
        max_steps: u32,
    ) -> TaskOutcome {
        info!(portal_url, "Checking application status");
        let task = status_check_instructions(portal_url, email, password);
        let session = self.current_session_id.clone();
        self.run_task(&task, max_steps, session.as_deref(), true).await
    }

    /// Forgets the remembered session so the next task starts fresh.
    pub fn close_session(&mut self) -> Option<String> {
        let closed = self.current_session_id.take();
        if let Some(id) = &closed {
            info!(session_id = %id, "Closing browser session");
        }
        closed
    }
}

// --- Instruction templates ---

pub fn search_instructions(
    query: &str,
    matching_context: &str,
    platform_name: &str,
    search_url: &str,
) -> String {
    let start = if search_url.is_empty() {
        format!("Go to {}", platform_name)
    } else {
        format!("Go to {} ({})", platform_name, search_url)
    };

    format!(
        "Search for jobs matching this query: \"{query}\"\n\n\
        Use this context to evaluate if jobs are a good match:\n{matching_context}\n\n\
        Please:\n\
        1. {start}\n\
        2. Search for: \"{query}\"\n\
        3. Look through the first 10-15 job listings\n\
        4. For each listing that is a good match, report it in exactly this format:\n\
        JOB_START\n\
        Company: <company name>\n\
        Title: <job title>\n\
        Location: <remote/hybrid/onsite and city>\n\
        URL: <direct link to the posting or application>\n\
        Salary: <salary range if listed>\n\
        Requirements: <top 3-5 requirements, comma separated>\n\
        Match: <why it fits the candidate>\n\
        JOB_END\n\
        5. Do not apply to anything during this search"
    )
}

pub fn apply_instructions(job_url: &str, applicant: &PersonalInfo) -> String {
    format!(
        "Apply to the job at this URL: {job_url}\n\n\
        Use this information to fill out the application:\n\
        Name: {name}\n\
        Email: {email}\n\
        Phone: {phone}\n\
        LinkedIn: {linkedin}\n\
        GitHub: {github}\n\n\
        Please:\n\
        1. Navigate to the job application page\n\
        2. Fill out all required fields with the provided information\n\
        3. If there is a resume upload field, report that a resume upload is needed instead of uploading\n\
        4. Keep any free-text answers professional and specific to the role\n\
        5. Review the application before submitting and only submit if everything is correct\n\
        6. Take a screenshot of the confirmation page if successful\n\
        7. If an account is required, create it with the provided email\n\n\
        This is a real application. If it cannot be completed, explain why.",
        name = applicant.full_name(),
        email = applicant.email,
        phone = applicant.phone,
        linkedin = applicant.linkedin,
        github = applicant.github,
    )
}

pub fn analyze_instructions(job_url: &str) -> String {
    format!(
        "Navigate to this job posting: {job_url}\n\n\
        Extract and summarize:\n\
        1. Job title and company name\n\
        2. Location and work arrangement (remote/hybrid/onsite)\n\
        3. Salary range (if available)\n\
        4. Required and preferred qualifications\n\
        5. Responsibilities\n\
        6. Application deadline and process details\n\n\
        Return a structured summary."
    )
}

pub fn status_check_instructions(portal_url: &str, email: &str, password: &str) -> String {
    format!(
        "Check job application status at: {portal_url}\n\n\
        Login credentials (if needed):\n\
        Email: {email}\n\
        Password: {password}\n\n\
        Please:\n\
        1. Navigate to the application portal and log in if required\n\
        2. Find the applications or candidate dashboard\n\
        3. For each application note the job title, company, application date, current status and next steps\n\
        4. Take a screenshot of the status page\n\n\
        If login fails or no applications are found, explain what you observed."
    )
}

fn preview(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

// --- Hosted computer-use transport ---

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskBody<'a> {
    task: &'a str,
    max_steps: u32,
    keep_browser_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    use_custom_api_keys: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_options: Option<SessionOptionsBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionOptionsBody {
    use_stealth: bool,
    use_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_city: Option<String>,
    device: Vec<String>,
    operating_systems: Vec<String>,
    locales: Vec<String>,
    screen: ScreenBody,
}

#[derive(Debug, Serialize)]
struct ScreenBody {
    width: u32,
    height: u32,
}

impl From<&AntiDetectionParams> for SessionOptionsBody {
    fn from(params: &AntiDetectionParams) -> Self {
        Self {
            use_stealth: params.use_stealth,
            use_proxy: params.proxy.is_some(),
            proxy_country: params.proxy.as_ref().map(|p| p.country.clone()),
            proxy_city: params.proxy.as_ref().and_then(|p| p.city.clone()),
            device: vec![params.device.clone()],
            operating_systems: vec![params.operating_system.clone()],
            locales: vec![params.locale.clone()],
            screen: ScreenBody {
                width: params.screen.width,
                height: params.screen.height,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskResponse {
    job_id: String,
    #[serde(default)]
    live_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    status: String,
    #[serde(default)]
    data: Option<TaskResultData>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    live_url: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    recording_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultData {
    #[serde(default)]
    final_result: Option<String>,
    #[serde(default)]
    steps: Vec<serde_json::Value>,
}

/// HTTP client for the hosted computer-use task API.
pub struct HyperbrowserTransport {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl HyperbrowserTransport {
    pub fn new(api_key: Option<String>, base_url: &str) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .context("HYPERBROWSER_API_KEY environment variable not set. Set it with: export HYPERBROWSER_API_KEY=your-key-here")?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn task_url(&self, suffix: &str) -> String {
        format!("{}/api/task/claude-computer-use{}", self.base_url, suffix)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Agent API request failed with status {}: {}", status, error_text));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse agent API response from {}", url))
    }
}

#[async_trait]
impl AgentTransport for HyperbrowserTransport {
    async fn start_and_wait(&self, request: &TaskRequest) -> Result<TaskData> {
        let body = StartTaskBody {
            task: &request.instructions,
            max_steps: request.max_steps,
            keep_browser_open: request.keep_open,
            session_id: request.session_id.as_deref(),
            use_custom_api_keys: request.use_custom_credentials,
            session_options: request.session_options.as_ref().map(SessionOptionsBody::from),
        };

        let response = self
            .client
            .post(self.task_url(""))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to agent API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Agent API request failed with status {}: {}", status, error_text));
        }

        let started: StartTaskResponse = response
            .json()
            .await
            .context("Failed to parse agent task start response")?;
        debug!(job_id = %started.job_id, "Agent task started");

        loop {
            let status: TaskStatusResponse = self
                .get_json(&self.task_url(&format!("/{}/status", started.job_id)))
                .await?;
            match status.status.as_str() {
                "completed" | "failed" | "stopped" => break,
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        let result: TaskResultResponse = self
            .get_json(&self.task_url(&format!("/{}", started.job_id)))
            .await?;

        if result.status != "completed" {
            return Err(anyhow!(
                "Agent task {} ended with status '{}': {}",
                started.job_id,
                result.status,
                result.error.unwrap_or_else(|| "no error message".to_string())
            ));
        }

        let data = result.data.unwrap_or(TaskResultData {
            final_result: None,
            steps: Vec::new(),
        });

        Ok(TaskData {
            final_result: data.final_result,
            session_id: result.session_id,
            steps_taken: (!data.steps.is_empty()).then_some(data.steps.len() as u32),
            live_view_url: result.live_url.or(started.live_url),
            recording_url: result.recording_url,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{completed, FnTransport};
    use super::*;
    use crate::platforms::{Screen, ProxySettings};

    fn params() -> AntiDetectionParams {
        AntiDetectionParams {
            use_stealth: true,
            keep_browser_open: true,
            device: "desktop".to_string(),
            operating_system: "linux".to_string(),
            locale: "en-CA".to_string(),
            screen: Screen { width: 1400, height: 900 },
            proxy: Some(ProxySettings {
                country: "US".to_string(),
                city: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_success_is_normalized_and_session_remembered() {
        let transport = FnTransport::new(|_| completed("Found 2 roles", "sess-1"));
        let mut client = AgentClient::new(transport.clone(), false).with_session_options(params());

        let outcome = client.run_task("do something", 10, None, true).await;
        match &outcome {
            TaskOutcome::Completed(report) => {
                assert_eq!(report.result_text, "Found 2 roles");
                assert_eq!(report.steps_taken, Some(4));
                assert_eq!(report.live_view_url.as_deref(), Some("https://live.example/sess-1"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(outcome.session_id(), Some("sess-1"));
        assert_eq!(client.current_session_id(), Some("sess-1"));

        let requests = transport.requests();
        assert_eq!(requests[0].max_steps, 10);
        assert!(requests[0].keep_open);
        assert!(requests[0].session_options.is_some());
    }

    #[tokio::test]
    async fn test_follow_up_tasks_reuse_session_without_options() {
        let transport = FnTransport::new(|_| completed("ok", "sess-7"));
        let mut client = AgentClient::new(transport.clone(), true).with_session_options(params());

        client.search_jobs("Developer Advocate", "ctx", "Indeed", "", 30).await;
        client.analyze_job_page("https://jobs.example/1", 20).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].session_id, None);
        assert_eq!(requests[1].session_id.as_deref(), Some("sess-7"));
        assert!(requests[1].session_options.is_none());
        assert!(requests.iter().all(|r| r.use_custom_credentials));
    }

    #[tokio::test]
    async fn test_transport_error_becomes_failed_outcome() {
        let transport = FnTransport::new(|_| Err(anyhow!("connection reset")));
        let mut client = AgentClient::new(transport, false);

        let outcome = client.run_task("task", 5, Some("sess-9"), false).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                error: "connection reset".to_string(),
                session_id: Some("sess-9".to_string()),
            }
        );
        assert!(!outcome.is_success());
        assert_eq!(client.current_session_id(), None);
    }

    #[tokio::test]
    async fn test_close_session_forgets_id() {
        let transport = FnTransport::new(|_| completed("ok", "sess-2"));
        let mut client = AgentClient::new(transport, false);
        client.run_task("task", 5, None, true).await;

        assert_eq!(client.close_session(), Some("sess-2".to_string()));
        assert_eq!(client.current_session_id(), None);
        assert_eq!(client.close_session(), None);
    }

    #[test]
    fn test_instruction_templates() {
        let search = search_instructions("Developer Advocate", "RESUME: x", "LinkedIn", "https://linkedin.com/jobs");
        assert!(search.contains("\"Developer Advocate\""));
        assert!(search.contains("LinkedIn (https://linkedin.com/jobs)"));
        assert!(search.contains("JOB_START"));
        assert!(search.contains("RESUME: x"));

        let applicant = PersonalInfo {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            phone: "555-0100".into(),
            linkedin: "linkedin.com/in/ada".into(),
            github: "github.com/ada".into(),
        };
        let apply = apply_instructions("https://jobs.example/1", &applicant);
        assert!(apply.contains("Name: Ada Lovelace"));
        assert!(apply.contains("Phone: 555-0100"));
        assert!(apply.contains("https://jobs.example/1"));

        assert!(status_check_instructions("https://portal.example", "a@b.c", "pw").contains("Password: pw"));
        assert!(analyze_instructions("https://jobs.example/2").contains("https://jobs.example/2"));
    }

    #[test]
    fn test_session_options_body_from_params() {
        let body = SessionOptionsBody::from(&params());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["useStealth"], true);
        assert_eq!(json["useProxy"], true);
        assert_eq!(json["proxyCountry"], "US");
        assert!(json.get("proxyCity").is_none());
        assert_eq!(json["operatingSystems"][0], "linux");
        assert_eq!(json["screen"]["width"], 1400);
    }

    #[test]
    fn test_transport_requires_api_key() {
        let err = HyperbrowserTransport::new(None, "https://example.com").err().unwrap();
        assert!(err.to_string().contains("HYPERBROWSER_API_KEY"));
        assert!(HyperbrowserTransport::new(Some("key".into()), "https://example.com/").is_ok());
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 4), "héll...");
        assert_eq!(preview("short", 10), "short");
    }
}
