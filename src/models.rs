use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Found,
    Reviewed,
    Applied,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Found => "found",
            JobStatus::Reviewed => "reviewed",
            JobStatus::Applied => "applied",
        }
    }

    /// Statuses only move forward: found -> reviewed -> applied.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "found" => Ok(JobStatus::Found),
            "reviewed" => Ok(JobStatus::Reviewed),
            "applied" => Ok(JobStatus::Applied),
            other => Err(anyhow::anyhow!(
                "Unknown status '{}'. Expected one of: found, reviewed, applied",
                other
            )),
        }
    }
}

/// One tracked opportunity. Its identity is its position in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub job_url: String,
    #[serde(default)]
    pub salary_range: String,
    pub status: JobStatus,
    #[serde(default = "Local::now", deserialize_with = "deserialize_timestamp")]
    pub last_updated: DateTime<Local>,
    #[serde(default)]
    pub job_board: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_info: Map<String, Value>,
}

impl JobRecord {
    pub fn new(
        company: &str,
        job_title: &str,
        location: &str,
        job_url: &str,
        salary_range: &str,
        job_board: &str,
    ) -> Self {
        Self {
            company: company.to_string(),
            job_title: job_title.to_string(),
            location: location.to_string(),
            job_url: job_url.to_string(),
            salary_range: salary_range.to_string(),
            status: JobStatus::Found,
            last_updated: Local::now(),
            job_board: job_board.to_string(),
            additional_info: Map::new(),
        }
    }

    pub fn normalized_url(&self) -> Option<String> {
        normalize_url(&self.job_url)
    }

    pub fn same_position(&self, company: &str, job_title: &str) -> bool {
        self.company.to_lowercase() == company.to_lowercase()
            && self.job_title.to_lowercase() == job_title.to_lowercase()
    }
}

// Older files carry naive ISO timestamps without an offset; read those as local time.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(serde::de::Error::custom)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| serde::de::Error::custom(format!("invalid local timestamp: {}", raw)))
}

/// Trimmed, lowercased URL, or `None` when blank.
pub fn normalize_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Evidence recorded on a job once the agent reports a submitted application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationProof {
    pub application_timestamp: DateTime<Local>,
    pub application_result: String,
    pub live_view_url: Option<String>,
    pub recording_url: Option<String>,
    pub session_id: Option<String>,
    pub steps_taken: Option<u32>,
    pub screenshot_requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_jobs: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_company: BTreeMap<String, usize>,
    pub by_job_board: BTreeMap<String, usize>,
    pub applied_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_is_forward_only() {
        assert!(JobStatus::Found.can_transition_to(JobStatus::Reviewed));
        assert!(JobStatus::Reviewed.can_transition_to(JobStatus::Applied));
        assert!(JobStatus::Found.can_transition_to(JobStatus::Applied));
        assert!(JobStatus::Applied.can_transition_to(JobStatus::Applied));
        assert!(!JobStatus::Applied.can_transition_to(JobStatus::Found));
        assert!(!JobStatus::Reviewed.can_transition_to(JobStatus::Found));
    }

    #[test]
    fn test_status_parse_and_serialize() {
        assert_eq!("APPLIED".parse::<JobStatus>().unwrap(), JobStatus::Applied);
        assert_eq!(" found ".parse::<JobStatus>().unwrap(), JobStatus::Found);
        assert!("interview".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::Reviewed).unwrap(),
            "\"reviewed\""
        );
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("  HTTPS://Example.com/Jobs/1 "),
            Some("https://example.com/jobs/1".to_string())
        );
        assert_eq!(normalize_url("   "), None);
        assert_eq!(normalize_url(""), None);
    }

    #[test]
    fn test_record_deserializes_with_missing_optional_fields() {
        let json = r#"{
            "company": "OpenAI",
            "job_title": "Developer Advocate",
            "status": "found",
            "last_updated": "2024-05-01T10:00:00+00:00"
        }"#;
        let record: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.company, "OpenAI");
        assert!(record.job_url.is_empty());
        assert!(record.additional_info.is_empty());
        assert!(record.same_position("openai", "DEVELOPER ADVOCATE"));
    }

    #[test]
    fn test_record_accepts_naive_timestamps() {
        let json = r#"{
            "company": "Stripe",
            "job_title": "Developer Relations",
            "status": "applied",
            "last_updated": "2024-05-01T10:00:00.123456"
        }"#;
        let record: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, JobStatus::Applied);
        assert_eq!(record.last_updated.format("%Y-%m-%d %H:%M").to_string(), "2024-05-01 10:00");
    }
}
