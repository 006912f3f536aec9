use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_TARGET_ROLES: [&str; 4] = [
    "Software Engineer",
    "Full Stack Developer",
    "Backend Developer",
    "Frontend Developer",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(default)]
    pub automation_settings: AutomationSettings,
    /// Everything else in the document is passed through to the agent as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Preferences {
    pub fn search_queries(&self) -> Vec<String> {
        let roles: Vec<String> = self
            .target_roles
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if roles.is_empty() {
            DEFAULT_TARGET_ROLES.iter().map(|r| r.to_string()).collect()
        } else {
            roles
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSettings {
    #[serde(default)]
    pub auto_apply_after_search: bool,
    #[serde(default = "default_max_applications_per_run")]
    pub max_applications_per_run: usize,
    #[serde(default = "default_application_delay_seconds")]
    pub application_delay_seconds: u64,
    #[serde(default)]
    pub require_manual_approval: bool,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            auto_apply_after_search: false,
            max_applications_per_run: default_max_applications_per_run(),
            application_delay_seconds: default_application_delay_seconds(),
            require_manual_approval: false,
        }
    }
}

fn default_max_applications_per_run() -> usize {
    3
}

fn default_application_delay_seconds() -> u64 {
    30
}

/// Contact details copied verbatim into application instructions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalInfo {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub linkedin: String,
    #[serde(default)]
    pub github: String,
}

impl PersonalInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// The user's documents, plus the matching context built from them.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub resume_text: String,
    pub preferences: Preferences,
    pub personal_info: PersonalInfo,
}

impl UserProfile {
    /// Loads `resume.txt`, `job_preferences.json` and `personal_info.json`
    /// from `dir`. Missing or malformed documents fall back to defaults.
    pub fn load(dir: &Path) -> Self {
        let resume_text = match std::fs::read_to_string(dir.join("resume.txt")) {
            Ok(text) => {
                info!(chars = text.len(), "Resume loaded");
                text
            }
            Err(e) => {
                warn!(error = %e, "Resume text not found, matching context will omit it");
                String::new()
            }
        };

        let preferences = load_json_or_default(&dir.join("job_preferences.json"));
        let personal_info = load_json_or_default(&dir.join("personal_info.json"));

        Self {
            resume_text,
            preferences,
            personal_info,
        }
    }

    /// Text handed to the agent so it can judge which listings fit.
    pub fn matching_context(&self) -> Result<String> {
        let preferences = serde_json::to_string_pretty(&self.preferences)
            .context("Failed to serialize job preferences")?;
        let personal = serde_json::to_string_pretty(&self.personal_info)
            .context("Failed to serialize personal info")?;

        Ok(format!(
            "RESUME:\n{}\n\nJOB PREFERENCES:\n{}\n\nPERSONAL INFO:\n{}\n",
            self.resume_text.trim(),
            preferences,
            personal
        ))
    }
}

fn load_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Document not readable, using defaults");
            return T::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => {
            info!(path = %path.display(), "Loaded document");
            value
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error parsing document, using defaults");
            T::default()
        }
    }
}
