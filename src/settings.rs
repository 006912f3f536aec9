use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::store::StoreOptions;

pub const DEFAULT_AGENT_BASE_URL: &str = "https://app.hyperbrowser.ai";

/// Runtime knobs, read once at startup and passed to each component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_concurrent_browsers: usize,
    pub search_max_steps: u32,
    pub application_max_steps: u32,
    pub analyze_max_steps: u32,
    pub jobs_per_search_min: usize,
    pub jobs_per_search_max: usize,
    pub synthesize_placeholder_jobs: bool,
    pub store_lock_retries: u32,
    pub store_lock_backoff: Duration,
    pub store_backups: bool,
    pub data_file: PathBuf,
    pub user_dir: PathBuf,
    pub agent_api_key: Option<String>,
    pub agent_base_url: String,
    pub use_custom_credentials: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Lookup(&lookup);

        Self {
            max_concurrent_browsers: env.int::<usize>("MAX_CONCURRENT_BROWSERS", 5).max(1),
            search_max_steps: env.int("SEARCH_MAX_STEPS", 30),
            application_max_steps: env.int("APPLICATION_MAX_STEPS", 40),
            analyze_max_steps: env.int("ANALYZE_MAX_STEPS", 20),
            jobs_per_search_min: env.int("JOBS_PER_SEARCH_MIN", 1),
            jobs_per_search_max: env.int("JOBS_PER_SEARCH_MAX", 3),
            synthesize_placeholder_jobs: env.bool("SYNTHESIZE_PLACEHOLDER_JOBS", false),
            store_lock_retries: env.int("STORE_LOCK_RETRIES", 10),
            store_lock_backoff: Duration::from_millis(env.int("STORE_LOCK_BACKOFF_MS", 50)),
            store_backups: env.bool("STORE_BACKUPS", false),
            data_file: env
                .string("HUNT_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_file),
            user_dir: PathBuf::from(env.string("HUNT_USER_DIR").unwrap_or_else(|| "user".to_string())),
            agent_api_key: env.string("HYPERBROWSER_API_KEY"),
            agent_base_url: env
                .string("HYPERBROWSER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_AGENT_BASE_URL.to_string()),
            use_custom_credentials: env.string("ANTHROPIC_API_KEY").is_some(),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_retries: self.store_lock_retries,
            lock_backoff: self.store_lock_backoff,
            backup_enabled: self.store_backups,
        }
    }

    pub fn platforms_file(&self) -> PathBuf {
        self.user_dir.join("platform_configs.json")
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn int<T: std::str::FromStr + std::fmt::Display + Copy>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, %default, "Invalid value, using default");
                default
            }),
        }
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.string(key) {
            None => default,
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    warn!(key, value = %raw, default, "Invalid value, using default");
                    default
                }
            },
        }
    }
}

fn default_data_file() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "hunt-swarm") {
        proj_dirs.data_dir().join("jobs.json")
    } else {
        PathBuf::from("data/jobs.json")
    }
}
