use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_PRIORITY: i64 = 999;
pub const DEFAULT_DELAY_RANGE: (u64, u64) = (2, 8);

const MIN_SCREEN_WIDTH: u32 = 1024;
const MIN_SCREEN_HEIGHT: u32 = 768;
const SCREEN_JITTER: i64 = 50;
const OS_SWAP_PROBABILITY: f64 = 0.2;
const LOCALES: [&str; 3] = ["en-US", "en-CA", "en-GB"];
const OPERATING_SYSTEMS: [&str; 3] = ["macos", "windows", "linux"];

// --- Configuration document ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default)]
    /// Kept in document order; it breaks priority ties.
    pub platforms: IndexMap<String, PlatformProfile>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Overrides the process-wide concurrency bound when present.
    #[serde(default)]
    pub max_concurrent_browsers: Option<usize>,
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay: String,
    #[serde(default)]
    pub no_login_mode: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_concurrent_browsers: Some(3),
            rate_limit_delay: default_rate_limit_delay(),
            no_login_mode: false,
        }
    }
}

fn default_rate_limit_delay() -> String {
    "1-3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub requires_login: bool,
    #[serde(default)]
    pub search_url: String,
    #[serde(default = "default_delay")]
    pub delay_between_actions: String,
    #[serde(default = "default_max_applications")]
    pub max_applications_per_session: usize,
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default)]
    pub anti_detection: AntiDetectionSettings,
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self {
            name: None,
            enabled: false,
            priority: None,
            requires_login: false,
            search_url: String::new(),
            delay_between_actions: default_delay(),
            max_applications_per_session: default_max_applications(),
            session_timeout: default_session_timeout(),
            anti_detection: AntiDetectionSettings::default(),
        }
    }
}

fn default_delay() -> String {
    "2-8".to_string()
}

fn default_max_applications() -> usize {
    3
}

fn default_session_timeout() -> u64 {
    1200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiDetectionSettings {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_os")]
    pub operating_system: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub screen: Option<Screen>,
    #[serde(default = "default_true")]
    pub stealth_mode: bool,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default = "default_proxy_country")]
    pub proxy_country: String,
    #[serde(default)]
    pub proxy_city: Option<String>,
}

impl Default for AntiDetectionSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
            operating_system: default_os(),
            locale: default_locale(),
            screen: None,
            stealth_mode: true,
            use_proxy: false,
            proxy_country: default_proxy_country(),
            proxy_city: None,
        }
    }
}

fn default_device() -> String {
    "desktop".to_string()
}

fn default_os() -> String {
    "macos".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_true() -> bool {
    true
}

fn default_proxy_country() -> String {
    "US".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

// --- Derived session parameters ---

/// Fingerprint settings handed to the agent when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiDetectionParams {
    pub use_stealth: bool,
    pub keep_browser_open: bool,
    pub device: String,
    pub operating_system: String,
    pub locale: String,
    pub screen: Screen,
    pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub country: String,
    pub city: Option<String>,
}

// --- Resolver ---

pub struct PlatformResolver {
    config: PlatformsConfig,
}

impl PlatformResolver {
    pub fn new(config: PlatformsConfig) -> Self {
        Self { config }
    }

    /// Reads the platform document. A missing or malformed file yields an
    /// empty, conservative configuration instead of an error.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Platform configuration not readable, using defaults");
                return Self::new(PlatformsConfig::default());
            }
        };
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Self {
        match serde_json::from_str::<PlatformsConfig>(raw) {
            Ok(config) => Self::new(config),
            Err(e) => {
                warn!(error = %e, "Error parsing platform configuration, using defaults");
                Self::new(PlatformsConfig::default())
            }
        }
    }

    pub fn config(&self) -> &PlatformsConfig {
        &self.config
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.config.global_settings
    }

    pub fn profile(&self, platform: &str) -> Option<&PlatformProfile> {
        self.config.platforms.get(platform)
    }

    fn profile_or_default(&self, platform: &str) -> PlatformProfile {
        self.profile(platform).cloned().unwrap_or_default()
    }

    /// Enabled platform keys, lowest priority value first. Platforms without a
    /// priority sort last; ties keep document order.
    pub fn enabled_platforms(&self) -> Vec<String> {
        let mut enabled: Vec<(i64, &String)> = self
            .config
            .platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(key, p)| (p.priority.unwrap_or(DEFAULT_PRIORITY), key))
            .collect();
        enabled.sort_by_key(|(priority, _)| *priority);
        enabled.into_iter().map(|(_, key)| key.clone()).collect()
    }

    pub fn is_enabled(&self, platform: &str) -> bool {
        self.profile(platform).is_some_and(|p| p.enabled)
    }

    pub fn requires_login(&self, platform: &str) -> bool {
        self.profile(platform).is_some_and(|p| p.requires_login)
    }

    pub fn max_applications(&self, platform: &str) -> usize {
        self.profile_or_default(platform).max_applications_per_session
    }

    pub fn session_timeout(&self, platform: &str) -> Duration {
        Duration::from_secs(self.profile_or_default(platform).session_timeout)
    }

    pub fn search_url(&self, platform: &str) -> String {
        self.profile_or_default(platform).search_url
    }

    pub fn display_name(&self, platform: &str) -> String {
        self.profile(platform)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| title_case(platform))
    }

    pub fn anti_detection_params(&self, platform: &str) -> AntiDetectionParams {
        let settings = self.profile_or_default(platform).anti_detection;

        let params = AntiDetectionParams {
            use_stealth: settings.stealth_mode,
            keep_browser_open: true,
            device: settings.device,
            operating_system: settings.operating_system,
            locale: settings.locale,
            screen: settings.screen.unwrap_or_default(),
            proxy: settings.use_proxy.then(|| ProxySettings {
                country: settings.proxy_country,
                city: settings.proxy_city,
            }),
        };

        debug!(platform, ?params, "Generated anti-detection params");
        params
    }

    pub fn randomized_params(&self, platform: &str) -> AntiDetectionParams {
        self.randomized_params_with(platform, &mut rand::thread_rng())
    }

    /// Base parameters with a jittered screen, a random locale and, now and
    /// then, a different OS, so concurrent sessions don't share a fingerprint.
    pub fn randomized_params_with<R: Rng + ?Sized>(
        &self,
        platform: &str,
        rng: &mut R,
    ) -> AntiDetectionParams {
        let mut params = self.anti_detection_params(platform);

        let width = params.screen.width as i64 + rng.gen_range(-SCREEN_JITTER..=SCREEN_JITTER);
        let height = params.screen.height as i64 + rng.gen_range(-SCREEN_JITTER..=SCREEN_JITTER);
        params.screen = Screen {
            width: width.max(MIN_SCREEN_WIDTH as i64) as u32,
            height: height.max(MIN_SCREEN_HEIGHT as i64) as u32,
        };

        if let Some(locale) = LOCALES.choose(rng) {
            params.locale = locale.to_string();
        }

        if rng.gen_bool(OS_SWAP_PROBABILITY) {
            let others: Vec<&str> = OPERATING_SYSTEMS
                .iter()
                .copied()
                .filter(|os| *os != params.operating_system)
                .collect();
            if let Some(os) = others.choose(rng) {
                params.operating_system = os.to_string();
            }
        }

        params
    }

    /// Inclusive action-delay range in seconds.
    pub fn delay_range(&self, platform: &str) -> (u64, u64) {
        let raw = self.profile_or_default(platform).delay_between_actions;
        parse_delay_range(&raw).unwrap_or_else(|| {
            warn!(platform, delay = %raw, "Invalid delay format, using default range");
            DEFAULT_DELAY_RANGE
        })
    }

    pub fn random_delay(&self, platform: &str) -> Duration {
        self.random_delay_with(platform, &mut rand::thread_rng())
    }

    pub fn random_delay_with<R: Rng + ?Sized>(&self, platform: &str, rng: &mut R) -> Duration {
        let (min, max) = self.delay_range(platform);
        Duration::from_secs(rng.gen_range(min..=max))
    }
}

/// Parses `"min-max"` seconds. Anything else, including a reversed range,
/// is rejected.
pub fn parse_delay_range(raw: &str) -> Option<(u64, u64)> {
    let (min, max) = raw.split_once('-')?;
    let min = min.trim().parse::<u64>().ok()?;
    let max = max.trim().parse::<u64>().ok()?;
    (min <= max).then_some((min, max))
}

fn title_case(key: &str) -> String {
    key.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SAMPLE: &str = r#"{
        "platforms": {
            "linkedin": {
                "name": "LinkedIn",
                "enabled": true,
                "priority": 2,
                "requires_login": true,
                "search_url": "https://www.linkedin.com/jobs/search",
                "delay_between_actions": "3-10",
                "max_applications_per_session": 2,
                "anti_detection": {
                    "device": "desktop",
                    "operating_system": "windows",
                    "locale": "en-GB",
                    "screen": {"width": 1000, "height": 700},
                    "stealth_mode": true,
                    "use_proxy": true,
                    "proxy_country": "CA",
                    "proxy_city": "Toronto"
                }
            },
            "indeed": {"enabled": true, "priority": 1, "delay_between_actions": "2-8"},
            "wellfound": {"enabled": true},
            "dice": {"enabled": false, "priority": 0},
            "weworkremotely": {"enabled": true, "priority": 2, "delay_between_actions": "abc"}
        },
        "global_settings": {"max_concurrent_browsers": 2, "no_login_mode": true}
    }"#;

    fn resolver() -> PlatformResolver {
        PlatformResolver::from_json(SAMPLE)
    }

    #[test]
    fn test_enabled_platforms_sorted_by_priority() {
        assert_eq!(
            resolver().enabled_platforms(),
            vec!["indeed", "linkedin", "weworkremotely", "wellfound"]
        );
    }

    #[test]
    fn test_priority_ties_keep_document_order() {
        let resolver = PlatformResolver::from_json(
            r#"{"platforms": {
                "zeta": {"enabled": true, "priority": 1},
                "alpha": {"enabled": true, "priority": 1},
                "mid": {"enabled": true},
                "beta": {"enabled": true}
            }}"#,
        );
        assert_eq!(resolver.enabled_platforms(), vec!["zeta", "alpha", "mid", "beta"]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let resolver = PlatformResolver::load(Path::new("/definitely/not/here/platforms.json"));
        assert!(resolver.enabled_platforms().is_empty());
        assert_eq!(resolver.global().max_concurrent_browsers, Some(3));
        assert_eq!(resolver.global().rate_limit_delay, "1-3");
    }

    #[test]
    fn test_malformed_document_falls_back_to_defaults() {
        let resolver = PlatformResolver::from_json("{\"platforms\": [1, 2");
        assert!(resolver.enabled_platforms().is_empty());
        assert!(!resolver.global().no_login_mode);
    }

    #[test]
    fn test_profile_accessors() {
        let r = resolver();
        assert!(r.requires_login("linkedin"));
        assert!(!r.requires_login("indeed"));
        assert!(!r.is_enabled("dice"));
        assert_eq!(r.max_applications("linkedin"), 2);
        assert_eq!(r.max_applications("indeed"), 3);
        assert_eq!(r.session_timeout("indeed"), Duration::from_secs(1200));
        assert_eq!(r.display_name("linkedin"), "LinkedIn");
        assert_eq!(r.display_name("we_work_remotely"), "We Work Remotely");
        assert_eq!(r.search_url("linkedin"), "https://www.linkedin.com/jobs/search");
        assert!(r.global().no_login_mode);
    }

    #[test]
    fn test_anti_detection_params() {
        let params = resolver().anti_detection_params("linkedin");
        assert!(params.use_stealth);
        assert!(params.keep_browser_open);
        assert_eq!(params.operating_system, "windows");
        assert_eq!(params.locale, "en-GB");
        assert_eq!(params.screen, Screen { width: 1000, height: 700 });
        assert_eq!(
            params.proxy,
            Some(ProxySettings {
                country: "CA".to_string(),
                city: Some("Toronto".to_string())
            })
        );

        let plain = resolver().anti_detection_params("indeed");
        assert_eq!(plain.screen, Screen::default());
        assert_eq!(plain.operating_system, "macos");
        assert!(plain.proxy.is_none());
    }

    #[test]
    fn test_randomized_params_respect_minimum_screen() {
        let r = resolver();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let params = r.randomized_params_with("linkedin", &mut rng);
            assert!(params.screen.width >= 1024);
            assert!(params.screen.height >= 768);
            assert!(LOCALES.contains(&params.locale.as_str()));
            assert!(OPERATING_SYSTEMS.contains(&params.operating_system.as_str()));
        }
    }

    #[test]
    fn test_randomized_params_jitter_is_bounded() {
        let r = resolver();
        let mut rng = StdRng::seed_from_u64(11);
        let mut swapped = 0;
        for _ in 0..1000 {
            let params = r.randomized_params_with("indeed", &mut rng);
            assert!((1870..=1970).contains(&params.screen.width));
            assert!((1030..=1130).contains(&params.screen.height));
            if params.operating_system != "macos" {
                swapped += 1;
            }
        }
        // 20% expected; generous bounds for a fixed seed.
        assert!(swapped > 100 && swapped < 300, "swapped {}", swapped);
    }

    #[test]
    fn test_delay_range_parsing() {
        assert_eq!(parse_delay_range("2-8"), Some((2, 8)));
        assert_eq!(parse_delay_range(" 0 - 0 "), Some((0, 0)));
        assert_eq!(parse_delay_range("abc"), None);
        assert_eq!(parse_delay_range("5"), None);
        assert_eq!(parse_delay_range("9-3"), None);
        assert_eq!(parse_delay_range("-3"), None);
    }

    #[test]
    fn test_random_delay_within_configured_range() {
        let r = resolver();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let delay = r.random_delay_with("indeed", &mut rng).as_secs();
            assert!((2..=8).contains(&delay));
        }
    }

    #[test]
    fn test_malformed_delay_uses_default_range() {
        let r = resolver();
        assert_eq!(r.delay_range("weworkremotely"), DEFAULT_DELAY_RANGE);
        assert_eq!(r.delay_range("unknown-platform"), DEFAULT_DELAY_RANGE);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let delay = r.random_delay_with("weworkremotely", &mut rng).as_secs();
            assert!((2..=8).contains(&delay));
        }
    }
}
