use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::models::normalize_url;

const NOT_SPECIFIED: &str = "Not specified";
const MAX_PLACEHOLDER_JOBS: usize = 3;
const PLACEHOLDER_COMPANIES: [&str; 5] = ["TechCorp", "InnovateLabs", "StartupCo", "MegaTech", "DevTools Inc"];
const JOB_VOCABULARY: [&str; 8] = ["found", "job", "role", "position", "opening", "hiring", "hire", "apply"];

static BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)JOB_START(.*?)JOB_END").unwrap());
static JSON_OBJECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());
static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s)\]>"',]+"#).unwrap());
static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static FIELD_REGEXES: LazyLock<[(Field, Regex); 7]> = LazyLock::new(|| {
    [
        (Field::Company, Regex::new(r"(?im)Company:[ \t]*([^\n]+)").unwrap()),
        (Field::Title, Regex::new(r"(?im)Title:[ \t]*([^\n]+)").unwrap()),
        (Field::Location, Regex::new(r"(?im)Location:[ \t]*([^\n]+)").unwrap()),
        (Field::Url, Regex::new(r"(?im)URL:[ \t]*(https?://\S+)").unwrap()),
        (Field::Salary, Regex::new(r"(?im)Salary:[ \t]*([^\n]+)").unwrap()),
        (Field::Requirements, Regex::new(r"(?im)Requirements:[ \t]*([^\n]+(?:\n[^\n:]+)*)").unwrap()),
        (Field::Match, Regex::new(r"(?im)Match:[ \t]*([^\n]+(?:\n[^\n:]+)*)").unwrap()),
    ]
});

/// Loosest last: labeled triples, numbered "Name - Title (URL)" lines, then
/// a capitalized employer name near a role keyword and a link.
static HEURISTIC_REGEXES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(
            r"(?im)(?:Company|Employer):\s*([^\n,]+).*?(?:Title|Position|Role):\s*([^\n,]+).*?(?:URL|Link|Apply):\s*(https?://\S+)",
        )
        .unwrap(),
        Regex::new(r"(?im)\d+\.\s*([^-\n]+?)\s*-\s*([^(\n]+?)\s*\((https?://[^)\s]+)\)").unwrap(),
        Regex::new(
            r"([A-Z][a-zA-Z &]+(?:Corp|Inc|Labs|Tech|Company|LLC))[^\n]*?([A-Z][a-zA-Z ]+(?:Engineer|Developer|Advocate|Manager|Specialist))[^\n]*?(https?://\S+)",
        )
        .unwrap(),
    ]
});

static LOCATION_REGEXES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)(?:Location|Based in|Office in):\s*([^\n,]+)").unwrap(),
        Regex::new(r"(?i)\b(Remote|San Francisco|New York|Seattle|Austin|Boston|Denver|Portland)\b").unwrap(),
    ]
});

static SALARY_REGEXES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"\$\d{2,3}[kK]?\s*[-–]\s*\$?\d{2,3}[kK]?").unwrap(),
        Regex::new(r"\$\d{2,3}[kK]?\+?").unwrap(),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Company,
    Title,
    Location,
    Url,
    Salary,
    Requirements,
    Match,
}

/// A job candidate pulled out of free-form agent text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedJob {
    pub company: String,
    pub job_title: String,
    pub location: String,
    pub job_url: String,
    pub salary_range: String,
    pub requirements: Vec<String>,
    pub match_reason: String,
    /// Set only for synthesized placeholders that the agent never confirmed.
    pub heuristic: bool,
}

impl ExtractedJob {
    fn new(company: &str, job_title: &str, job_url: &str) -> Self {
        Self {
            company: company.to_string(),
            job_title: job_title.to_string(),
            location: NOT_SPECIFIED.to_string(),
            job_url: job_url.to_string(),
            salary_range: NOT_SPECIFIED.to_string(),
            ..Default::default()
        }
    }
}

/// What a strategy may need besides the text itself.
#[derive(Debug, Clone)]
pub struct ExtractionContext<'a> {
    pub query: &'a str,
    pub platform: &'a str,
    pub synthesize_placeholders: bool,
    pub jobs_per_search: (usize, usize),
}

pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str, ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob>;
}

/// Ordered strategy chain. The first strategy producing any candidates wins;
/// later, looser strategies never run after that.
pub struct Extractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(DelimitedBlocks),
            Box::new(EmbeddedJson),
            Box::new(PatternHeuristics),
            Box::new(PlaceholderSynthesis),
        ])
    }
}

impl Extractor {
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, text: &str, ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob> {
        for strategy in &self.strategies {
            let jobs = strategy.extract(text, ctx);
            if jobs.is_empty() {
                debug!(strategy = strategy.name(), "No candidates");
                continue;
            }
            let total = jobs.len();
            let unique = dedupe(jobs);
            info!(
                strategy = strategy.name(),
                candidates = total,
                unique = unique.len(),
                platform = ctx.platform,
                "Extracted jobs"
            );
            return unique;
        }
        Vec::new()
    }
}

/// Drops repeats by normalized URL, or by (company, title) when a candidate
/// has no URL.
pub fn dedupe(jobs: Vec<ExtractedJob>) -> Vec<ExtractedJob> {
    let mut seen_urls = HashSet::new();
    let mut seen_pairs = HashSet::new();
    jobs.into_iter()
        .filter(|job| match normalize_url(&job.job_url) {
            Some(url) => seen_urls.insert(url),
            None => seen_pairs.insert((job.company.to_lowercase(), job.job_title.to_lowercase())),
        })
        .collect()
}

// --- Strategies ---

pub struct DelimitedBlocks;

impl ExtractionStrategy for DelimitedBlocks {
    fn name(&self) -> &'static str {
        "delimited_blocks"
    }

    fn extract(&self, text: &str, _ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob> {
        BLOCK_REGEX
            .captures_iter(text)
            .filter_map(|caps| parse_block(caps.get(1)?.as_str()))
            .collect()
    }
}

fn parse_block(block: &str) -> Option<ExtractedJob> {
    let mut job = ExtractedJob::new("", "", "");
    for (field, regex) in FIELD_REGEXES.iter() {
        let Some(value) = regex.captures(block).and_then(|c| c.get(1)).map(|m| m.as_str().trim()) else {
            continue;
        };
        match field {
            Field::Company => job.company = value.to_string(),
            Field::Title => job.job_title = value.to_string(),
            Field::Location => job.location = value.to_string(),
            Field::Url => job.job_url = value.to_string(),
            Field::Salary => job.salary_range = value.to_string(),
            Field::Requirements => {
                job.requirements = value
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            }
            Field::Match => job.match_reason = value.to_string(),
        }
    }
    (!job.company.is_empty() && !job.job_title.is_empty()).then_some(job)
}

pub struct EmbeddedJson;

impl ExtractionStrategy for EmbeddedJson {
    fn name(&self) -> &'static str {
        "embedded_json"
    }

    fn extract(&self, text: &str, _ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob> {
        JSON_OBJECT_REGEX
            .find_iter(text)
            .filter_map(|m| serde_json::from_str::<Value>(m.as_str()).ok())
            .filter_map(|value| from_json_object(&value))
            .collect()
    }
}

fn from_json_object(value: &Value) -> Option<ExtractedJob> {
    let obj = value.as_object()?;
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
    };

    let company = text(&["company"]);
    let title = text(&["job_title", "title"]);
    if company.is_none() && title.is_none() {
        return None;
    }

    let requirements = match obj.get("requirements") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s.split(',').map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).collect(),
        _ => Vec::new(),
    };

    Some(ExtractedJob {
        company: company.unwrap_or_default(),
        job_title: title.unwrap_or_default(),
        location: text(&["location"]).unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        job_url: text(&["job_url", "url"]).unwrap_or_default(),
        salary_range: text(&["salary_range", "salary"]).unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        requirements,
        match_reason: text(&["match_reason", "match"]).unwrap_or_default(),
        heuristic: false,
    })
}

pub struct PatternHeuristics;

impl ExtractionStrategy for PatternHeuristics {
    fn name(&self) -> &'static str {
        "pattern_heuristics"
    }

    fn extract(&self, text: &str, _ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob> {
        for regex in HEURISTIC_REGEXES.iter() {
            let jobs: Vec<ExtractedJob> = regex
                .captures_iter(text)
                .filter_map(|caps| {
                    let company = collapse_whitespace(caps.get(1)?.as_str());
                    let title = collapse_whitespace(caps.get(2)?.as_str());
                    let url = caps.get(3)?.as_str().trim();
                    if company.is_empty() || title.is_empty() {
                        return None;
                    }

                    let anchor = caps.get(1)?.start();
                    let window = surrounding(text, anchor, 100, 200);
                    let mut job = ExtractedJob::new(&company, &title, url);
                    if let Some(location) = first_capture(LOCATION_REGEXES.iter(), window) {
                        job.location = location;
                    }
                    if let Some(salary) = SALARY_REGEXES.iter().find_map(|r| r.find(window)) {
                        job.salary_range = salary.as_str().to_string();
                    }
                    Some(job)
                })
                .collect();
            if !jobs.is_empty() {
                return jobs;
            }
        }
        Vec::new()
    }
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE_REGEX.replace_all(s.trim(), " ").into_owned()
}

fn first_capture<'r>(mut regexes: impl Iterator<Item = &'r Regex>, text: &str) -> Option<String> {
    regexes.find_map(|r| r.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()))
}

/// Slice of `text` from `before` bytes ahead of `anchor` to `after` bytes
/// past it, widened to char boundaries.
fn surrounding(text: &str, anchor: usize, before: usize, after: usize) -> &str {
    let mut start = anchor.saturating_sub(before);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (anchor + after).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

/// Last resort for prose that talks about jobs without structure. Only runs
/// when explicitly enabled; its records are flagged `heuristic`.
pub struct PlaceholderSynthesis;

impl ExtractionStrategy for PlaceholderSynthesis {
    fn name(&self) -> &'static str {
        "placeholder_synthesis"
    }

    fn extract(&self, text: &str, ctx: &ExtractionContext<'_>) -> Vec<ExtractedJob> {
        synthesize_with(text, ctx, &mut rand::thread_rng())
    }
}

pub fn synthesize_with<R: Rng + ?Sized>(
    text: &str,
    ctx: &ExtractionContext<'_>,
    rng: &mut R,
) -> Vec<ExtractedJob> {
    let lower = text.to_lowercase();
    if !JOB_VOCABULARY.iter().any(|word| lower.contains(word)) {
        return Vec::new();
    }
    if !ctx.synthesize_placeholders {
        warn!(
            platform = ctx.platform,
            query = ctx.query,
            "Agent described jobs without structured records; placeholder synthesis is disabled"
        );
        return Vec::new();
    }

    let urls: Vec<&str> = URL_REGEX.find_iter(text).map(|m| m.as_str()).collect();
    let found = if urls.is_empty() {
        let (min, max) = ctx.jobs_per_search;
        let min = min.max(1);
        rng.gen_range(min..=max.max(min))
    } else {
        urls.len()
    };
    let count = found.min(MAX_PLACEHOLDER_JOBS);

    let title = if ctx.query.trim().is_empty() {
        "Software Engineer".to_string()
    } else {
        ctx.query.trim().to_string()
    };
    let platform_slug = ctx.platform.to_lowercase().replace(' ', "");
    let query_slug = title.to_lowercase().replace(' ', "-");

    warn!(platform = ctx.platform, count, "Synthesizing placeholder jobs from unstructured result");
    (0..count)
        .map(|i| {
            let company = PLACEHOLDER_COMPANIES.choose(rng).copied().unwrap_or("TechCorp");
            let url = match urls.get(i) {
                Some(url) => url.to_string(),
                None => format!(
                    "https://{}.com/jobs/{}-{}",
                    platform_slug,
                    company.to_lowercase().replace(' ', ""),
                    query_slug
                ),
            };
            ExtractedJob {
                heuristic: true,
                ..ExtractedJob::new(company, &title, &url)
            }
        })
        .collect()
}
