mod agent;
mod error;
mod extract;
mod models;
mod orchestrator;
mod platforms;
mod profile;
mod session;
mod settings;
mod store;

use agent::{HyperbrowserTransport, TaskOutcome};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use models::{JobRecord, JobStatus};
use orchestrator::{Orchestrator, RunSummary};
use platforms::PlatformResolver;
use profile::UserProfile;
use settings::Settings;
use std::sync::Arc;
use store::JobStore;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hunt-swarm")]
#[command(about = "Multi-platform job search automation - search, track, and apply with a browsing agent")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every enabled platform concurrently
    Run {
        /// Search query (repeatable, defaults to target roles from preferences)
        #[arg(short = 'Q', long = "query")]
        queries: Vec<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List tracked jobs
    List {
        /// Filter by status (found, reviewed, applied)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by company (substring, case-insensitive)
        #[arg(short, long)]
        company: Option<String>,
    },

    /// Show job details
    Show {
        /// Job index
        index: usize,
    },

    /// Search tracked jobs by title, company, or location
    Search {
        query: String,
    },

    /// Show store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Move a job to a new status
    Mark {
        /// Job index
        index: usize,

        /// New status (found, reviewed, applied)
        status: String,

        /// Note logged with the transition
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Show configured platforms
    Platforms,

    /// Apply to one tracked job through the agent
    Apply {
        /// Job index
        index: usize,
    },

    /// Have the agent summarize a job posting
    Analyze {
        url: String,
    },

    /// Have the agent check application status on a candidate portal
    CheckStatus {
        /// Portal URL
        portal_url: String,

        /// Portal password (the email comes from personal_info.json)
        #[arg(short, long, default_value = "")]
        password: String,
    },
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let settings = Settings::from_env();
    let store = Arc::new(
        JobStore::open(&settings.data_file, settings.store_options())
            .with_context(|| format!("Failed to open job store at {}", settings.data_file.display()))?,
    );

    match cli.command {
        Commands::Run { queries, json } => {
            let profile = UserProfile::load(&settings.user_dir);
            let queries = if queries.is_empty() {
                profile.preferences.search_queries()
            } else {
                queries
            };
            let context = profile.matching_context()?;
            let orchestrator = build_orchestrator(&settings, Arc::clone(&store), profile)?;

            info!(queries = ?queries, "Starting job search");
            let summary = orchestrator.run(&queries, &context).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }

        Commands::List { status, company } => {
            let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
            let jobs = match (status, &company) {
                (Some(status), Some(company)) => {
                    let company = company.to_lowercase();
                    let mut jobs = store.by_status(status);
                    jobs.retain(|(_, job)| job.company.to_lowercase().contains(&company));
                    jobs
                }
                (Some(status), None) => store.by_status(status),
                (None, Some(company)) => store.by_company(company),
                (None, None) => store.all(),
            };
            print_jobs(&jobs);
        }

        Commands::Show { index } => match store.get(index) {
            Some(job) => print_job(index, &job)?,
            None => println!("Job #{} not found.", index),
        },

        Commands::Search { query } => {
            print_jobs(&store.search(&query));
        }

        Commands::Stats { json } => {
            let stats = store.statistics();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if store.is_empty() {
                println!("No jobs tracked yet in {}.", store.path().display());
            } else {
                println!("Total jobs: {}", stats.total_jobs);
                println!("Applied:    {}", stats.applied_count);
                println!("\nBy status:");
                for (status, count) in &stats.by_status {
                    println!("  {:<12} {:>5}", status, count);
                }
                println!("\nBy company:");
                for (company, count) in &stats.by_company {
                    println!("  {:<30} {:>5}", truncate(company, 28), count);
                }
                println!("\nBy job board:");
                for (board, count) in &stats.by_job_board {
                    println!("  {:<20} {:>5}", board, count);
                }
            }
        }

        Commands::Mark { index, status, note } => {
            let status: JobStatus = status.parse()?;
            if store.update_status(index, status, note.as_deref().unwrap_or(""))? {
                println!("Marked job #{} as {}.", index, status);
            } else {
                println!("Job #{} was not updated (unknown index or backward transition).", index);
            }
        }

        Commands::Platforms => {
            let resolver = PlatformResolver::load(&settings.platforms_file());
            let global = resolver.global();
            println!(
                "Max concurrent sessions: {}",
                global.max_concurrent_browsers.unwrap_or(settings.max_concurrent_browsers)
            );
            println!("No-login mode: {}\n", global.no_login_mode);

            if resolver.config().platforms.is_empty() {
                println!("No platforms configured in {}.", settings.platforms_file().display());
            } else {
                println!(
                    "{:<16} {:<18} {:<8} {:>8} {:<6} {:>7} {:>8}",
                    "KEY", "NAME", "ENABLED", "PRIORITY", "LOGIN", "MAX APP", "TIMEOUT"
                );
                println!("{}", "-".repeat(78));
                for (key, profile) in &resolver.config().platforms {
                    println!(
                        "{:<16} {:<18} {:<8} {:>8} {:<6} {:>7} {:>7}s",
                        truncate(key, 14),
                        truncate(&resolver.display_name(key), 16),
                        if resolver.is_enabled(key) { "yes" } else { "no" },
                        profile.priority.unwrap_or(platforms::DEFAULT_PRIORITY),
                        if resolver.requires_login(key) { "yes" } else { "no" },
                        resolver.max_applications(key),
                        resolver.session_timeout(key).as_secs()
                    );
                }
                let order = resolver.enabled_platforms();
                if !order.is_empty() {
                    println!("\nRun order: {}", order.join(", "));
                }
            }
        }

        Commands::Apply { index } => {
            let profile = UserProfile::load(&settings.user_dir);
            let orchestrator = build_orchestrator(&settings, Arc::clone(&store), profile)?;
            let outcome = orchestrator.apply_to_index(index).await?;
            if outcome.success {
                println!("Applied to job #{} ({}).", index, outcome.job_url);
                if let Some(session) = outcome.session_id {
                    println!("Session: {}", session);
                }
            } else {
                println!(
                    "Application to job #{} failed: {}",
                    index,
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }

        Commands::Analyze { url } => {
            let profile = UserProfile::load(&settings.user_dir);
            let orchestrator = build_orchestrator(&settings, Arc::clone(&store), profile)?;
            print_outcome(&orchestrator.analyze(&url).await);
        }

        Commands::CheckStatus { portal_url, password } => {
            let profile = UserProfile::load(&settings.user_dir);
            let orchestrator = build_orchestrator(&settings, Arc::clone(&store), profile)?;
            print_outcome(&orchestrator.check_status(&portal_url, &password).await);
        }
    }

    Ok(())
}

fn build_orchestrator(settings: &Settings, store: Arc<JobStore>, profile: UserProfile) -> Result<Orchestrator> {
    let transport = HyperbrowserTransport::new(settings.agent_api_key.clone(), &settings.agent_base_url)?;
    let resolver = PlatformResolver::load(&settings.platforms_file());
    Ok(Orchestrator::new(
        resolver,
        store,
        Arc::new(transport),
        settings.clone(),
        profile,
    ))
}

fn print_jobs(jobs: &[(usize, JobRecord)]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<6} {:<9} {:<30} {:<20} {:<14} {:<12}",
        "INDEX", "STATUS", "TITLE", "COMPANY", "BOARD", "UPDATED"
    );
    println!("{}", "-".repeat(94));
    for (index, job) in jobs {
        println!(
            "{:<6} {:<9} {:<30} {:<20} {:<14} {:<12}",
            index,
            job.status,
            truncate(&job.job_title, 28),
            truncate(&job.company, 18),
            truncate(&job.job_board, 12),
            job.last_updated.format("%Y-%m-%d")
        );
    }
}

fn print_job(index: usize, job: &JobRecord) -> Result<()> {
    println!("Job #{}", index);
    println!("Title: {}", job.job_title);
    println!("Company: {}", job.company);
    println!("Status: {}", job.status);
    if !job.location.is_empty() {
        println!("Location: {}", job.location);
    }
    if !job.salary_range.is_empty() {
        println!("Salary: {}", job.salary_range);
    }
    if !job.job_url.is_empty() {
        println!("URL: {}", job.job_url);
    }
    if !job.job_board.is_empty() {
        println!("Board: {}", job.job_board);
    }
    println!("Updated: {}", job.last_updated.format("%Y-%m-%d %H:%M:%S"));
    if !job.additional_info.is_empty() {
        println!(
            "\n--- Additional Info ---\n{}",
            serde_json::to_string_pretty(&job.additional_info)?
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\nRun finished in {:.1}s", summary.duration_secs);
    println!(
        "Platforms: {} succeeded / {} scheduled / {} enabled",
        summary.successful_platforms,
        summary.scheduled_platforms.len(),
        summary.total_platforms
    );
    if !summary.skipped_platforms.is_empty() {
        println!("Not scheduled (over concurrency bound): {}", summary.skipped_platforms.join(", "));
    }
    println!("Jobs found:   {}", summary.total_jobs_found);
    println!("Applications: {}", summary.total_applications);

    println!(
        "\n{:<16} {:<8} {:>6} {:>8} {:>9}  {}",
        "PLATFORM", "RESULT", "JOBS", "APPLIED", "DURATION", "NOTE"
    );
    println!("{}", "-".repeat(80));
    for (platform, report) in &summary.platform_results {
        let note = match &report.error {
            Some(error) => truncate(error, 34),
            None => {
                let failed = report.searches.iter().filter(|s| !s.success).count();
                if failed > 0 {
                    format!("{} search(es) failed", failed)
                } else {
                    String::new()
                }
            }
        };
        println!(
            "{:<16} {:<8} {:>6} {:>8} {:>8.1}s  {}",
            truncate(platform, 14),
            if report.success { "ok" } else { "failed" },
            report.jobs_found,
            report.applications_made,
            report.session_duration_secs,
            note
        );
    }

    println!("\nStore: {} jobs, {} applied", summary.statistics.total_jobs, summary.statistics.applied_count);
}

fn print_outcome(outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Completed(report) => {
            if let Some(session) = &report.session_id {
                println!("Session: {}", session);
            }
            if let Some(steps) = report.steps_taken {
                println!("Steps: {}", steps);
            }
            if let Some(url) = &report.live_view_url {
                println!("Live view: {}", url);
            }
            if let Some(url) = &report.recording_url {
                println!("Recording: {}", url);
            }
            println!("\n{}", report.result_text);
        }
        TaskOutcome::Failed { error, .. } => {
            println!("Agent task failed: {}", error);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
