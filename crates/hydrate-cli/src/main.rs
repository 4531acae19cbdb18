//! hydrate - in-memory demo of the hydration engine.
//!
//! Seeds one subject, submits its syllabus and runs workers, publisher,
//! reaper and reconciler until the cascade finishes (or ctrl-c).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use hydrate_core::app::SubmitRequest;
use hydrate_core::domain::{EntityId, EntityType, JobStatus, JobType, Subject};
use hydrate_core::impls::{InMemoryDeliveryQueue, InMemoryStore, StubGenerator};
use hydrate_core::{AppBuilder, HydrationConfig};

mod observability;

/// Hydrate one subject end to end with the stub generator.
#[derive(Parser)]
#[command(name = "hydrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subject name to hydrate
    #[arg(long, default_value = "Introductory Biology")]
    subject: String,

    /// Planned chapter count
    #[arg(long, default_value_t = 3)]
    chapters: u32,

    /// Topics the stub generator writes per chapter
    #[arg(long, default_value_t = 3)]
    topics_per_chapter: usize,

    /// Content language
    #[arg(long, default_value = "en")]
    language: String,

    /// Worker count (overrides HYDRATE_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Reconcile interval in milliseconds (overrides HYDRATE_RECONCILE_INTERVAL_MS)
    #[arg(long)]
    reconcile_ms: Option<u64>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env は無くてもよい
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    observability::init(if cli.verbose { "debug" } else { "info" }, cli.json_logs);

    let mut config = HydrationConfig::from_env().context("reading HYDRATE_* configuration")?;
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    if let Some(ms) = cli.reconcile_ms {
        config = config.with_reconcile_interval(Duration::from_millis(ms));
    }

    let store = Arc::new(InMemoryStore::new());
    let app = AppBuilder::new(config)
        .store(store.clone())
        .delivery_queue(Arc::new(InMemoryDeliveryQueue::new()))
        .generator(Arc::new(
            StubGenerator::new().with_topics_per_chapter(cli.topics_per_chapter),
        ))
        .with_default_handlers()?
        .build()
        .context("building hydration app")?;

    let subject_id = EntityId::generate();
    store
        .insert_subject(Subject {
            id: subject_id,
            name: cli.subject.clone(),
            description: None,
            target_chapters: Some(cli.chapters),
        })
        .await;

    let group = app.start();
    let submission = app
        .submitter()
        .submit(
            SubmitRequest::new(JobType::Syllabus, EntityType::Subject, subject_id)
                .with_language(cli.language.clone()),
        )
        .await
        .context("submitting syllabus")?;
    tracing::info!(root_id = %submission.job_id, subject = %cli.subject, "syllabus submitted");

    let status = app.status();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.timeout_secs);
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted");
                break None;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let report = status
            .report(submission.job_id)
            .await?
            .context("root job disappeared")?;
        if let Some(progress) = report.job.progress {
            tracing::info!(
                status = %report.job.status,
                chapters = progress.chapters.completed,
                topics = progress.topics.completed,
                notes = progress.notes.completed,
                questions = progress.questions.completed,
                "progress"
            );
        }
        if report.job.status.is_terminal() {
            break Some(report);
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(timeout_secs = cli.timeout_secs, "gave up waiting for the cascade");
            break Some(report);
        }
    };

    group.shutdown_and_join().await;

    let Some(report) = outcome else {
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&report.job)?);
    if report.job.status != JobStatus::Completed {
        match report.error {
            Some(error) => bail!("root ended {}: {} ({})", report.job.status, error.message, error.code),
            None => bail!("root ended {}", report.job.status),
        }
    }
    Ok(())
}
