//! Job wiring: configuration, per-pair orchestration, email summary, run
//! reports and the optional daily schedule.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cropprice_core::PriceExtract;
use cropprice_portal::{read_export, ChromeNavigatorFactory};
use cropprice_storage::{ExportArchive, PgPriceWriter, PriceSink};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod notify;
pub mod orchestrator;
pub mod report;

pub use config::{Catalog, MailSettings, PipelineConfig, PipelineTimings};
pub use notify::{compose_summary, deliver, LogOnlyNotifier, Notifier, SmtpNotifier, Summary};
pub use orchestrator::{LogOnlySink, PairSettings, RunOrchestrator};

pub const CRATE_NAME: &str = "cropprice-sync";

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the database insert and the email; log them instead.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub pairs: usize,
    pub saved: usize,
    pub email_sent: bool,
    pub report_dir: Option<String>,
}

/// One complete run: every pair, then the report and the summary email.
///
/// Only configuration problems are returned as errors; pair failures end up in
/// the summary.
pub async fn run_job(config: &PipelineConfig, options: RunOptions) -> Result<JobSummary> {
    let catalog = Catalog::load_or_default(&config.catalog_path)?;

    let (sink, notifier): (Box<dyn PriceSink>, Box<dyn Notifier>) = if options.dry_run {
        (Box::new(LogOnlySink), Box::new(LogOnlyNotifier))
    } else {
        (
            Box::new(PgPriceWriter::new(config.require_db()?)),
            Box::new(SmtpNotifier::new(config.require_mail()?.clone())),
        )
    };

    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    let settings = PairSettings {
        portal_url: config.portal_url.clone(),
        download_dir: config.download_dir.clone(),
        chrome_binary: config.chrome_binary.clone(),
        timings: config.timings(),
    };
    let navigators = ChromeNavigatorFactory {
        settings: config.chrome_settings(),
    };
    let mut orchestrator = RunOrchestrator::new(catalog, settings, Box::new(navigators), sink);
    if let Some(dir) = &config.archive_dir {
        orchestrator = orchestrator.with_archive(ExportArchive::new(dir));
    }

    let log = orchestrator.run().await;
    let summary = compose_summary(&log);

    let report_dir = match report::write_run_report(&config.reports_dir, &log, &summary).await {
        Ok(dir) => Some(dir.display().to_string()),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "writing run report failed");
            None
        }
    };

    let email_sent = deliver(notifier.as_ref(), &summary).await;

    Ok(JobSummary {
        run_id: log.run_id,
        pairs: log.outcomes.len(),
        saved: log.saved_count(),
        email_sent,
        report_dir,
    })
}

pub async fn run_job_from_env(options: RunOptions) -> Result<JobSummary> {
    run_job(&PipelineConfig::from_env(), options).await
}

/// Run the extract reader against a local export file.
pub fn extract_file(path: &Path) -> Result<PriceExtract> {
    read_export(path).with_context(|| format!("extracting {}", path.display()))
}

/// Cron-driven runs. A trigger that fires while a run is still going is
/// skipped so pairs never overlap in the shared download directory.
pub async fn build_scheduler(config: PipelineConfig, options: RunOptions) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule_cron.clone();
    let config = Arc::new(config);
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous run still in progress; skipping trigger");
                return;
            };
            match run_job(&config, options).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    saved = summary.saved,
                    pairs = summary.pairs,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
