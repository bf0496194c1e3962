//! Sync orchestration: configuration, dedupe, matching, merge planning, the
//! run driver, destination audits and scheduled runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use formbridge_adapters::{
    AdapterError, CsvExportSource, SubmissionSource, TypeformApiSource, TypeformClient,
};
use formbridge_core::SchemaGeneration;
use formbridge_storage::{DestinationStore, NotionStore, StoreError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod config;
pub mod dedupe;
pub mod driver;
pub mod matcher;
pub mod planner;
pub mod verify;

pub use config::{ConfigError, SyncConfig, TypeformCredentials};
pub use dedupe::{dedupe, DedupedSubmissions};
pub use driver::{Decision, DecisionKind, SourceTally, SyncDriver, SyncOptions, SyncReport, SyncState};
pub use matcher::{
    find_match, match_quality, CandidateSet, MatchStage, MatchWarning, RecordMatch, RemoteMatcher,
};
pub use planner::MergePlanner;
pub use verify::{Auditor, Finding, FindingKind, VerifyReport};

pub const CRATE_NAME: &str = "formbridge-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {source_label} failed: {error}")]
    Source {
        source_label: String,
        #[source]
        error: AdapterError,
    },
    #[error("destination unavailable: {0}")]
    Destination(#[source] StoreError),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Source { error, .. } => error.is_auth(),
            Self::Destination(err) => err.is_auth(),
        }
    }
}

/// Which submissions one run ingests.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub v1_export: Option<PathBuf>,
    pub v2_export: Option<PathBuf>,
    pub api: bool,
    pub options: SyncOptions,
}

impl SyncRequest {
    pub fn has_sources(&self) -> bool {
        self.v1_export.is_some() || self.v2_export.is_some() || self.api
    }
}

/// Sources in processing order: V1 export, V2 export, then the live API.
pub fn build_sources(
    config: &SyncConfig,
    request: &SyncRequest,
) -> Result<Vec<Box<dyn SubmissionSource>>> {
    let mut sources: Vec<Box<dyn SubmissionSource>> = Vec::new();
    if let Some(path) = &request.v1_export {
        sources.push(Box::new(CsvExportSource::new(path, SchemaGeneration::V1)));
    }
    if let Some(path) = &request.v2_export {
        sources.push(Box::new(CsvExportSource::new(path, SchemaGeneration::V2)));
    }
    if request.api {
        let typeform = config
            .typeform_config()
            .context("TYPEFORM_TOKEN and TYPEFORM_FORM_ID are required for API ingestion")?;
        let client = TypeformClient::new(typeform, config.http_client_config())
            .context("building Typeform client")?;
        sources.push(Box::new(TypeformApiSource::new(client)));
    }
    Ok(sources)
}

pub async fn run_sync(config: &SyncConfig, request: &SyncRequest) -> Result<SyncReport> {
    let rules = config.extraction_rules()?;
    let schema = config.destination_schema(&rules)?;
    let status = schema.status_labels.clone();
    let store: Arc<dyn DestinationStore> = Arc::new(
        NotionStore::new(config.notion_config(), schema, config.http_client_config())
            .context("building Notion client")?,
    );
    let sources = build_sources(config, request)?;

    let mut driver = SyncDriver::new(store, &rules, status, request.options);
    let report = driver.run(&sources).await?;
    Ok(report)
}

pub async fn run_sync_from_env(request: &SyncRequest) -> Result<SyncReport> {
    let config = SyncConfig::from_env(request.api)?;
    run_sync(&config, request).await
}

pub async fn run_verify(config: &SyncConfig) -> Result<VerifyReport> {
    let rules = config.extraction_rules()?;
    let schema = config.destination_schema(&rules)?;
    let auditor = Auditor::new(schema.profile_properties.clone(), schema.status_labels.clone());
    let store = NotionStore::new(config.notion_config(), schema, config.http_client_config())
        .context("building Notion client")?;
    auditor
        .verify_store(&store)
        .await
        .context("listing destination records")
}

pub async fn run_verify_from_env() -> Result<VerifyReport> {
    let config = SyncConfig::from_env(false)?;
    run_verify(&config).await
}

/// Scheduler running the API sync on `config.schedule_cron`.
pub async fn build_scheduler(config: SyncConfig, options: SyncOptions) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule_cron.clone();
    let config = Arc::new(config);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        Box::pin(async move {
            let request = SyncRequest {
                api: true,
                options,
                ..SyncRequest::default()
            };
            match run_sync(&config, &request).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    updated = report.updated,
                    errors = report.errors,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
