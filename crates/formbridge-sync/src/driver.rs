//! Sync driver: fetch, extract, dedupe, match, plan, apply, report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use formbridge_adapters::{
    ExtractionRules, FieldExtractor, LayeredFieldRoles, SourceBatch, StaticFieldMap,
    SubmissionSource,
};
use formbridge_core::{DestinationRecord, FieldKey, NormalizedSubmission};
use formbridge_storage::{DestinationStore, StatusLabels};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedupe::dedupe;
use crate::matcher::{find_match, match_quality, CandidateSet, MatchStage, RemoteMatcher};
use crate::planner::MergePlanner;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    FetchingSource,
    Extracting,
    Deduping,
    MatchingAndPlanning,
    Reporting,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionKind {
    Sync,
    /// Dry-run stand-in for `Sync`.
    Plan,
    Skip,
    Miss,
    Warn,
    Error,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Plan => "PLAN",
            Self::Skip => "SKIP",
            Self::Miss => "MISS",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub source: String,
    pub incoming: String,
    pub matched: Option<String>,
    pub record_id: Option<String>,
    pub stage: Option<MatchStage>,
    pub fields: Vec<String>,
    pub detail: Option<String>,
}

impl Decision {
    fn new(kind: DecisionKind, source: &str, incoming: &NormalizedSubmission) -> Self {
        Self {
            kind,
            source: source.to_string(),
            incoming: incoming.full_name(),
            matched: None,
            record_id: None,
            stage: None,
            fields: Vec::new(),
            detail: None,
        }
    }

    fn against(mut self, record: &DestinationRecord, stage: MatchStage) -> Self {
        self.matched = Some(record.name.clone());
        self.record_id = Some(record.id.clone());
        self.stage = Some(stage);
        self
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceTally {
    pub label: String,
    pub fetched: usize,
    pub extracted: usize,
    pub unique: usize,
    pub updated: usize,
    pub skipped: usize,
    pub not_found: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub not_found: usize,
    pub warnings: usize,
    pub errors: usize,
    pub fields_added: Vec<String>,
    pub sources: Vec<SourceTally>,
    pub decisions: Vec<Decision>,
}

impl SyncReport {
    fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            processed: 0,
            updated: 0,
            skipped: 0,
            not_found: 0,
            warnings: 0,
            errors: 0,
            fields_added: Vec::new(),
            sources: Vec::new(),
            decisions: Vec::new(),
        }
    }

    /// True when at least one record was processed and every one failed.
    pub fn all_failed(&self) -> bool {
        self.processed > 0 && self.errors == self.processed
    }

    fn record(&mut self, decision: Decision) {
        let kind = decision.kind.as_str();
        let matched = decision.matched.as_deref().unwrap_or("-");
        let fields = decision.fields.join(", ");
        let detail = decision.detail.as_deref().unwrap_or("");
        match decision.kind {
            DecisionKind::Error => error!(
                decision = kind,
                source = %decision.source,
                incoming = %decision.incoming,
                matched,
                detail,
                "{kind} {} -> {matched}: {detail}",
                decision.incoming
            ),
            DecisionKind::Warn => warn!(
                decision = kind,
                source = %decision.source,
                incoming = %decision.incoming,
                matched,
                detail,
                "{kind} {} -> {matched}: {detail}",
                decision.incoming
            ),
            _ => info!(
                decision = kind,
                source = %decision.source,
                incoming = %decision.incoming,
                matched,
                fields = %fields,
                "{kind} {} -> {matched} {}",
                decision.incoming,
                if fields.is_empty() { detail.to_string() } else { format!("(updating: {fields})") }
            ),
        }
        self.decisions.push(decision);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Plan and report everything, write nothing.
    pub dry_run: bool,
    /// Match through the store's name search instead of a full listing.
    pub remote_search: bool,
}

pub struct SyncDriver {
    store: Arc<dyn DestinationStore>,
    extractor: FieldExtractor,
    field_map: StaticFieldMap,
    planner: MergePlanner,
    required_fields: Vec<FieldKey>,
    options: SyncOptions,
    state: SyncState,
}

impl SyncDriver {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        rules: &ExtractionRules,
        status: StatusLabels,
        options: SyncOptions,
    ) -> Self {
        let layout = rules.routing.layout.clone();
        let mut required_fields: Vec<FieldKey> = layout
            .properties()
            .into_iter()
            .map(|p| FieldKey::Profile(p.to_string()))
            .collect();
        required_fields.push(FieldKey::Status);
        Self {
            store,
            extractor: FieldExtractor::new(rules),
            field_map: rules.fields.clone(),
            planner: MergePlanner::new(layout, status),
            required_fields,
            options,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, next: SyncState) {
        debug!(from = ?self.state, to = ?next, "sync state");
        self.state = next;
    }

    /// Run every source in order. Sources should be given oldest form
    /// generation first so newer values win the always-overwrite fields.
    pub async fn run(
        &mut self,
        sources: &[Box<dyn SubmissionSource>],
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(self.options.dry_run);
        let span = info_span!("sync_run", run_id = %report.run_id, dry_run = self.options.dry_run);
        async move {
            self.transition(SyncState::FetchingSource);
            let (batches, mut candidates) = match self.fetch_stage(sources, &mut report).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    self.transition(SyncState::Aborted);
                    error!(error = %err, "aborting run");
                    return Err(err);
                }
            };

            for (idx, batch) in batches.iter().enumerate() {
                let mut tally = SourceTally {
                    label: batch.label.clone(),
                    fetched: batch.submissions.len(),
                    ..SourceTally::default()
                };

                self.transition(SyncState::Extracting);
                let extracted = self.extract_batch(batch);
                tally.extracted = extracted.len();

                self.transition(SyncState::Deduping);
                let unique = dedupe(extracted).into_vec();
                tally.unique = unique.len();
                info!(
                    source = %batch.label,
                    rows = tally.fetched,
                    extracted = tally.extracted,
                    unique = tally.unique,
                    "prepared batch"
                );

                self.transition(SyncState::MatchingAndPlanning);
                for submission in &unique {
                    self.process(submission, &batch.label, &mut candidates, &mut tally, &mut report)
                        .await;
                }

                let more_batches = idx + 1 < batches.len();
                if more_batches
                    && tally.updated > 0
                    && !self.options.dry_run
                    && !self.options.remote_search
                {
                    match self.store.list_records().await {
                        Ok(records) => {
                            info!(records = records.len(), "refreshed destination snapshot");
                            candidates = CandidateSet::from_records(records);
                        }
                        Err(err) => {
                            warn!(error = %err, "snapshot refresh failed, keeping local copy")
                        }
                    }
                }
                info!(
                    source = %tally.label,
                    updated = tally.updated,
                    skipped = tally.skipped,
                    not_found = tally.not_found,
                    errors = tally.errors,
                    "batch finished"
                );
                report.sources.push(tally);
            }

            self.transition(SyncState::Reporting);
            report.finished_at = Some(Utc::now());
            info!(
                processed = report.processed,
                updated = report.updated,
                skipped = report.skipped,
                not_found = report.not_found,
                warnings = report.warnings,
                errors = report.errors,
                dry_run = report.dry_run,
                "sync finished"
            );
            self.transition(SyncState::Done);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Everything that must succeed before any record is touched.
    async fn fetch_stage(
        &self,
        sources: &[Box<dyn SubmissionSource>],
        report: &mut SyncReport,
    ) -> Result<(Vec<SourceBatch>, CandidateSet), SyncError> {
        if self.options.dry_run {
            debug!("dry run, destination schema left unchanged");
        } else {
            match self.store.ensure_fields(&self.required_fields).await {
                Ok(added) => {
                    if !added.is_empty() {
                        info!(fields = ?added, "added destination fields");
                    }
                    report.fields_added = added;
                }
                Err(err) if err.is_auth() => return Err(SyncError::Destination(err)),
                Err(err) => warn!(error = %err, "could not extend destination schema"),
            }
        }

        let candidates = if self.options.remote_search {
            CandidateSet::default()
        } else {
            let records = self.store.list_records().await.map_err(SyncError::Destination)?;
            info!(records = records.len(), "listed destination records");
            CandidateSet::from_records(records)
        };

        let mut batches = Vec::with_capacity(sources.len());
        for source in sources {
            let batch = source.fetch().await.map_err(|error| SyncError::Source {
                source_label: source.label().to_string(),
                error,
            })?;
            batches.push(batch);
        }
        Ok((batches, candidates))
    }

    fn extract_batch(&self, batch: &SourceBatch) -> Vec<NormalizedSubmission> {
        let roles = LayeredFieldRoles::for_batch(&self.field_map, &batch.submissions);
        if !roles.discovered().is_empty() {
            info!(source = %batch.label, discovered = roles.discovered().len(), "discovered field roles");
        }
        batch
            .submissions
            .iter()
            .filter_map(|raw| self.extractor.extract(raw, &roles, &batch.label))
            .collect()
    }

    async fn locate(
        &self,
        submission: &NormalizedSubmission,
        candidates: &CandidateSet,
    ) -> Result<Option<(DestinationRecord, MatchStage)>, SyncError> {
        if self.options.remote_search {
            RemoteMatcher::new(self.store.as_ref())
                .find(&submission.first, &submission.last)
                .await
                .map_err(SyncError::Destination)
        } else {
            Ok(find_match(candidates, &submission.first, &submission.last)
                .map(|hit| (hit.record.clone(), hit.stage)))
        }
    }

    async fn process(
        &self,
        submission: &NormalizedSubmission,
        source: &str,
        candidates: &mut CandidateSet,
        tally: &mut SourceTally,
        report: &mut SyncReport,
    ) {
        report.processed += 1;

        let (record, stage) = match self.locate(submission, candidates).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tally.not_found += 1;
                report.not_found += 1;
                report.record(Decision::new(DecisionKind::Miss, source, submission));
                return;
            }
            Err(err) => {
                tally.errors += 1;
                report.errors += 1;
                report.record(
                    Decision::new(DecisionKind::Error, source, submission)
                        .detail(format!("search failed: {err}")),
                );
                return;
            }
        };

        if let Some(warning) = match_quality(&record.name, &submission.first, &submission.last) {
            report.warnings += 1;
            report.record(
                Decision::new(DecisionKind::Warn, source, submission)
                    .against(&record, stage)
                    .detail(format!(
                        "matched name differs from submission (similarity {:.2})",
                        warning.similarity
                    )),
            );
        }

        let plan = self.planner.plan(&record, submission);
        if !plan.has_data() {
            tally.skipped += 1;
            report.skipped += 1;
            report.record(
                Decision::new(DecisionKind::Skip, source, submission)
                    .against(&record, stage)
                    .detail("all fields already populated"),
            );
            return;
        }

        let mut decision = Decision::new(DecisionKind::Sync, source, submission).against(&record, stage);
        decision.fields = plan.field_labels();

        if self.options.dry_run {
            decision.kind = DecisionKind::Plan;
        } else if let Err(err) = self.store.update_record(&record.id, &plan).await {
            tally.errors += 1;
            report.errors += 1;
            decision.kind = DecisionKind::Error;
            report.record(decision.detail(format!("update failed: {err}")));
            return;
        }

        candidates.apply_plan(&record.id, &plan);
        tally.updated += 1;
        report.updated += 1;
        report.record(decision);
    }
}
