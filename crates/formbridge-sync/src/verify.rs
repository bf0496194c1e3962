//! Read-only audit of the destination's existing data.

use formbridge_core::{CapabilitySet, DestinationRecord, FieldKey, MAX_TEXT_LEN};
use formbridge_storage::{DestinationStore, StatusLabels, StoreError};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Fields a complete onboarding record is expected to carry.
const CRITICAL_FIELDS: [FieldKey; 3] = [FieldKey::Email, FieldKey::Phone, FieldKey::Address];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MalformedCapabilities,
    MissingCriticalField,
    LikelyTruncated,
    EmptyProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub record_id: String,
    pub record_name: String,
    pub kind: FindingKind,
    pub field: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub run_id: Uuid,
    pub checked: usize,
    pub complete_records: usize,
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}

#[derive(Debug, Clone)]
pub struct Auditor {
    profile_properties: Vec<String>,
    status: StatusLabels,
}

impl Auditor {
    pub fn new(profile_properties: Vec<String>, status: StatusLabels) -> Self {
        Self {
            profile_properties,
            status,
        }
    }

    pub fn audit_record(&self, record: &DestinationRecord) -> Vec<Finding> {
        let mut findings = Vec::new();
        let mut finding = |kind, field: String, detail: String| {
            findings.push(Finding {
                record_id: record.id.clone(),
                record_name: record.name.clone(),
                kind,
                field,
                detail,
            })
        };

        let caps = record.get(&FieldKey::Capabilities);
        if let Err(err) = CapabilitySet::parse_summary(caps) {
            finding(
                FindingKind::MalformedCapabilities,
                FieldKey::Capabilities.label(),
                err.to_string(),
            );
        }

        for (key, value) in &record.values {
            if key.is_long_text() && value.chars().count() >= MAX_TEXT_LEN {
                finding(
                    FindingKind::LikelyTruncated,
                    key.label(),
                    format!("value reaches the {MAX_TEXT_LEN}-character limit"),
                );
            }
        }

        let complete = record.get(&FieldKey::Status) == self.status.complete;
        if complete {
            for key in &CRITICAL_FIELDS {
                if record.get(key).trim().is_empty() {
                    finding(
                        FindingKind::MissingCriticalField,
                        key.label(),
                        "empty on a complete record".to_string(),
                    );
                }
            }
            let has_profile = self
                .profile_properties
                .iter()
                .any(|p| !record.get(&FieldKey::Profile(p.clone())).trim().is_empty());
            if !has_profile {
                finding(
                    FindingKind::EmptyProfile,
                    "profile".to_string(),
                    "no profile property populated on a complete record".to_string(),
                );
            }
        }
        findings
    }

    pub fn audit(&self, records: &[DestinationRecord]) -> VerifyReport {
        let mut report = VerifyReport {
            run_id: Uuid::new_v4(),
            checked: records.len(),
            complete_records: 0,
            findings: Vec::new(),
        };
        for record in records {
            if record.get(&FieldKey::Status) == self.status.complete {
                report.complete_records += 1;
            }
            for finding in self.audit_record(record) {
                warn!(
                    record = %finding.record_name,
                    kind = ?finding.kind,
                    field = %finding.field,
                    "{}",
                    finding.detail
                );
                report.findings.push(finding);
            }
        }
        info!(
            checked = report.checked,
            complete = report.complete_records,
            findings = report.findings.len(),
            "verification finished"
        );
        report
    }

    pub async fn verify_store(
        &self,
        store: &dyn DestinationStore,
    ) -> Result<VerifyReport, StoreError> {
        let records = store.list_records().await?;
        Ok(self.audit(&records))
    }
}
