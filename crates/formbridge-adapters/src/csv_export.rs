//! Typeform CSV exports (either form generation).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use formbridge_core::SchemaGeneration;
use tracing::{debug, info};

use crate::{AdapterError, AnswerType, RawAnswer, RawSubmission, SourceBatch, SubmissionSource};

const RESPONSE_ID_COLUMN: &str = "#";
const RESPONSE_TYPE_COLUMN: &str = "Response Type";
const SUBMIT_DATE_COLUMN: &str = "Submit Date (UTC)";

#[derive(Debug, Clone)]
pub struct CsvExportSource {
    path: PathBuf,
    generation: SchemaGeneration,
    label: String,
}

impl CsvExportSource {
    pub fn new(path: impl Into<PathBuf>, generation: SchemaGeneration) -> Self {
        Self {
            path: path.into(),
            generation,
            label: format!("{}-csv", generation.as_str()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse an export body. Rows are read flexibly since hand-edited exports
/// often carry ragged trailing columns.
pub fn parse_export(bytes: &[u8]) -> Result<Vec<RawSubmission>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut submissions = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut submission = RawSubmission::default();
        let mut partial = false;
        let mut has_submit_column = false;

        for (header, value) in headers.iter().zip(record.iter()) {
            let value = value.trim();
            match header.as_str() {
                RESPONSE_ID_COLUMN => {
                    submission.response_id = (!value.is_empty()).then(|| value.to_string());
                }
                RESPONSE_TYPE_COLUMN => partial = value.eq_ignore_ascii_case("partial"),
                SUBMIT_DATE_COLUMN => {
                    has_submit_column = true;
                    submission.submitted_at = (!value.is_empty()).then(|| value.to_string());
                }
                _ => {}
            }
            if value.is_empty() {
                continue;
            }
            submission.answers.push(RawAnswer {
                field_id: header.clone(),
                title: Some(header.clone()),
                answer_type: AnswerType::Text,
                value: value.to_string(),
            });
        }

        if submission.answers.is_empty() {
            continue;
        }
        submission.completed =
            !partial && (!has_submit_column || submission.submitted_at.is_some());
        submissions.push(submission);
    }
    Ok(submissions)
}

#[async_trait]
impl SubmissionSource for CsvExportSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn generation(&self) -> SchemaGeneration {
        self.generation
    }

    async fn fetch(&self) -> Result<SourceBatch, AdapterError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        let submissions = parse_export(&bytes)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "read export");
        info!(source = %self.label, rows = submissions.len(), "loaded CSV export");
        Ok(SourceBatch {
            label: self.label.clone(),
            generation: self.generation,
            submissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_follows_response_type_and_submit_date() {
        let body = "\u{feff}#,First name,Response Type,Submit Date (UTC)\n\
                    r1,Ann,completed,2025-01-02 10:00:00\n\
                    r2,Bob,partial,2025-01-03 10:00:00\n\
                    r3,Cy,completed,\n\
                    ,,,\n";
        let rows = parse_export(body.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].response_id.as_deref(), Some("r1"));
        assert!(rows[0].completed);
        assert!(!rows[1].completed);
        assert!(!rows[2].completed);
        assert_eq!(rows[0].answer("First name").unwrap().value, "Ann");
    }

    #[test]
    fn ragged_rows_are_tolerated() {
        let body = "First name,Last name\nAnn\nBea,Cole,extra\n";
        let rows = parse_export(body.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].answer("Last name").is_none());
        assert!(rows[0].completed);
        assert_eq!(rows[1].answer("Last name").unwrap().value, "Cole");
    }
}
