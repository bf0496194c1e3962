//! Source adapters: rule tables, field-role resolution, the field extractor and
//! the submission providers (CSV exports, Typeform API).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use formbridge_core::{
    CapabilityLevel, ContactInfo, NormalizedSubmission, Preferences, SchemaGeneration,
};
use formbridge_storage::HttpError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod csv_export;
pub mod roles;
pub mod router;
pub mod typeform;

pub use csv_export::CsvExportSource;
pub use roles::{
    DiscoveredFieldMap, FieldRole, FieldRoleResolver, LayeredFieldRoles, StaticFieldMap,
    DISCOVERY_SAMPLE_SIZE,
};
pub use router::{ProfileRouter, Route, RouteMatch, RoutingRules};
pub use typeform::{FormDefinition, TypeformApiSource, TypeformClient, TypeformConfig};

pub const CRATE_NAME: &str = "formbridge-adapters";

const BUILTIN_ROUTING: &str = include_str!("../../../rules/routing.yaml");
const BUILTIN_FIELDS: &str = include_str!("../../../rules/fields.yaml");
const BUILTIN_PREFERENCES: &str = include_str!("../../../rules/preferences.yaml");

/// Second address lines that carry no information.
const LINE2_JUNK: &[&str] = &["n/a", ".", "-", "none"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("decoding payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_auth())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    #[default]
    Text,
    Email,
    PhoneNumber,
    Url,
    Choice,
    Choices,
    Number,
    Boolean,
    Date,
    Other,
}

impl AnswerType {
    pub fn from_api(kind: &str) -> Self {
        match kind {
            "text" => Self::Text,
            "email" => Self::Email,
            "phone_number" => Self::PhoneNumber,
            "url" => Self::Url,
            "choice" => Self::Choice,
            "choices" => Self::Choices,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAnswer {
    /// Field id (API) or column header (CSV export).
    pub field_id: String,
    /// Question text when known.
    pub title: Option<String>,
    pub answer_type: AnswerType,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSubmission {
    pub answers: Vec<RawAnswer>,
    pub completed: bool,
    /// Timestamp text as the source reported it; only the date part is used.
    pub submitted_at: Option<String>,
    pub response_id: Option<String>,
}

impl RawSubmission {
    pub fn answer(&self, field_id: &str) -> Option<&RawAnswer> {
        self.answers.iter().find(|a| a.field_id == field_id)
    }
}

/// Everything one provider returned for a run.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub label: String,
    pub generation: SchemaGeneration,
    pub submissions: Vec<RawSubmission>,
}

#[async_trait]
pub trait SubmissionSource: Send + Sync {
    fn label(&self) -> &str;
    fn generation(&self) -> SchemaGeneration;
    async fn fetch(&self) -> Result<SourceBatch, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceEntry {
    pub keyword: String,
    pub value: String,
}

/// Ordered keyword → canonical value table; first keyword contained in the
/// lowercased answer wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PreferenceTable {
    entries: Vec<PreferenceEntry>,
}

impl PreferenceTable {
    pub fn map(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        if lower.trim().is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| lower.contains(&entry.keyword.to_lowercase()))
            .map(|entry| entry.value.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceRules {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    pub relational: PreferenceTable,
    #[serde(default)]
    pub autonomy: PreferenceTable,
}

/// Immutable rule tables driving extraction.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub routing: RoutingRules,
    pub fields: StaticFieldMap,
    pub preferences: PreferenceRules,
}

impl ExtractionRules {
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            routing: serde_yaml::from_str(BUILTIN_ROUTING).context("parsing built-in routing rules")?,
            fields: StaticFieldMap::from_yaml(BUILTIN_FIELDS)
                .context("parsing built-in field map")?,
            preferences: serde_yaml::from_str(BUILTIN_PREFERENCES)
                .context("parsing built-in preference tables")?,
        })
    }

    /// Load `routing.yaml`, `fields.yaml` and `preferences.yaml` from `dir`,
    /// falling back to the built-in copy for any file that is absent.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let routing = read_rule_file(dir, "routing.yaml", BUILTIN_ROUTING)?;
        let fields = read_rule_file(dir, "fields.yaml", BUILTIN_FIELDS)?;
        let preferences = read_rule_file(dir, "preferences.yaml", BUILTIN_PREFERENCES)?;
        Ok(Self {
            routing: serde_yaml::from_str(&routing)
                .with_context(|| format!("parsing {}", dir.join("routing.yaml").display()))?,
            fields: StaticFieldMap::from_yaml(&fields)
                .with_context(|| format!("parsing {}", dir.join("fields.yaml").display()))?,
            preferences: serde_yaml::from_str(&preferences)
                .with_context(|| format!("parsing {}", dir.join("preferences.yaml").display()))?,
        })
    }
}

fn read_rule_file(dir: &Path, name: &str, builtin: &str) -> Result<String> {
    let path = dir.join(name);
    if !path.exists() {
        debug!(path = %path.display(), "rule file absent, using built-in");
        return Ok(builtin.to_string());
    }
    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

/// Turns raw submissions into [`NormalizedSubmission`]s.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    router: ProfileRouter,
    preferences: PreferenceRules,
}

#[derive(Default)]
struct Collected {
    first: String,
    last: String,
    street: String,
    line2: String,
    contact: ContactInfo,
    preferences: Preferences,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_submitted(text: &str) -> Option<NaiveDate> {
    let day: String = text.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()
}

impl FieldExtractor {
    pub fn new(rules: &ExtractionRules) -> Self {
        Self {
            router: ProfileRouter::new(&rules.routing),
            preferences: rules.preferences.clone(),
        }
    }

    pub fn router(&self) -> &ProfileRouter {
        &self.router
    }

    /// Normalize one submission. `None` for test data and submissions
    /// without a usable name.
    pub fn extract(
        &self,
        raw: &RawSubmission,
        roles: &dyn FieldRoleResolver,
        source_label: &str,
    ) -> Option<NormalizedSubmission> {
        let mut collected = Collected::default();
        let mut capabilities = Vec::new();
        let mut open_answers: Vec<&RawAnswer> = Vec::new();

        for answer in &raw.answers {
            let value = answer.value.trim();
            match roles.resolve_field_role(&answer.field_id) {
                Some(FieldRole::Tags) => {
                    if value.contains("AI Generated") {
                        debug!(response_id = ?raw.response_id, "dropping generated test submission");
                        return None;
                    }
                }
                Some(FieldRole::Ignore) => {}
                Some(FieldRole::FirstName) => collected.first = value.to_string(),
                Some(FieldRole::LastName) => collected.last = value.to_string(),
                Some(FieldRole::Email) => collected.contact.email = non_empty(value),
                Some(FieldRole::Phone) => collected.contact.phone = non_empty(value),
                Some(FieldRole::Street) => collected.street = value.to_string(),
                Some(FieldRole::AddressLine2) => collected.line2 = value.to_string(),
                Some(FieldRole::City) => collected.contact.city = non_empty(value),
                Some(FieldRole::State) => collected.contact.state = non_empty(value),
                Some(FieldRole::SchedulingLink) => {
                    collected.contact.scheduling_link =
                        non_empty(value).filter(|link| link.starts_with("http"));
                }
                Some(FieldRole::Relational) => {
                    if let Some(mapped) = self.preferences.relational.map(value) {
                        collected.preferences.relational = Some(mapped);
                    }
                }
                Some(FieldRole::Autonomy) => {
                    if let Some(mapped) = self.preferences.autonomy.map(value) {
                        collected.preferences.autonomy = Some(mapped);
                    }
                }
                Some(FieldRole::Capability(name)) => match CapabilityLevel::from_label(value) {
                    Some(level) => capabilities.push((name, level)),
                    None if !value.is_empty() => {
                        debug!(capability = %name, label = value, "unrecognised capability label")
                    }
                    None => {}
                },
                None => open_answers.push(answer),
            }
        }

        collected.contact.street_address = join_address(&collected.street, &collected.line2);

        let mut submission = NormalizedSubmission::new(
            &collected.first,
            &collected.last,
            collected.contact,
            source_label,
        )?;
        for (name, level) in capabilities {
            submission.capabilities.insert(name, level);
        }
        submission.preferences = collected.preferences;
        submission.completed = raw.completed;
        submission.submitted = raw.submitted_at.as_deref().and_then(parse_submitted);
        submission.response_id = raw.response_id.clone();

        for answer in open_answers {
            let value = answer.value.trim();
            if self.router.is_skip_value(value) {
                continue;
            }
            let title = answer.title.as_deref().unwrap_or(&answer.field_id);
            match self.router.route(title) {
                Some(hit) => submission.profile.push(
                    hit.bucket,
                    hit.sub_label.map(str::to_string),
                    value,
                ),
                None => match self.router.fold(title) {
                    Some((key, full_title)) => {
                        submission.profile.push(&key, Some(full_title), value)
                    }
                    None => debug!(field_id = %answer.field_id, "untitled answer dropped"),
                },
            }
        }

        Some(submission)
    }
}

fn join_address(street: &str, line2: &str) -> Option<String> {
    let mut parts = Vec::new();
    let street = street.trim();
    if !street.is_empty() {
        parts.push(street);
    }
    let line2 = line2.trim();
    if !line2.is_empty() && !LINE2_JUNK.contains(&line2.to_lowercase().as_str()) {
        parts.push(line2);
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_answer(column: &str, value: &str) -> RawAnswer {
        RawAnswer {
            field_id: column.into(),
            title: Some(column.into()),
            answer_type: AnswerType::Text,
            value: value.into(),
        }
    }

    fn extract(answers: Vec<RawAnswer>) -> Option<NormalizedSubmission> {
        let rules = ExtractionRules::builtin().unwrap();
        let extractor = FieldExtractor::new(&rules);
        let raw = RawSubmission {
            answers,
            completed: true,
            submitted_at: Some("2025-03-04 17:22:10".into()),
            response_id: Some("abc".into()),
        };
        extractor.extract(&raw, &rules.fields, "v2-csv")
    }

    #[test]
    fn builtin_rules_parse() {
        let rules = ExtractionRules::builtin().unwrap();
        assert_eq!(rules.fields.version(), 2);
        assert!(!rules.routing.routes.is_empty());
        assert_eq!(
            rules.preferences.relational.map("Quite RESERVED please"),
            Some("Reserved / Stealth".to_string())
        );
        assert_eq!(rules.preferences.autonomy.map("whatever"), None);
    }

    #[test]
    fn v2_row_extracts_contact_capabilities_and_profile() {
        let submission = extract(vec![
            csv_answer("What\u{2019}s your first name?", " Jane "),
            csv_answer("What's your last name?", "Doe"),
            csv_answer("What's your email address?", "Jane@Example.com"),
            csv_answer("Street Address", "12 Elm St"),
            csv_answer("Address Line 2", "-"),
            csv_answer("City", "Austin"),
            csv_answer("Cleaning", "Level 2: Weekly reset"),
            csv_answer("Pet Care", "We don't have pets"),
            csv_answer("Meal Planning & Cooking", "Sometimes"),
            csv_answer("How much Relational Presence do you want?", "Somewhere in between"),
            csv_answer("Do you have pets?", "No"),
            csv_answer("What type of pets?", "N/A"),
            csv_answer("Tell us about your household members", "Two adults"),
            csv_answer("What is your favorite family tradition?", "Pancakes"),
            csv_answer("Submit Date (UTC)", "2025-03-04 17:22:10"),
        ])
        .unwrap();

        assert_eq!(submission.identity_key, "jane@example.com");
        assert_eq!(submission.full_name(), "Jane Doe");
        assert_eq!(submission.contact.street_address.as_deref(), Some("12 Elm St"));
        assert_eq!(submission.contact.city.as_deref(), Some("Austin"));
        assert_eq!(submission.capabilities.summary(), "Cleaning: L2");
        assert_eq!(
            submission.capabilities.get("Pet Care"),
            Some(CapabilityLevel::NotApplicable)
        );
        assert_eq!(
            submission.preferences.relational.as_deref(),
            Some("Somewhere in Between")
        );
        assert!(submission.profile.get("pets").is_none());
        assert_eq!(
            submission.profile.text("household").as_deref(),
            Some("Household: Two adults")
        );
        assert_eq!(
            submission
                .profile
                .text("What is your favorite family tradition")
                .as_deref(),
            Some("What is your favorite family tradition?: Pancakes")
        );
        assert_eq!(submission.submitted, NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(submission.response_id.as_deref(), Some("abc"));
    }

    #[test]
    fn v1_tags_and_scheduling_link() {
        assert!(extract(vec![
            csv_answer("First name", "Test"),
            csv_answer("Tags", "AI Generated, demo"),
        ])
        .is_none());

        let submission = extract(vec![
            csv_answer("First name", "Sam"),
            csv_answer("Last name", "Lee"),
            csv_answer("Address", "1 Main"),
            csv_answer("Address line 2", "Apt 4"),
            csv_answer(
                "If you have 30 minutes scheduling link copy it below",
                "calendly.com/sam",
            ),
        ])
        .unwrap();
        assert_eq!(submission.contact.street_address.as_deref(), Some("1 Main, Apt 4"));
        assert_eq!(submission.contact.scheduling_link, None);
        assert_eq!(submission.identity_key, "sam lee");
    }

    #[test]
    fn untitled_answers_stay_out_of_the_profile() {
        let submission = extract(vec![
            csv_answer("First name", "Sam"),
            csv_answer("Last name", "Lee"),
            csv_answer("", "stray cell"),
            csv_answer(" ? ", "another"),
        ])
        .unwrap();
        assert!(submission.profile.is_empty());
    }

    #[test]
    fn nameless_submissions_are_dropped() {
        assert!(extract(vec![csv_answer("Email", "x@y.z")]).is_none());
        let last_only = extract(vec![csv_answer("Last name", "Lee")]).unwrap();
        assert_eq!(last_only.first, "");
    }

    #[test]
    fn rule_dir_falls_back_per_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("preferences.yaml"),
            "version: 9\nrelational:\n  - { keyword: quiet, value: Quiet }\n",
        )
        .unwrap();
        let rules = ExtractionRules::from_dir(dir.path()).unwrap();
        assert_eq!(rules.preferences.relational.map("very quiet"), Some("Quiet".into()));
        assert!(rules.preferences.autonomy.map("directive").is_none());
        assert_eq!(rules.fields.version(), 2);
    }
}
