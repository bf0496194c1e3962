//! Core domain model for formbridge: normalized submissions, capability levels,
//! profile buckets, destination snapshots and merge plans.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "formbridge-core";

/// Rich-text block limit of the destination workspace.
pub const MAX_TEXT_LEN: usize = 2000;

/// Source form generation a submission was captured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaGeneration {
    V1,
    V2,
}

impl SchemaGeneration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityLevel {
    L1,
    L2,
    L3,
    L4,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl CapabilityLevel {
    /// Map a choice label such as `Level 2: Full household...` to a level.
    ///
    /// Labels saying the household doesn't have or doesn't need the service map
    /// to [`CapabilityLevel::NotApplicable`]. Anything else is unrecognised.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.is_empty() {
            return None;
        }
        let lower = label.to_lowercase().replace('\u{2019}', "'");
        if lower.contains("don't have") || lower.contains("don't need") {
            return Some(Self::NotApplicable);
        }
        let rest = lower.strip_prefix("level ")?;
        match rest.chars().next()? {
            '1' => Some(Self::L1),
            '2' => Some(Self::L2),
            '3' => Some(Self::L3),
            '4' => Some(Self::L4),
            _ => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "L1" => Some(Self::L1),
            "L2" => Some(Self::L2),
            "L3" => Some(Self::L3),
            "L4" => Some(Self::L4),
            "N/A" => Some(Self::NotApplicable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::L4 => "L4",
            Self::NotApplicable => "N/A",
        }
    }
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static CAPABILITY_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:,]+): (L[1-4]|N/A)$").expect("valid capability regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityGrammarError {
    #[error("malformed capability entry `{entry}` at position {position}")]
    MalformedEntry { position: usize, entry: String },
    #[error("capability `{0}` listed more than once")]
    Duplicate(String),
}

/// Ordered capability name → level assignments for one household.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    entries: Vec<(String, CapabilityLevel)>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a level; a repeated name keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, level: CapabilityLevel) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = level,
            None => self.entries.push((name, level)),
        }
    }

    pub fn get(&self, name: &str) -> Option<CapabilityLevel> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, level)| *level)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CapabilityLevel)> {
        self.entries.iter().map(|(n, l)| (n.as_str(), *l))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render `Name: L2, Other: L1`, leaving out N/A entries.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .filter(|(_, level)| *level != CapabilityLevel::NotApplicable)
            .map(|(name, level)| format!("{name}: {level}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Parse a stored summary string, rejecting anything outside the grammar.
    pub fn parse_summary(text: &str) -> Result<Self, CapabilityGrammarError> {
        let mut set = Self::new();
        let text = text.trim().trim_end_matches(',').trim_end();
        if text.is_empty() {
            return Ok(set);
        }
        for (position, entry) in text.split(", ").enumerate() {
            let caps = CAPABILITY_ENTRY.captures(entry).ok_or_else(|| {
                CapabilityGrammarError::MalformedEntry {
                    position,
                    entry: entry.to_string(),
                }
            })?;
            let name = caps[1].trim().to_string();
            let level = CapabilityLevel::from_code(&caps[2]).ok_or_else(|| {
                CapabilityGrammarError::MalformedEntry {
                    position,
                    entry: entry.to_string(),
                }
            })?;
            if set.get(&name).is_some() {
                return Err(CapabilityGrammarError::Duplicate(name));
            }
            set.insert(name, level);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub scheduling_link: Option<String>,
}

/// Canonical values of the two categorical preference questions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub relational: Option<String>,
    pub autonomy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub sub_label: Option<String>,
    pub value: String,
}

impl ProfileEntry {
    pub fn render(&self) -> String {
        match &self.sub_label {
            Some(label) => format!("{label}: {}", self.value),
            None => self.value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileBucket {
    pub id: String,
    pub entries: Vec<ProfileEntry>,
}

impl ProfileBucket {
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .map(ProfileEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Free-text profile notes grouped into buckets, in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileBuckets {
    buckets: Vec<ProfileBucket>,
}

impl ProfileBuckets {
    pub fn push(&mut self, bucket_id: &str, sub_label: Option<String>, value: impl Into<String>) {
        let entry = ProfileEntry {
            sub_label,
            value: value.into(),
        };
        match self.buckets.iter_mut().find(|b| b.id == bucket_id) {
            Some(bucket) => bucket.entries.push(entry),
            None => self.buckets.push(ProfileBucket {
                id: bucket_id.to_string(),
                entries: vec![entry],
            }),
        }
    }

    pub fn get(&self, bucket_id: &str) -> Option<&ProfileBucket> {
        self.buckets.iter().find(|b| b.id == bucket_id)
    }

    pub fn text(&self, bucket_id: &str) -> Option<String> {
        self.get(bucket_id).map(ProfileBucket::text)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProfileBucket> {
        self.buckets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProperty {
    pub bucket: String,
    pub property: String,
}

/// Which destination property each profile bucket lands in.
///
/// Buckets without an entry (including folded generic questions) go to the
/// catch-all property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileLayout {
    #[serde(default)]
    pub buckets: Vec<BucketProperty>,
    pub catch_all_property: String,
}

impl ProfileLayout {
    pub fn property_for(&self, bucket_id: &str) -> &str {
        self.buckets
            .iter()
            .find(|b| b.bucket == bucket_id)
            .map(|b| b.property.as_str())
            .unwrap_or(&self.catch_all_property)
    }

    /// Distinct destination properties, catch-all last.
    pub fn properties(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for bucket in &self.buckets {
            if !out.contains(&bucket.property.as_str()) {
                out.push(&bucket.property);
            }
        }
        if !out.contains(&self.catch_all_property.as_str()) {
            out.push(&self.catch_all_property);
        }
        out
    }

    /// Render buckets into per-property text, joining buckets that share a property.
    pub fn render(&self, profile: &ProfileBuckets) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for bucket in profile.iter() {
            let text = bucket.text();
            if text.is_empty() {
                continue;
            }
            out.entry(self.property_for(&bucket.id).to_string())
                .and_modify(|existing| {
                    existing.push('\n');
                    existing.push_str(&text);
                })
                .or_insert(text);
        }
        out
    }
}

/// Identity key: email when present, otherwise the lowercased full name.
pub fn identity_key(email: Option<&str>, first: &str, last: &str) -> Option<String> {
    if let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) {
        return Some(email.to_lowercase());
    }
    let name = format!("{} {}", first.trim(), last.trim())
        .trim()
        .to_lowercase();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSubmission {
    pub identity_key: String,
    pub first: String,
    pub last: String,
    pub contact: ContactInfo,
    pub capabilities: CapabilitySet,
    pub preferences: Preferences,
    pub profile: ProfileBuckets,
    pub completed: bool,
    pub submitted: Option<NaiveDate>,
    pub source: String,
    pub response_id: Option<String>,
}

impl NormalizedSubmission {
    /// Start a submission for a person; `None` when neither name part is usable.
    pub fn new(
        first: &str,
        last: &str,
        contact: ContactInfo,
        source: impl Into<String>,
    ) -> Option<Self> {
        let first = first.trim().to_string();
        let last = last.trim().to_string();
        if first.is_empty() && last.is_empty() {
            return None;
        }
        let identity_key = identity_key(contact.email.as_deref(), &first, &last)?;
        Some(Self {
            identity_key,
            first,
            last,
            contact,
            capabilities: CapabilitySet::new(),
            preferences: Preferences::default(),
            profile: ProfileBuckets::default(),
            completed: true,
            submitted: None,
            source: source.into(),
            response_id: None,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first, self.last).trim().to_string()
    }
}

/// Closed set of destination fields the planner may write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldKey {
    Email,
    Phone,
    Address,
    City,
    State,
    SchedulingLink,
    Capabilities,
    Relational,
    Autonomy,
    Status,
    Profile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Write only when the destination value is empty.
    FillIfEmpty,
    /// Write whenever the incoming value is non-empty.
    AlwaysOverwrite,
    /// Written on every plan.
    Always,
}

impl FieldKey {
    /// Free-text fields bound by the `MAX_TEXT_LEN` block limit.
    pub fn is_long_text(&self) -> bool {
        matches!(
            self,
            Self::Address | Self::City | Self::Capabilities | Self::Profile(_)
        )
    }

    pub fn policy(&self) -> MergePolicy {
        match self {
            Self::Capabilities | Self::Relational | Self::Autonomy => MergePolicy::AlwaysOverwrite,
            Self::Status => MergePolicy::Always,
            _ => MergePolicy::FillIfEmpty,
        }
    }

    /// Short name used in decision lines.
    pub fn label(&self) -> String {
        match self {
            Self::Email => "email".to_string(),
            Self::Phone => "phone".to_string(),
            Self::Address => "address".to_string(),
            Self::City => "city".to_string(),
            Self::State => "state".to_string(),
            Self::SchedulingLink => "scheduling_link".to_string(),
            Self::Capabilities => "capabilities".to_string(),
            Self::Relational => "relational".to_string(),
            Self::Autonomy => "autonomy".to_string(),
            Self::Status => "status".to_string(),
            Self::Profile(property) => format!("profile:{property}"),
        }
    }
}

/// Snapshot of one destination record's current values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationRecord {
    pub id: String,
    pub name: String,
    pub values: BTreeMap<FieldKey, String>,
}

impl DestinationRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: FieldKey, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    /// Current value, empty string when unset.
    pub fn get(&self, key: &FieldKey) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Field writes computed for one matched record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub writes: BTreeMap<FieldKey, String>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// True when the plan carries anything beyond the status marker.
    pub fn has_data(&self) -> bool {
        self.writes.keys().any(|k| *k != FieldKey::Status)
    }

    pub fn is_status_only(&self) -> bool {
        !self.writes.is_empty() && !self.has_data()
    }

    pub fn get(&self, key: &FieldKey) -> Option<&str> {
        self.writes.get(key).map(String::as_str)
    }

    pub fn field_labels(&self) -> Vec<String> {
        self.writes.keys().map(FieldKey::label).collect()
    }

    /// Fold the writes into a snapshot, as the destination would after an update.
    pub fn apply_to(&self, record: &mut DestinationRecord) {
        for (key, value) in &self.writes {
            record.values.insert(key.clone(), value.clone());
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
