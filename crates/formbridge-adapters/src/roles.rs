//! Field-role resolution: a versioned static map first, sampled discovery second.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use crate::router::fold_text;
use crate::{AnswerType, RawSubmission};

/// How many leading submissions discovery inspects.
pub const DISCOVERY_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    FirstName,
    LastName,
    Email,
    Phone,
    Street,
    AddressLine2,
    City,
    State,
    SchedulingLink,
    Relational,
    Autonomy,
    Tags,
    Ignore,
    #[serde(skip)]
    Capability(String),
}

pub trait FieldRoleResolver {
    /// Role of a field id or column header; `None` means an open question.
    fn resolve_field_role(&self, field_id: &str) -> Option<FieldRole>;
}

#[derive(Debug, Clone, Deserialize)]
struct RolePattern {
    contains: String,
    role: FieldRole,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldMapFile {
    version: u32,
    #[serde(default)]
    ignore: Vec<String>,
    #[serde(default)]
    roles: HashMap<String, FieldRole>,
    #[serde(default)]
    role_patterns: Vec<RolePattern>,
    #[serde(default)]
    capabilities: HashMap<String, String>,
}

fn field_key(raw: &str) -> String {
    raw.trim().replace('\u{2019}', "'")
}

/// Explicit field-role configuration loaded from `fields.yaml`.
#[derive(Debug, Clone, Default)]
pub struct StaticFieldMap {
    version: u32,
    ignore: HashSet<String>,
    roles: HashMap<String, FieldRole>,
    patterns: Vec<(String, FieldRole)>,
    capabilities: HashMap<String, String>,
}

impl StaticFieldMap {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: FieldMapFile = serde_yaml::from_str(text)?;
        Ok(Self {
            version: file.version,
            ignore: file.ignore.iter().map(|k| field_key(k)).collect(),
            roles: file
                .roles
                .into_iter()
                .map(|(k, role)| (field_key(&k), role))
                .collect(),
            patterns: file
                .role_patterns
                .into_iter()
                .map(|p| (fold_text(&p.contains), p.role))
                .collect(),
            capabilities: file
                .capabilities
                .into_iter()
                .map(|(k, name)| (field_key(&k), name))
                .collect(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.capabilities.is_empty() && self.patterns.is_empty()
    }
}

impl FieldRoleResolver for StaticFieldMap {
    fn resolve_field_role(&self, field_id: &str) -> Option<FieldRole> {
        let key = field_key(field_id);
        if self.ignore.contains(&key) {
            return Some(FieldRole::Ignore);
        }
        if let Some(role) = self.roles.get(&key) {
            return Some(role.clone());
        }
        if let Some(name) = self.capabilities.get(&key) {
            return Some(FieldRole::Capability(name.clone()));
        }
        let folded = fold_text(&key);
        self.patterns
            .iter()
            .find(|(needle, _)| folded.contains(needle))
            .map(|(_, role)| role.clone())
    }
}

/// Roles inferred from answer types and title keywords of early submissions.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFieldMap {
    roles: HashMap<String, FieldRole>,
}

fn infer_role(answer_type: AnswerType, title: &str) -> Option<FieldRole> {
    match answer_type {
        AnswerType::Email => return Some(FieldRole::Email),
        AnswerType::PhoneNumber => return Some(FieldRole::Phone),
        AnswerType::Url => return Some(FieldRole::SchedulingLink),
        AnswerType::Text => {}
        _ => return None,
    }
    let title = fold_text(title);
    let keyword_roles = [
        ("first name", FieldRole::FirstName),
        ("last name", FieldRole::LastName),
        ("email", FieldRole::Email),
        ("phone", FieldRole::Phone),
        ("address line 2", FieldRole::AddressLine2),
        ("street", FieldRole::Street),
        ("address", FieldRole::Street),
        ("city", FieldRole::City),
        ("state", FieldRole::State),
    ];
    keyword_roles
        .into_iter()
        .find(|(keyword, _)| title.contains(keyword))
        .map(|(_, role)| role)
}

impl DiscoveredFieldMap {
    /// Inspect the first `sample_size` submissions. Fields `known` already
    /// resolves are left alone, and each role is given to the first field that
    /// claims it. Best-effort: optional fields skipped early go undiscovered.
    pub fn discover(
        samples: &[RawSubmission],
        sample_size: usize,
        known: &dyn FieldRoleResolver,
    ) -> Self {
        let mut claimed: HashSet<FieldRole> = HashSet::new();
        let mut candidates: Vec<(String, AnswerType, String)> = Vec::new();
        for submission in samples.iter().take(sample_size) {
            for answer in &submission.answers {
                match known.resolve_field_role(&answer.field_id) {
                    Some(role) => {
                        claimed.insert(role);
                    }
                    None => {
                        if !candidates.iter().any(|(id, _, _)| *id == answer.field_id) {
                            let title = answer.title.clone().unwrap_or_default();
                            candidates.push((answer.field_id.clone(), answer.answer_type, title));
                        }
                    }
                }
            }
        }

        let mut roles = HashMap::new();
        for (field_id, answer_type, title) in candidates {
            if let Some(role) = infer_role(answer_type, &title) {
                if claimed.insert(role.clone()) {
                    debug!(field_id = %field_id, ?role, "discovered field role");
                    roles.insert(field_id, role);
                }
            }
        }
        Self { roles }
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl FieldRoleResolver for DiscoveredFieldMap {
    fn resolve_field_role(&self, field_id: &str) -> Option<FieldRole> {
        self.roles.get(field_id).cloned()
    }
}

/// Static map with discovery filling the gaps, resolved once per batch.
#[derive(Debug, Clone)]
pub struct LayeredFieldRoles<'a> {
    static_map: &'a StaticFieldMap,
    discovered: DiscoveredFieldMap,
}

impl<'a> LayeredFieldRoles<'a> {
    pub fn for_batch(static_map: &'a StaticFieldMap, submissions: &[RawSubmission]) -> Self {
        let discovered =
            DiscoveredFieldMap::discover(submissions, DISCOVERY_SAMPLE_SIZE, static_map);
        Self {
            static_map,
            discovered,
        }
    }

    pub fn discovered(&self) -> &DiscoveredFieldMap {
        &self.discovered
    }
}

impl FieldRoleResolver for LayeredFieldRoles<'_> {
    fn resolve_field_role(&self, field_id: &str) -> Option<FieldRole> {
        self.static_map
            .resolve_field_role(field_id)
            .or_else(|| self.discovered.resolve_field_role(field_id))
    }
}
