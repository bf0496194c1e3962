//! Locate the destination record a submission belongs to.
//!
//! Matching is staged and never fuzzy: an exact full-name hit, then the last
//! name as a whole word, then the first name as a whole word. Whole-word
//! checks keep a short surname such as `Art` from matching inside `Martinez`.

use std::collections::HashMap;

use formbridge_core::{DestinationRecord, MergePlan};
use formbridge_storage::{DestinationStore, StoreError};
use regex::Regex;
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::debug;

/// Destination records keyed by lowercased full name, in listing order.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    entries: Vec<(String, DestinationRecord)>,
    by_id: HashMap<String, usize>,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl CandidateSet {
    pub fn from_records(records: impl IntoIterator<Item = DestinationRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.by_id.insert(record.id.clone(), set.entries.len());
            set.entries.push((name_key(&record.name), record));
        }
        set
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DestinationRecord> {
        self.entries.iter().map(|(_, record)| record)
    }

    pub fn get(&self, record_id: &str) -> Option<&DestinationRecord> {
        self.by_id.get(record_id).map(|&idx| &self.entries[idx].1)
    }

    /// Mirror a successful update into the snapshot so later submissions in
    /// the same batch plan against current values.
    pub fn apply_plan(&mut self, record_id: &str, plan: &MergePlan) {
        if let Some(&idx) = self.by_id.get(record_id) {
            plan.apply_to(&mut self.entries[idx].1);
        }
    }

    fn find_key(&self, predicate: impl Fn(&str) -> bool) -> Option<&DestinationRecord> {
        self.entries
            .iter()
            .find(|(key, _)| predicate(key))
            .map(|(_, record)| record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    Exact,
    LastName,
    FirstName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMatch<'a> {
    pub record: &'a DestinationRecord,
    pub stage: MatchStage,
}

fn whole_word(token: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(token))).ok()
}

/// Staged lookup over an in-memory candidate set.
pub fn find_match<'a>(
    candidates: &'a CandidateSet,
    first: &str,
    last: &str,
) -> Option<RecordMatch<'a>> {
    let first = first.trim().to_lowercase();
    let last = last.trim().to_lowercase();

    let full = format!("{first} {last}").trim().to_string();
    if !full.is_empty() {
        if let Some(record) = candidates.find_key(|key| key == full) {
            return Some(RecordMatch { record, stage: MatchStage::Exact });
        }
    }

    let stages = [
        (last.as_str(), 1usize, MatchStage::LastName),
        (first.as_str(), 2usize, MatchStage::FirstName),
    ];
    for (token, min_len, stage) in stages {
        if token.chars().count() <= min_len {
            continue;
        }
        let Some(pattern) = whole_word(token) else {
            continue;
        };
        if let Some(record) = candidates.find_key(|key| pattern.is_match(key)) {
            return Some(RecordMatch { record, stage });
        }
    }
    None
}

/// Pre-filters through the store's substring search, then re-runs the local
/// staged check on the results; the local check decides.
pub struct RemoteMatcher<'s> {
    store: &'s dyn DestinationStore,
}

impl<'s> RemoteMatcher<'s> {
    pub fn new(store: &'s dyn DestinationStore) -> Self {
        Self { store }
    }

    pub async fn find(
        &self,
        first: &str,
        last: &str,
    ) -> Result<Option<(DestinationRecord, MatchStage)>, StoreError> {
        let full = format!("{} {}", first.trim(), last.trim()).trim().to_string();
        let mut queries = vec![full];
        for (fragment, min_len) in [(last.trim(), 1usize), (first.trim(), 2usize)] {
            if fragment.chars().count() > min_len && !queries.iter().any(|q| q == fragment) {
                queries.push(fragment.to_string());
            }
        }
        // Full name first; a name with two short parts gets no other query.
        for fragment in queries.iter().filter(|q| !q.is_empty()) {
            let results = self.store.search_by_name(fragment).await?;
            debug!(fragment = %fragment, hits = results.len(), "remote name search");
            let candidates = CandidateSet::from_records(results);
            if let Some(hit) = find_match(&candidates, first, last) {
                return Ok(Some((hit.record.clone(), hit.stage)));
            }
        }
        Ok(None)
    }
}

/// Raised when the matched name does not contain both incoming name parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchWarning {
    pub incoming: String,
    pub matched: String,
    pub similarity: f64,
}

pub fn match_quality(matched_name: &str, first: &str, last: &str) -> Option<MatchWarning> {
    let name = matched_name.trim().to_lowercase();
    let first = first.trim().to_lowercase();
    let last = last.trim().to_lowercase();
    if name.contains(&first) && name.contains(&last) {
        return None;
    }
    let incoming = format!("{first} {last}").trim().to_string();
    Some(MatchWarning {
        similarity: jaro_winkler(&incoming, &name),
        incoming,
        matched: matched_name.trim().to_string(),
    })
}
