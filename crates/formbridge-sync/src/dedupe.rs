//! Collapse submissions of the same person into one.

use std::collections::HashMap;

use formbridge_core::NormalizedSubmission;

/// Survivors keyed by identity, in first-arrival order.
#[derive(Debug, Clone, Default)]
pub struct DedupedSubmissions {
    order: Vec<NormalizedSubmission>,
    index: HashMap<String, usize>,
}

impl DedupedSubmissions {
    pub fn get(&self, identity_key: &str) -> Option<&NormalizedSubmission> {
        self.index.get(identity_key).map(|&idx| &self.order[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &NormalizedSubmission> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_vec(self) -> Vec<NormalizedSubmission> {
        self.order
    }
}

/// Whether `incoming` should displace `stored`: completion first, then a
/// strictly later date. A missing date sorts below any real one.
fn supersedes(incoming: &NormalizedSubmission, stored: &NormalizedSubmission) -> bool {
    if incoming.completed != stored.completed {
        return incoming.completed;
    }
    incoming.submitted > stored.submitted
}

pub fn dedupe(records: impl IntoIterator<Item = NormalizedSubmission>) -> DedupedSubmissions {
    let mut out = DedupedSubmissions::default();
    for record in records {
        let existing = out.index.get(&record.identity_key).copied();
        match existing {
            Some(idx) => {
                if supersedes(&record, &out.order[idx]) {
                    out.order[idx] = record;
                }
            }
            None => {
                out.index.insert(record.identity_key.clone(), out.order.len());
                out.order.push(record);
            }
        }
    }
    out
}
