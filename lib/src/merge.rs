// Copyright 2023 The Peerdoc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Three-way merge of document bodies at field granularity.
//!
//! The merger is a pure function: given the two sides and the body of the
//! common ancestor each side is compared against, it either produces a
//! merged body or reports the names of the conflicting fields. Conflicting
//! fields are reported, never guessed.

use serde_json::Value;

use crate::revision::Body;
use crate::revision::fields_equal;

/// How one side changed a field relative to its common ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta<'a> {
    /// Present on neither the side nor its ancestor.
    Absent,
    /// Present on both, equal.
    Unchanged(&'a Value),
    /// Present on the side only.
    Added(&'a Value),
    /// Present on both, unequal.
    Modified(&'a Value),
    /// Present on the ancestor only.
    Deleted,
}

fn classify<'a>(side: &'a Body, lca: &'a Body, field: &str) -> Delta<'a> {
    match (side.get(field), lca.get(field)) {
        (None, None) => Delta::Absent,
        (Some(value), None) => Delta::Added(value),
        (None, Some(_)) => Delta::Deleted,
        (Some(value), Some(base)) if fields_equal(value, base) => Delta::Unchanged(value),
        (Some(value), Some(_)) => Delta::Modified(value),
    }
}

/// The outcome of a three-way field merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMerge {
    /// Every field merged cleanly.
    Merged(Body),
    /// Names of fields whose deltas disagree, in encounter order.
    Conflicted(Vec<String>),
}

impl FieldMerge {
    /// Whether any field conflicted.
    pub fn is_conflicted(&self) -> bool {
        matches!(self, Self::Conflicted(_))
    }

    /// The merged body, if no field conflicted.
    pub fn into_body(self) -> Option<Body> {
        match self {
            Self::Merged(body) => Some(body),
            Self::Conflicted(_) => None,
        }
    }
}

/// Merges `x` and `y` against the ancestors they were each compared to.
/// `x` is the leading side; `lca_y` is only consulted for `y`'s deltas and
/// equals `lca_x` except during multi-ancestor reduction.
///
/// Deterministic, and commutative in the absence of conflicts.
pub fn merge3(x: &Body, y: &Body, lca_x: &Body, lca_y: &Body) -> FieldMerge {
    // Union of field names in encounter order: x leads, then y, then
    // ancestor-only fields (which can still conflict with a deletion).
    let mut fields: Vec<&str> = x.keys().map(String::as_str).collect();
    for name in y.keys() {
        if !x.contains_key(name) {
            fields.push(name);
        }
    }
    for name in lca_x.keys().chain(lca_y.keys()) {
        if !x.contains_key(name) && !y.contains_key(name) && !fields.contains(&name.as_str()) {
            fields.push(name);
        }
    }

    let mut merged = Body::new();
    let mut conflicts: Vec<String> = Vec::new();
    for field in fields {
        let dx = classify(x, lca_x, field);
        let dy = classify(y, lca_y, field);
        let result = match (dx, dy) {
            // Neither side knows the field (it only exists in an ancestor
            // of the other side's line); nothing to apply.
            (Delta::Absent, Delta::Absent) => None,
            // One side never had it, the other carries it unchanged or
            // introduces/edits it.
            (Delta::Absent, Delta::Unchanged(value))
            | (Delta::Absent, Delta::Added(value))
            | (Delta::Absent, Delta::Modified(value)) => Some(value),
            (Delta::Unchanged(value), Delta::Absent)
            | (Delta::Added(value), Delta::Absent)
            | (Delta::Modified(value), Delta::Absent) => Some(value),
            // Deleted on a side that is alone in knowing it, or deleted on
            // both: the field goes away.
            (Delta::Deleted, Delta::Absent)
            | (Delta::Absent, Delta::Deleted)
            | (Delta::Deleted, Delta::Deleted) => None,
            // Unchanged against both ancestors: keep, leading side wins the
            // representation.
            (Delta::Unchanged(value), Delta::Unchanged(_)) => Some(value),
            // Exactly one side changed it.
            (Delta::Unchanged(_), Delta::Modified(value))
            | (Delta::Modified(value), Delta::Unchanged(_)) => Some(value),
            (Delta::Unchanged(_), Delta::Deleted) | (Delta::Deleted, Delta::Unchanged(_)) => None,
            // Both added or both modified: clean only when they agree.
            (Delta::Added(a), Delta::Added(b)) | (Delta::Modified(a), Delta::Modified(b)) => {
                if fields_equal(a, b) {
                    Some(a)
                } else {
                    conflicts.push(field.to_owned());
                    continue;
                }
            }
            // One side created what the other side's ancestor already knew:
            // the creator was not aware of the concurrent state.
            (Delta::Added(_), Delta::Unchanged(_))
            | (Delta::Unchanged(_), Delta::Added(_))
            // The deltas disagree: added against modified or deleted,
            // modified against deleted.
            | (Delta::Added(_), Delta::Modified(_))
            | (Delta::Modified(_), Delta::Added(_))
            | (Delta::Added(_), Delta::Deleted)
            | (Delta::Deleted, Delta::Added(_))
            | (Delta::Modified(_), Delta::Deleted)
            | (Delta::Deleted, Delta::Modified(_)) => {
                conflicts.push(field.to_owned());
                continue;
            }
        };
        if let Some(value) = result {
            merged.insert(field.to_owned(), value.clone());
        }
    }

    if conflicts.is_empty() {
        FieldMerge::Merged(merged)
    } else {
        FieldMerge::Conflicted(conflicts)
    }
}
