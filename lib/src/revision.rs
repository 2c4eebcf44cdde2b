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

//! The canonical revision record and its invariants.

use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;

use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;

/// A document payload: field name to JSON-comparable value.
///
/// `serde_json` is built with `preserve_order`, so a body keeps its field
/// order through encode/decode round trips.
pub type Body = serde_json::Map<String, Value>;

/// Ordered list of parent versions. Two inline slots cover every
/// non-degenerate case: 0 for roots, 1 for linear edits, 2 for merges.
pub type Parents = SmallVec<[Version; 2]>;

/// Failure to construct or validate a revision record.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// The record violates a structural invariant.
    #[error("invalid revision: {reason}")]
    InvalidRevision {
        /// Which invariant, in one line.
        reason: String,
    },
}

/// One node of a per-document version DAG.
///
/// A revision is immutable once committed, except that `ack` may flip
/// false→true and `op` may be set once. Revisions are never deleted.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
pub struct Revision {
    /// Identifier of the document this revision belongs to.
    pub id: DocId,
    /// The version assigned at creation. `None` only on virtual revisions,
    /// the transient intermediates of multi-ancestor reduction.
    pub v: Option<Version>,
    /// Parent versions, in creation order.
    pub pa: Parents,
    /// The perspective this revision reflects.
    pub pe: Perspective,
    /// Monotone increment, assigned at commit time. `None` until committed.
    pub i: Option<u64>,
    /// Deletion flag. A deleted revision still carries the last known body.
    pub d: bool,
    /// Locally-originated: created by this peer rather than ingested.
    pub lo: bool,
    /// Confirmed back from the source collection.
    pub ack: bool,
    /// Source-stream cursor at which this revision was observed. Zero for
    /// purely internal revisions.
    pub op: u64,
    /// The document payload at this revision.
    pub body: Body,
}

impl Revision {
    /// A fresh, uncommitted revision with a generated version.
    pub fn new(id: DocId, pe: Perspective, pa: Parents, body: Body) -> Self {
        Self {
            id,
            v: Some(Version::generate()),
            pa,
            pe,
            i: None,
            d: false,
            lo: false,
            ack: false,
            op: 0,
            body,
        }
    }

    /// Whether this revision is virtual: an in-memory intermediate with no
    /// assigned version, never persisted.
    pub fn is_virtual(&self) -> bool {
        self.v.is_none()
    }

    /// Whether this revision starts a new DAG for its document.
    pub fn is_root(&self) -> bool {
        self.pa.is_empty()
    }

    /// The assigned version, or an error for virtual revisions.
    pub fn version(&self) -> Result<&Version, RevisionError> {
        self.v.as_ref().ok_or_else(|| RevisionError::InvalidRevision {
            reason: format!("revision of {} has no version", self.id),
        })
    }

    /// Checks the structural invariants of a single record: the id must be
    /// non-empty, the version (when present) must be a short printable
    /// identifier, and parents must all be distinct.
    pub fn validate(&self) -> Result<(), RevisionError> {
        if self.id.as_bytes().is_empty() {
            return Err(RevisionError::InvalidRevision {
                reason: "missing document id".to_owned(),
            });
        }
        if let Some(v) = &self.v
            && !Version::is_valid(v.as_str())
        {
            return Err(RevisionError::InvalidRevision {
                reason: format!("malformed version {v:?}"),
            });
        }
        for (n, pa) in self.pa.iter().enumerate() {
            if self.pa[..n].contains(pa) {
                return Err(RevisionError::InvalidRevision {
                    reason: format!("duplicate parent {pa} on {}", self.id),
                });
            }
        }
        if self.pe.as_str().is_empty() {
            return Err(RevisionError::InvalidRevision {
                reason: "missing perspective".to_owned(),
            });
        }
        Ok(())
    }

    /// Clones this revision into another perspective. The version, parents,
    /// body, and deletion flag carry over; commit-time state (`i`, `ack`,
    /// `op`) and the locally-originated flag do not.
    pub fn to_perspective(&self, pe: Perspective) -> Self {
        Self {
            id: self.id.clone(),
            v: self.v.clone(),
            pa: self.pa.clone(),
            pe,
            i: None,
            d: self.d,
            lo: false,
            ack: false,
            op: 0,
            body: self.body.clone(),
        }
    }

    /// Field-level equality against another body.
    pub fn body_equals(&self, other: &Body) -> bool {
        bodies_equal(&self.body, other)
    }
}

/// Canonical JSON rendering: object keys sorted, no insignificant
/// whitespace. Two values that differ only in field order or formatting
/// canonicalize identically, so they never spuriously conflict.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.as_str());
                for (n, (key, value)) in entries.iter().enumerate() {
                    if n > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(value, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (n, item) in items.iter().enumerate() {
                    if n > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            _ => out.push_str(&value.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Field equality: scalars by strict equality, arrays and nested objects by
/// canonical serialization equality.
pub fn fields_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => {
            canonical_json(a) == canonical_json(b)
        }
        _ => a == b,
    }
}

/// Whole-body equality under [`fields_equal`] semantics.
pub fn bodies_equal(a: &Body, b: &Body) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(name, value)| b.get(name).is_some_and(|other| fields_equal(value, other)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use smallvec::smallvec;
    use test_case::test_case;

    use super::*;

    fn body(value: Value) -> Body {
        match value {
            Value::Object(map) => map,
            _ => panic!("test body must be an object"),
        }
    }

    #[test]
    fn test_validate_ok() {
        let rev = Revision::new(
            DocId::from_str_key("a"),
            Perspective::local(),
            Parents::new(),
            body(json!({"foo": 1})),
        );
        assert!(rev.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_id() {
        let rev = Revision::new(
            DocId::from_bytes(b""),
            Perspective::local(),
            Parents::new(),
            Body::new(),
        );
        assert!(matches!(
            rev.validate(),
            Err(RevisionError::InvalidRevision { .. })
        ));
    }

    #[test]
    fn test_validate_duplicate_parent() {
        let p = Version::generate();
        let mut rev = Revision::new(
            DocId::from_str_key("a"),
            Perspective::local(),
            smallvec![p.clone(), p],
            Body::new(),
        );
        rev.v = Some(Version::generate());
        assert!(rev.validate().is_err());
    }

    #[test]
    fn test_to_perspective_resets_commit_state() {
        let mut rev = Revision::new(
            DocId::from_str_key("a"),
            Perspective::remote("peer1"),
            Parents::new(),
            body(json!({"foo": 1})),
        );
        rev.i = Some(7);
        rev.ack = true;
        rev.lo = true;
        rev.op = 42;
        let local = rev.to_perspective(Perspective::local());
        assert_eq!(local.v, rev.v);
        assert_eq!(local.body, rev.body);
        assert_eq!(local.i, None);
        assert!(!local.ack);
        assert!(!local.lo);
        assert_eq!(local.op, 0);
    }

    #[test]
    fn test_fields_equal_nested_order_insensitive() {
        let a = json!({"x": 1, "y": {"p": 1, "q": 2}});
        let b = json!({"y": {"q": 2, "p": 1}, "x": 1});
        assert!(fields_equal(&a, &b));
    }

    #[test_case(json!(1), json!(1), true; "equal integers")]
    #[test_case(json!(1), json!(1.0), false; "integer vs float")]
    #[test_case(json!("1"), json!(1), false; "string vs integer")]
    #[test_case(json!(null), json!(null), true; "nulls")]
    #[test_case(json!(true), json!(1), false; "bool vs integer")]
    fn test_fields_equal_scalar_strict(a: Value, b: Value, expected: bool) {
        assert_eq!(fields_equal(&a, &b), expected);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v = json!({"b": [1, {"z": 0, "a": 1}], "a": null});
        assert_eq!(canonical_json(&v), r#"{"a":null,"b":[1,{"a":1,"z":0}]}"#);
    }
}
