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

//! The merge engine: reconciles two revisions of one document, possibly
//! held under different perspectives.
//!
//! Composes the ancestor search with the field merger: fast-forward
//! detection, reduction of multiple common ancestors by recursive virtual
//! merging, and construction of the result under each side's perspective.

use smallvec::smallvec;
use thiserror::Error;
use tracing::trace;

use crate::ids::DocId;
use crate::ids::Version;
use crate::lca::Lca;
use crate::lca::LcaError;
use crate::lca::find_lcas;
use crate::merge::FieldMerge;
use crate::merge::merge3;
use crate::revision::Body;
use crate::revision::Parents;
use crate::revision::Revision;
use crate::store::DagView;

/// Failure to reconcile two revisions.
#[derive(Debug, Error)]
#[expect(missing_docs)]
pub enum MergeError {
    #[error("cannot merge revisions of different documents ({x} vs {y})")]
    IdMismatch { x: DocId, y: DocId },
    #[error("cannot merge a revision of {id} with no version")]
    MissingVersion { id: DocId },
    #[error("merge of {id} conflicts on {fields:?}")]
    MergeConflict { id: DocId, fields: Vec<String> },
    #[error("multiple common ancestors of {id} where exactly one is required")]
    MultipleLcas { id: DocId },
    #[error("ancestor versions diverge between perspectives ({x:?} vs {y:?})")]
    LcaVersionMismatch {
        x: Option<Version>,
        y: Option<Version>,
    },
    #[error(transparent)]
    Lca(#[from] LcaError),
}

/// A reconciled pair: the merge result under each input's perspective, and
/// the common ancestors that produced it. The two results are equal when
/// the perspectives coincide.
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Result under the first input's perspective.
    pub merged_x: Revision,
    /// Result under the second input's perspective.
    pub merged_y: Revision,
    /// Versions of the lowest common ancestors, in discovery order.
    pub lcas: Vec<Version>,
}

impl Reconciled {
    /// Whether the outcome equals one of the two inputs, i.e. no new
    /// revision was synthesized.
    pub fn is_fast_forward(&self) -> bool {
        self.merged_x.v.is_some() && self.merged_x.v == self.merged_y.v
    }
}

/// Reconciles committed revisions `x` and `y`. Both must carry versions;
/// virtual revisions only appear internally during ancestor reduction.
pub fn reconcile(
    x: &Revision,
    y: &Revision,
    view_x: &dyn DagView,
    view_y: &dyn DagView,
) -> Result<Reconciled, MergeError> {
    if x.id != y.id {
        return Err(MergeError::IdMismatch {
            x: x.id.clone(),
            y: y.id.clone(),
        });
    }
    let Some(xv) = &x.v else {
        return Err(MergeError::MissingVersion { id: x.id.clone() });
    };
    let Some(yv) = &y.v else {
        return Err(MergeError::MissingVersion { id: y.id.clone() });
    };
    // Equal versions: both sides fast-forward to themselves.
    if xv == yv {
        return Ok(Reconciled {
            merged_x: x.clone(),
            merged_y: y.clone(),
            lcas: vec![xv.clone()],
        });
    }
    merge_revisions(x, y, view_x, view_y)
}

/// Inner merge; `x` may be virtual during ancestor reduction.
fn merge_revisions(
    x: &Revision,
    y: &Revision,
    view_x: &dyn DagView,
    view_y: &dyn DagView,
) -> Result<Reconciled, MergeError> {
    let lcas = find_lcas(x, y, view_x, view_y)?;
    let lca_versions: Vec<Version> = lcas.iter().map(|lca| lca.version.clone()).collect();
    trace!(id = %x.id, lcas = ?lca_versions, "reconciling");

    // Fast-forward: one side is the single common ancestor, so the other
    // side is a pure descendant.
    if let [lca] = lcas.as_slice() {
        if Some(&lca.version) == x.v.as_ref() {
            let merged_x = recreate(y, x, lca, true)?;
            return Ok(Reconciled {
                merged_x,
                merged_y: y.clone(),
                lcas: lca_versions,
            });
        }
        if Some(&lca.version) == y.v.as_ref() {
            let merged_y = recreate(x, y, lca, false)?;
            return Ok(Reconciled {
                merged_x: x.clone(),
                merged_y,
                lcas: lca_versions,
            });
        }
    }

    // More than one lowest common ancestor: reduce to a single synthetic
    // one by pairwise virtual merging, then merge against that.
    let (lca_x, lca_y) = reduce_lcas(lcas, view_x, view_y)?;
    if lca_x.v != lca_y.v {
        return Err(MergeError::LcaVersionMismatch {
            x: lca_x.v.clone(),
            y: lca_y.v.clone(),
        });
    }

    let body_x = merge_bodies(&x.id, &x.body, &y.body, &lca_x.body, &lca_y.body)?;
    let body_y = if x.pe == y.pe {
        body_x.clone()
    } else {
        merge_bodies(&y.id, &y.body, &x.body, &lca_y.body, &lca_x.body)?
    };

    // Both parents in deterministic order; a virtual X contributes its own
    // parents in place of a version.
    let mut pa: Parents = match &x.v {
        Some(xv) => smallvec![xv.clone()],
        None => x.pa.clone(),
    };
    pa.push(y.version().expect("y is never virtual here").clone());

    let make = |pe: &Revision, body: Body| Revision {
        id: x.id.clone(),
        v: None,
        pa: pa.clone(),
        pe: pe.pe.clone(),
        i: None,
        d: x.d && y.d,
        lo: false,
        ack: false,
        op: 0,
        body,
    };
    Ok(Reconciled {
        merged_x: make(x, body_x),
        merged_y: make(y, body_y),
        lcas: lca_versions,
    })
}

/// Rebuilds a fast-forward copy of `winner` under the perspective of
/// `loser` (the side being fast-forwarded over). The body is produced by a
/// three-way merge of the two sides against the common ancestor, so
/// perspective-specific field representations survive.
fn recreate(
    winner: &Revision,
    loser: &Revision,
    lca: &Lca,
    x_side: bool,
) -> Result<Revision, MergeError> {
    let (lca_loser, lca_winner) = if x_side {
        (&lca.x, &lca.y)
    } else {
        (&lca.y, &lca.x)
    };
    let body = merge_bodies(
        &loser.id,
        &loser.body,
        &winner.body,
        &lca_loser.body,
        &lca_winner.body,
    )?;
    // The copy is of the winner, deletion state included; the sides only
    // have to agree for a deletion to survive a genuine merge, not a
    // fast-forward.
    Ok(Revision {
        id: winner.id.clone(),
        v: winner.v.clone(),
        pa: winner.pa.clone(),
        pe: loser.pe.clone(),
        i: None,
        d: winner.d,
        lo: false,
        ack: false,
        op: 0,
        body,
    })
}

fn merge_bodies(
    id: &DocId,
    x: &Body,
    y: &Body,
    lca_x: &Body,
    lca_y: &Body,
) -> Result<Body, MergeError> {
    match merge3(x, y, lca_x, lca_y) {
        FieldMerge::Merged(body) => Ok(body),
        FieldMerge::Conflicted(fields) => Err(MergeError::MergeConflict {
            id: id.clone(),
            fields,
        }),
    }
}

/// Reduces multiple lowest common ancestors to a single synthetic pair
/// (one per perspective) by folding them pairwise, oldest-sorted first.
/// Intermediate results are virtual revisions; they never touch the store.
fn reduce_lcas(
    mut lcas: Vec<Lca>,
    view_x: &dyn DagView,
    view_y: &dyn DagView,
) -> Result<(Revision, Revision), MergeError> {
    debug_assert!(!lcas.is_empty());
    if let [lca] = lcas.as_slice() {
        return Ok((lca.x.clone(), lca.y.clone()));
    }
    lcas.sort_by(|a, b| (&a.version, &a.x.pe).cmp(&(&b.version, &b.x.pe)));
    let mut iter = lcas.into_iter();
    let first = iter.next().expect("at least one ancestor");
    let mut acc_x = first.x;
    let mut acc_y = first.y;
    let same_perspective = acc_x.pe == acc_y.pe;
    for next in iter {
        acc_x = merge_revisions(&acc_x, &next.x, view_x, view_x)?.merged_x;
        if same_perspective {
            acc_y = acc_x.clone();
        } else {
            acc_y = merge_revisions(&acc_y, &next.y, view_y, view_y)?.merged_x;
        }
    }
    Ok((acc_x, acc_y))
}
