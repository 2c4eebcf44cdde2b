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

//! Lowest-common-ancestor search across two perspective trees.
//!
//! The finder walks two leaf→root revision streams simultaneously,
//! consuming them at roughly equal depth, and reports the set of common
//! ancestors no other common ancestor descends from. It is a pure, CPU-only
//! computation: the streams are driven explicitly and nothing suspends.

use std::collections::HashSet;

use thiserror::Error;

use crate::backend::BackendError;
use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::revision::Revision;
use crate::store::DagView;

/// Failure of the ancestor search.
#[derive(Debug, Error)]
#[expect(missing_docs)]
pub enum LcaError {
    /// Both streams exhausted without a common ancestor.
    #[error("no common ancestor for {id}")]
    NoLca { id: DocId },
    /// A common ancestor was found, but its copy under a required
    /// perspective is absent from the store.
    #[error("ancestor {version} of {id} has no copy under perspective {perspective}")]
    MissingPerspective {
        id: DocId,
        version: Version,
        perspective: Perspective,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One lowest common ancestor, resolved under both perspectives. The two
/// copies coincide when the perspectives do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lca {
    /// The shared version of the ancestor.
    pub version: Version,
    /// The ancestor as stored under the first side's perspective.
    pub x: Revision,
    /// The ancestor as stored under the second side's perspective.
    pub y: Revision,
}

/// State of one side of the walk.
struct Side {
    /// Versions whose revisions are still awaited from this side's stream.
    open: HashSet<Version>,
    /// Every version visited on this side.
    visited: HashSet<Version>,
}

impl Side {
    fn seed(leaf: &Revision) -> Self {
        // A virtual leaf has no version of its own; its parents stand in.
        let open = match &leaf.v {
            Some(v) => HashSet::from([v.clone()]),
            None => leaf.pa.iter().cloned().collect(),
        };
        Self {
            open,
            visited: HashSet::new(),
        }
    }

    /// Consumes one stream item. Returns the version if it advanced the
    /// frontier (the item was an awaited ancestor).
    fn advance(&mut self, rev: &Revision, shadowed: &mut HashSet<Version>) -> Option<Version> {
        let v = rev.v.as_ref()?;
        if shadowed.contains(v) {
            shadowed.extend(rev.pa.iter().cloned());
        }
        if !self.open.remove(v) {
            return None;
        }
        self.open.extend(rev.pa.iter().cloned());
        self.visited.insert(v.clone());
        Some(v.clone())
    }
}

/// Returns the lowest common ancestors of `x` and `y` (same document),
/// resolved under both perspectives, in first-seen order.
///
/// `view_x` and `view_y` supply the leaf→root streams for each side's
/// perspective; they may be overlays that include not-yet-committed
/// revisions.
pub fn find_lcas(
    x: &Revision,
    y: &Revision,
    view_x: &dyn DagView,
    view_y: &dyn DagView,
) -> Result<Vec<Lca>, LcaError> {
    debug_assert_eq!(x.id, y.id);
    let id = &x.id;

    // Shortcuts before streaming: identical leaves, or one leaf a direct
    // parent of the other.
    if let (Some(xv), Some(yv)) = (&x.v, &y.v) {
        if xv == yv {
            return resolve(id, vec![xv.clone()], x, y, view_x, view_y);
        }
        if y.pa.contains(xv) {
            return resolve(id, vec![xv.clone()], x, y, view_x, view_y);
        }
        if x.pa.contains(yv) {
            return resolve(id, vec![yv.clone()], x, y, view_x, view_y);
        }
    }

    let mut side_x = Side::seed(x);
    let mut side_y = Side::seed(y);
    // Common ancestors already shadowed by a found LCA, i.e. everything a
    // found LCA reaches through its parents.
    let mut shadowed: HashSet<Version> = HashSet::new();
    let mut found: Vec<Version> = Vec::new();

    let mut stream_x = view_x.history_from(id, &x.pe, x.v.as_ref())?.into_iter();
    let mut stream_y = view_y.history_from(id, &y.pe, y.v.as_ref())?.into_iter();

    // Alternate sides so both streams are consumed at roughly equal depth;
    // once one side runs dry the other is drained.
    let mut take_x = true;
    loop {
        // The frontiers have converged once the open-head sets mutually
        // contain each other; whatever remains open is common.
        if side_x.open == side_y.open {
            let mut remaining: Vec<_> = side_x.open.iter().cloned().collect();
            remaining.sort_unstable();
            for v in remaining {
                if !shadowed.contains(&v)
                    && !found.contains(&v)
                    && view_x.get(id, &v, &x.pe)?.is_some()
                {
                    found.push(v);
                }
            }
            break;
        }

        let item = if take_x {
            stream_x
                .next()
                .map(|rev| (rev, true))
                .or_else(|| stream_y.next().map(|rev| (rev, false)))
        } else {
            stream_y
                .next()
                .map(|rev| (rev, false))
                .or_else(|| stream_x.next().map(|rev| (rev, true)))
        };
        let Some((rev, was_x)) = item else {
            break;
        };
        take_x = !was_x;

        let (this, other) = if was_x {
            (&mut side_x, &side_y)
        } else {
            (&mut side_y, &side_x)
        };
        if let Some(v) = this.advance(&rev, &mut shadowed)
            && other.visited.contains(&v)
            && !shadowed.contains(&v)
            && !found.contains(&v)
        {
            found.push(v.clone());
            shadowed.extend(rev.pa.iter().cloned());
        }
    }

    if found.is_empty() {
        return Err(LcaError::NoLca { id: id.clone() });
    }
    resolve(id, found, x, y, view_x, view_y)
}

/// Binds each found version to its copy under both perspectives.
fn resolve(
    id: &DocId,
    versions: Vec<Version>,
    x: &Revision,
    y: &Revision,
    view_x: &dyn DagView,
    view_y: &dyn DagView,
) -> Result<Vec<Lca>, LcaError> {
    versions
        .into_iter()
        .map(|version| {
            let bound_x = view_x.get(id, &version, &x.pe)?.ok_or_else(|| {
                LcaError::MissingPerspective {
                    id: id.clone(),
                    version: version.clone(),
                    perspective: x.pe.clone(),
                }
            })?;
            let bound_y = view_y.get(id, &version, &y.pe)?.ok_or_else(|| {
                LcaError::MissingPerspective {
                    id: id.clone(),
                    version: version.clone(),
                    perspective: y.pe.clone(),
                }
            })?;
            Ok(Lca {
                version,
                x: bound_x,
                y: bound_y,
            })
        })
        .collect()
}
