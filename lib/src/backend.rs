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

#![expect(missing_docs)]

use std::any::Any;
use std::fmt::Debug;

use thiserror::Error;

use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::revision::Revision;

/// Error that may occur during backend initialization.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct BackendInitError(pub Box<dyn std::error::Error + Send + Sync>);

/// DAG-backend error that may occur after the backend is loaded.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("version {version} of {id} already exists under perspective {perspective}")]
    VersionExists {
        id: DocId,
        version: Version,
        perspective: Perspective,
    },
    #[error("parent {parent} of {id} not present under perspective {perspective}")]
    ParentMissing {
        id: DocId,
        parent: Version,
        perspective: Perspective,
    },
    #[error("revision {version} of {id} not found under perspective {perspective}")]
    RevisionNotFound {
        id: DocId,
        version: Version,
        perspective: Perspective,
    },
    #[error("revision at increment {increment} not found")]
    IncrementNotFound { increment: u64 },
    #[error("cannot persist a virtual revision of {id}")]
    VirtualRevision { id: DocId },
    #[error("revision of {id} has no increment assigned")]
    IncrementUnassigned { id: DocId },
    #[error("store unavailable")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Persistence seam for the per-collection version DAG.
///
/// Conceptually an ordered key-value namespace with three key families:
///
/// - `i -> revision`: monotone replication order,
/// - `(id, v, pe) -> i`: primary lookup,
/// - `(id, pe, i desc) -> ()`: head and latest-by-perspective scans.
///
/// Revisions are serialized deterministically by the backend. The trait is
/// synchronous: callers treat every read as a suspension point at a higher
/// layer, and the single writer serializes all mutation.
pub trait Backend: Any + Send + Sync + Debug {
    /// A unique name identifying this backend implementation.
    fn name(&self) -> &str;

    /// Appends a committed revision. The revision must carry an increment.
    ///
    /// Fails with [`BackendError::VersionExists`] if `(id, v, pe)` is
    /// already present and [`BackendError::ParentMissing`] if any parent is
    /// not present for the same `(id, pe)`.
    fn put(&self, rev: &Revision) -> BackendResult<()>;

    /// Primary lookup by `(id, v, pe)`.
    fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> BackendResult<Option<Revision>>;

    /// Lookup by increment.
    fn by_increment(&self, i: u64) -> BackendResult<Option<Revision>>;

    /// The highest assigned increment, if any revision is stored.
    fn max_increment(&self) -> BackendResult<Option<u64>>;

    /// All revisions with increment strictly greater than `from`, in
    /// increasing increment order.
    fn scan_increments(&self, from_exclusive: u64) -> BackendResult<Vec<Revision>>;

    /// Every revision of `(id, pe)`, newest first: decreasing increment for
    /// the local perspective, reverse insertion order for remote ones (the
    /// two coincide, because increments are assigned in insertion order).
    fn history(&self, id: &DocId, pe: &Perspective) -> BackendResult<Vec<Revision>>;

    /// Whether any revision of `id` is stored, under any perspective.
    fn contains_id(&self, id: &DocId) -> BackendResult<bool>;

    /// Sets `ack = true` and records the source-stream cursor on an already
    /// committed revision. `ack` may only flip false→true, and `op` is set
    /// once; repeated calls are idempotent.
    fn mark_acked(&self, id: &DocId, v: &Version, pe: &Perspective, op: u64) -> BackendResult<()>;

    /// Total number of stored revisions. Bounds offset scans.
    fn len(&self) -> BackendResult<usize>;

    fn is_empty(&self) -> BackendResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl dyn Backend {
    /// Returns reference of the implementation type.
    pub fn downcast_ref<T: Backend>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}
