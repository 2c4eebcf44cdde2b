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

use std::collections::HashSet;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::instrument;

use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::revision::Revision;

/// Read view over a version DAG.
///
/// Implemented by [`Store`] for committed state and by [`Overlay`] for
/// committed state plus a pending batch. The merge machinery only reads
/// through this trait, so it is oblivious to whether its inputs are
/// committed yet.
pub trait DagView {
    /// Lookup by `(id, v, pe)`.
    fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> BackendResult<Option<Revision>>;

    /// The leaf→root stream of `(id, pe)` consumed by ancestor searches.
    /// When `from` is given, the stream starts at that version (inclusive);
    /// otherwise at the newest revision.
    fn history_from(
        &self,
        id: &DocId,
        pe: &Perspective,
        from: Option<&Version>,
    ) -> BackendResult<Vec<Revision>>;

    /// Leaves of the branch: revisions no other revision of the same
    /// `(id, pe)` names as a parent. Deleted revisions are excluded unless
    /// requested.
    fn heads(
        &self,
        id: &DocId,
        pe: &Perspective,
        include_deleted: bool,
    ) -> BackendResult<Vec<Revision>> {
        let all = self.history_from(id, pe, None)?;
        let mut referenced: HashSet<&Version> = HashSet::new();
        for rev in &all {
            referenced.extend(&rev.pa);
        }
        Ok(all
            .iter()
            .filter(|rev| rev.v.as_ref().is_some_and(|v| !referenced.contains(v)))
            .filter(|rev| include_deleted || !rev.d)
            .cloned()
            .collect())
    }

    /// Whether `ancestor` is a (transitive, inclusive) ancestor of the
    /// revision at `descendant` within one perspective.
    fn is_ancestor(
        &self,
        id: &DocId,
        pe: &Perspective,
        ancestor: &Version,
        descendant: &Version,
    ) -> BackendResult<bool> {
        let mut open = vec![descendant.clone()];
        let mut seen: HashSet<Version> = HashSet::new();
        while let Some(v) = open.pop() {
            if v == *ancestor {
                return Ok(true);
            }
            if !seen.insert(v.clone()) {
                continue;
            }
            if let Some(rev) = self.get(id, &v, pe)? {
                open.extend(rev.pa.iter().cloned());
            }
        }
        Ok(false)
    }
}

/// The per-collection DAG store: append-only, topologically ordered
/// persistence of revisions over a pluggable [`Backend`].
///
/// Single-writer, many-reader: exactly one ingestion run mutates the store
/// at a time (the ingest pipeline holds the write lock for a whole batch),
/// while cursors and bridges read committed state concurrently.
pub struct Store {
    backend: Box<dyn Backend>,
    /// Next increment to hand out. Populated lazily from the backend's max,
    /// and only advanced while the ingest lock is held, so increments are
    /// never reused.
    next_increment: Mutex<Option<u64>>,
    /// Signalled after every committed batch; replication cursors park here
    /// while waiting for new data.
    watch: Notify,
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Store")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Box<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            next_increment: Mutex::new(None),
            watch: Notify::new(),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Monotone, strictly increasing increment source. Cold start derives
    /// the counter from the highest committed increment.
    pub fn next_increment(&self) -> BackendResult<u64> {
        let mut cached = self.next_increment.lock().unwrap_or_else(|err| err.into_inner());
        let next = match *cached {
            Some(next) => next,
            None => self.backend.max_increment()?.map_or(1, |max| max + 1),
        };
        *cached = Some(next + 1);
        Ok(next)
    }

    /// Commits a prepared batch in order and wakes replication cursors.
    /// Each revision must already carry its increment. A failure partway
    /// through is fatal for the process; the caller does not retry.
    #[instrument(skip_all, fields(revisions = batch.len()))]
    pub fn commit_batch(&self, batch: &[Revision]) -> BackendResult<()> {
        for rev in batch {
            self.backend.put(rev)?;
        }
        if !batch.is_empty() {
            self.watch.notify_waiters();
        }
        Ok(())
    }

    /// A future that resolves at the next committed batch. Obtain it
    /// before scanning so a commit between scan and await is not missed.
    pub fn commit_watch(&self) -> tokio::sync::futures::Notified<'_> {
        self.watch.notified()
    }

    /// Most recent local-perspective revision with `lo` or `ack` set: the
    /// pointer from which source-collection-originated edits graft.
    pub fn last_acked_or_local(&self, id: &DocId) -> BackendResult<Option<Revision>> {
        let local = self.backend.history(id, &Perspective::local())?;
        Ok(local.into_iter().find(|rev| rev.lo || rev.ack))
    }

    /// Most recent revision of `(id, pe)`, optionally restricted by ack
    /// state. Used to find the most recent peer-bound revision.
    pub fn last_by_perspective(
        &self,
        id: &DocId,
        pe: &Perspective,
        ack_filter: Option<bool>,
    ) -> BackendResult<Option<Revision>> {
        let history = self.backend.history(id, pe)?;
        Ok(history
            .into_iter()
            .find(|rev| ack_filter.is_none_or(|ack| rev.ack == ack)))
    }

    /// Flips `ack` and records the source cursor on a committed revision.
    pub fn mark_acked(
        &self,
        id: &DocId,
        v: &Version,
        pe: &Perspective,
        op: u64,
    ) -> BackendResult<()> {
        self.backend.mark_acked(id, v, pe, op)
    }

    /// All committed revisions with increment above `from_exclusive`, in
    /// increasing increment order.
    pub fn scan_increments(&self, from_exclusive: u64) -> BackendResult<Vec<Revision>> {
        self.backend.scan_increments(from_exclusive)
    }

    pub fn contains_id(&self, id: &DocId) -> BackendResult<bool> {
        self.backend.contains_id(id)
    }

    pub fn len(&self) -> BackendResult<usize> {
        self.backend.len()
    }

    pub fn is_empty(&self) -> BackendResult<bool> {
        self.backend.is_empty()
    }

    /// A view that answers reads as if `pending` were already committed.
    /// Ingestion validates intra-batch parent references and computes
    /// ancestor searches through this.
    pub fn overlay<'a>(&'a self, pending: &'a [Revision]) -> Overlay<'a> {
        Overlay {
            store: self,
            pending,
        }
    }
}

impl DagView for Store {
    fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> BackendResult<Option<Revision>> {
        self.backend.get(id, v, pe)
    }

    fn history_from(
        &self,
        id: &DocId,
        pe: &Perspective,
        from: Option<&Version>,
    ) -> BackendResult<Vec<Revision>> {
        let mut history = self.backend.history(id, pe)?;
        if let Some(from) = from {
            let start = history
                .iter()
                .position(|rev| rev.v.as_ref() == Some(from))
                .unwrap_or(0);
            history.drain(..start);
        }
        Ok(history)
    }
}

/// [`Store`] plus a pending, not-yet-committed batch.
///
/// The pending slice is threaded through explicitly; nothing global is
/// mutated, so concurrent readers of the store never observe the overlay.
pub struct Overlay<'a> {
    store: &'a Store,
    pending: &'a [Revision],
}

impl DagView for Overlay<'_> {
    fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> BackendResult<Option<Revision>> {
        // Later pending entries win, mirroring commit order.
        let pending = self
            .pending
            .iter()
            .rev()
            .find(|rev| rev.id == *id && rev.v.as_ref() == Some(v) && rev.pe == *pe);
        if let Some(rev) = pending {
            return Ok(Some(rev.clone()));
        }
        self.store.get(id, v, pe)
    }

    fn history_from(
        &self,
        id: &DocId,
        pe: &Perspective,
        from: Option<&Version>,
    ) -> BackendResult<Vec<Revision>> {
        let mut history: Vec<Revision> = self
            .pending
            .iter()
            .rev()
            .filter(|rev| rev.id == *id && rev.pe == *pe)
            .cloned()
            .collect();
        history.extend(self.store.history_from(id, pe, None)?);
        if let Some(from) = from {
            let start = history
                .iter()
                .position(|rev| rev.v.as_ref() == Some(from))
                .unwrap_or(0);
            history.drain(..start);
        }
        Ok(history)
    }
}
