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

//! The ingestion pipeline: turns batches of candidate revisions, from the
//! local change stream or from remote peers, into committed DAG nodes.
//!
//! A batch runs through a fixed gate; any failure aborts the whole batch
//! with no side effects. The pipeline is the single writer of the store:
//! it holds the write lock for the duration of one batch.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use itertools::Itertools as _;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::backend::BackendError;
use crate::bridge::SourceDocument;
use crate::bridge::SourceError;
use crate::bridge::SourceMirror;
use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::lca::LcaError;
use crate::reconcile::MergeError;
use crate::reconcile::reconcile;
use crate::revision::Revision;
use crate::revision::RevisionError;
use crate::settings::ReplicaSettings;
use crate::store::DagView as _;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid batch: {reason}")]
    InvalidBatch { reason: String },
    #[error("batch for perspective {expected} contains a revision of perspective {found}")]
    PerspectiveMismatch {
        expected: Perspective,
        found: Perspective,
    },
    #[error("batch does not leave exactly one head for {id}")]
    NotExactlyOneHead { id: DocId },
    #[error("new root for {id} rejected: a live head precedes it")]
    RootPreceded { id: DocId },
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("source collection unavailable")]
    Source(#[from] SourceError),
}

/// Where a batch came from. Source batches carry the local perspective;
/// remote batches carry the sending peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Source,
    Remote,
}

/// A batch of candidate revisions sharing one perspective, in parent-first
/// order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub pe: Perspective,
    pub origin: BatchOrigin,
    pub revisions: Vec<Revision>,
}

impl Batch {
    pub fn source(revisions: Vec<Revision>) -> Self {
        Self {
            pe: Perspective::local(),
            origin: BatchOrigin::Source,
            revisions,
        }
    }

    pub fn remote(pe: Perspective, revisions: Vec<Revision>) -> Self {
        Self {
            pe,
            origin: BatchOrigin::Remote,
            revisions,
        }
    }
}

/// What one successful batch left behind.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    /// Every revision committed, in commit order.
    pub committed: Vec<Revision>,
    /// The new local-perspective head of each touched document.
    pub new_local_heads: Vec<Revision>,
}

/// The single-writer ingestion pipeline over one collection's store.
pub struct IngestPipeline {
    store: Arc<Store>,
    mirror: Option<Arc<dyn SourceMirror>>,
    proceed_on_error: bool,
    /// Held for the whole gate of one batch. The increment cache is only
    /// advanced under this lock.
    write_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<Store>,
        mirror: Option<Arc<dyn SourceMirror>>,
        settings: &ReplicaSettings,
    ) -> Self {
        Self {
            store,
            mirror,
            proceed_on_error: settings.proceed_on_error,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runs a batch through the gate and commits it. On any error before
    /// the commit step the store is untouched.
    #[instrument(skip_all, fields(pe = %batch.pe, revisions = batch.revisions.len()))]
    pub async fn ingest(&self, batch: Batch) -> Result<IngestReceipt, IngestError> {
        let _guard = self.write_lock.lock().await;

        // Step 1: perspective uniformity, per-revision validation, and
        // normalization of commit-time state.
        let mut incoming = batch.revisions;
        for rev in &mut incoming {
            rev.validate()?;
            if rev.pe != batch.pe {
                return Err(IngestError::PerspectiveMismatch {
                    expected: batch.pe.clone(),
                    found: rev.pe.clone(),
                });
            }
            if rev.is_virtual() {
                return Err(IngestError::InvalidBatch {
                    reason: format!("virtual revision of {} in batch", rev.id),
                });
            }
            rev.i = None;
            if batch.origin == BatchOrigin::Remote {
                rev.lo = false;
                rev.ack = false;
                rev.op = 0;
            }
        }

        // Step 2: single new head per id, and root admission.
        self.check_heads(&batch.pe, &incoming)?;

        // Steps 3 and 4: parent coverage and version uniqueness, validated
        // through the overlay so intra-batch references resolve.
        let mut pending: Vec<Revision> = Vec::new();
        for rev in incoming {
            let overlay = self.store.overlay(&pending);
            let v = rev.version()?;
            if overlay.get(&rev.id, v, &rev.pe)?.is_some() {
                return Err(BackendError::VersionExists {
                    id: rev.id.clone(),
                    version: v.clone(),
                    perspective: rev.pe.clone(),
                }
                .into());
            }
            for parent in &rev.pa {
                if overlay.get(&rev.id, parent, &rev.pe)?.is_none() {
                    return Err(BackendError::ParentMissing {
                        id: rev.id.clone(),
                        parent: parent.clone(),
                        perspective: rev.pe.clone(),
                    }
                    .into());
                }
            }
            pending.push(rev);
        }
        let batch_len = pending.len();

        // Step 5: every remote revision gets a local-perspective copy, so
        // the local tree can merge it and replication can carry it.
        if !batch.pe.is_local() {
            self.materialize_local(&mut pending, batch_len)?;
        }

        // Step 6: merge each new head with a distinct live local head.
        self.merge_local_heads(&mut pending)?;

        // Step 7: increments, in commit order, never reused.
        for rev in &mut pending {
            rev.i = Some(self.store.next_increment()?);
        }

        // Step 8: commit. Failures here are fatal; no rollback exists.
        self.store.commit_batch(&pending)?;
        info!(committed = pending.len(), "batch committed");

        // Step 9: mirror new local heads back into the source collection.
        let new_local_heads = self.new_local_heads(&pending)?;
        if let Some(mirror) = &self.mirror {
            for head in &new_local_heads {
                if head.lo {
                    continue;
                }
                if head.d {
                    mirror.remove(&head.id).await?;
                } else {
                    mirror
                        .upsert(&SourceDocument {
                            id: head.id.clone(),
                            version: head.v.clone(),
                            body: head.body.clone(),
                        })
                        .await?;
                }
            }
        }

        Ok(IngestReceipt {
            committed: pending,
            new_local_heads,
        })
    }

    /// Step 2: within the batch each document's sub-DAG must end in at
    /// most one live leaf, and a parentless revision is only admitted when
    /// no live head precedes it.
    fn check_heads(&self, pe: &Perspective, incoming: &[Revision]) -> Result<(), IngestError> {
        let by_id: HashMap<&DocId, Vec<&Revision>> =
            incoming.iter().map(|rev| (&rev.id, rev)).into_group_map();
        for (id, revs) in by_id {
            let referenced: HashSet<&Version> =
                revs.iter().flat_map(|rev| rev.pa.iter()).collect();
            let live_leaves = revs
                .iter()
                .filter(|rev| rev.v.as_ref().is_some_and(|v| !referenced.contains(v)))
                .filter(|rev| !rev.d)
                .count();
            if live_leaves > 1 {
                return Err(IngestError::NotExactlyOneHead { id: id.clone() });
            }
            for rev in &revs {
                // Replayed revisions fall through to the version-uniqueness
                // check instead of tripping root admission.
                let known = match &rev.v {
                    Some(v) => self.store.get(id, v, pe)?.is_some(),
                    None => false,
                };
                if rev.is_root() && !known {
                    let heads = self.store.heads(id, pe, true)?;
                    if heads.iter().any(|head| !head.d) {
                        return Err(IngestError::RootPreceded { id: id.clone() });
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 5: walk the remote revisions in batch order and append the
    /// local-perspective copy of each, unless one already exists or the
    /// version is already an ancestor of the local head.
    fn materialize_local(
        &self,
        pending: &mut Vec<Revision>,
        batch_len: usize,
    ) -> Result<(), IngestError> {
        let local = Perspective::local();
        for n in 0..batch_len {
            let rev = pending[n].clone();
            let v = rev.version()?.clone();
            let overlay = self.store.overlay(pending);
            if overlay.get(&rev.id, &v, &local)?.is_some() {
                continue;
            }
            let live = overlay.heads(&rev.id, &local, false)?;
            let head = match live.first() {
                Some(head) => Some(head.clone()),
                None => overlay.heads(&rev.id, &local, true)?.first().cloned(),
            };
            let Some(head) = head else {
                // No local history at all for this document.
                pending.push(rev.to_perspective(local.clone()));
                continue;
            };
            if head.d && rev.is_root() {
                // Re-insert after a tombstone that the remote never saw:
                // clone without merging.
                pending.push(rev.to_perspective(local.clone()));
                continue;
            }
            let head_v = head.version()?;
            if overlay.is_ancestor(&rev.id, &local, &v, head_v)? {
                continue;
            }
            match reconcile(&head, &rev, &overlay, &overlay) {
                Ok(out) if out.lcas.len() > 1 => {
                    let err = MergeError::MultipleLcas { id: rev.id.clone() };
                    if self.proceed_on_error {
                        warn!(id = %rev.id, %err, "skipping local copy");
                        continue;
                    }
                    return Err(err.into());
                }
                Ok(out) if out.is_fast_forward() && out.merged_x.v.as_ref() == Some(&v) => {
                    // The remote revision descends from the local head:
                    // commit the recreated local-perspective copy.
                    pending.push(out.merged_x);
                }
                Ok(out) if out.is_fast_forward() => {
                    // Fast-forward the other way: the local head already
                    // subsumes this revision.
                    continue;
                }
                Ok(_) => {
                    // Divergent histories: the copy lands as a second local
                    // head and step 6 merges it.
                    pending.push(rev.to_perspective(local.clone()));
                }
                Err(MergeError::MergeConflict { .. }) => {
                    // Divergent and conflicting. The copy still
                    // materializes; whether the conflict aborts the batch
                    // is the head-merge step's decision.
                    pending.push(rev.to_perspective(local.clone()));
                }
                Err(err @ MergeError::Lca(LcaError::NoLca { .. })) => {
                    if self.proceed_on_error {
                        warn!(id = %rev.id, %err, "skipping local copy");
                        continue;
                    }
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Step 6: while a document has two live local heads, reconcile the
    /// older with the newer; a genuine merge gets a fresh version.
    fn merge_local_heads(&self, pending: &mut Vec<Revision>) -> Result<(), IngestError> {
        let local = Perspective::local();
        let ids: Vec<DocId> = pending.iter().map(|rev| rev.id.clone()).unique().collect();
        for id in ids {
            loop {
                let overlay = self.store.overlay(pending);
                let live = overlay.heads(&id, &local, false)?;
                if live.len() <= 1 {
                    break;
                }
                // heads() yields newest first; the oldest head leads.
                let newer = live.first().expect("two heads present").clone();
                let older = live.last().expect("two heads present").clone();
                match reconcile(&older, &newer, &overlay, &overlay) {
                    Ok(out) if out.is_fast_forward() => break,
                    Ok(out) => {
                        let mut merged = out.merged_x;
                        merged.v = Some(Version::generate());
                        merged.ack = false;
                        merged.lo = false;
                        pending.push(merged);
                    }
                    Err(err @ MergeError::MergeConflict { .. }) => {
                        if self.proceed_on_error {
                            warn!(%id, %err, "leaving divergent heads unmerged");
                            break;
                        }
                        return Err(err.into());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// The newest local head of every document this batch touched, for
    /// receipts and source mirroring.
    fn new_local_heads(&self, committed: &[Revision]) -> Result<Vec<Revision>, IngestError> {
        let local = Perspective::local();
        let committed_keys: HashSet<(&DocId, &Version)> = committed
            .iter()
            .filter(|rev| rev.pe.is_local())
            .filter_map(|rev| rev.v.as_ref().map(|v| (&rev.id, v)))
            .collect();
        let ids: Vec<DocId> = committed.iter().map(|rev| rev.id.clone()).unique().collect();
        let mut heads = Vec::new();
        for id in &ids {
            let all = self.store.heads(id, &local, true)?;
            if let Some(head) = all.first()
                && let Some(v) = &head.v
                && committed_keys.contains(&(id, v))
            {
                heads.push(head.clone());
            }
        }
        Ok(heads)
    }
}

/// One bounded revision queue. Producers sleep and retry when the queue is
/// at capacity; nothing is ever rejected outright.
#[derive(Debug)]
pub struct RevisionQueue {
    pe: Perspective,
    origin: BatchOrigin,
    capacity: usize,
    retry_interval: Duration,
    items: StdMutex<VecDeque<Revision>>,
    wakeup: Arc<Notify>,
}

impl RevisionQueue {
    fn new(
        pe: Perspective,
        origin: BatchOrigin,
        settings: &ReplicaSettings,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            pe,
            origin,
            capacity: settings.queue_capacity,
            retry_interval: settings.retry_interval(),
            items: StdMutex::new(VecDeque::new()),
            wakeup,
        }
    }

    /// Enqueues one revision, applying back-pressure by sleeping while the
    /// queue is full.
    pub async fn push(&self, rev: Revision) {
        loop {
            {
                let mut items = self.items.lock().unwrap_or_else(|err| err.into_inner());
                if items.len() < self.capacity {
                    items.push_back(rev);
                    break;
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        self.wakeup.notify_one();
    }

    /// Takes up to `limit` queued revisions as one batch.
    fn take_batch(&self, limit: usize) -> Option<Batch> {
        let mut items = self.items.lock().unwrap_or_else(|err| err.into_inner());
        if items.is_empty() {
            return None;
        }
        let take = limit.min(items.len());
        let revisions: Vec<Revision> = items.drain(..take).collect();
        Some(Batch {
            pe: self.pe.clone(),
            origin: self.origin,
            revisions,
        })
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The periodic drain: one queue per remote peer plus one for source-local
/// events, assembled into batches and run through the pipeline one at a
/// time. A wakeup that arrives mid-run is deferred, never stacked.
pub struct AutoProcessor {
    pipeline: Arc<IngestPipeline>,
    batch_limit: usize,
    wakeup: Arc<Notify>,
    source_queue: Arc<RevisionQueue>,
    remote_queues: StdMutex<HashMap<Perspective, Arc<RevisionQueue>>>,
    settings: ReplicaSettings,
}

impl AutoProcessor {
    pub fn new(pipeline: Arc<IngestPipeline>, settings: &ReplicaSettings) -> Arc<Self> {
        let wakeup = Arc::new(Notify::new());
        let source_queue = Arc::new(RevisionQueue::new(
            Perspective::local(),
            BatchOrigin::Source,
            settings,
            wakeup.clone(),
        ));
        Arc::new(Self {
            pipeline,
            batch_limit: settings.batch_limit,
            wakeup,
            source_queue,
            remote_queues: StdMutex::new(HashMap::new()),
            settings: settings.clone(),
        })
    }

    /// The queue for source-local change events.
    pub fn source_queue(&self) -> Arc<RevisionQueue> {
        self.source_queue.clone()
    }

    /// The queue for a remote peer, created on first use.
    pub fn remote_queue(&self, pe: &Perspective) -> Arc<RevisionQueue> {
        assert!(!pe.is_local(), "remote queue requires a remote perspective");
        let mut queues = self
            .remote_queues
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        queues
            .entry(pe.clone())
            .or_insert_with(|| {
                Arc::new(RevisionQueue::new(
                    pe.clone(),
                    BatchOrigin::Remote,
                    &self.settings,
                    self.wakeup.clone(),
                ))
            })
            .clone()
    }

    /// Drains every queue once. Batch failures abort that batch and are
    /// logged; the drain moves on.
    pub async fn drain_once(&self) {
        let mut queues: Vec<Arc<RevisionQueue>> = vec![self.source_queue.clone()];
        {
            let remotes = self
                .remote_queues
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            queues.extend(remotes.values().cloned());
        }
        for queue in queues {
            while let Some(batch) = queue.take_batch(self.batch_limit) {
                if let Err(err) = self.pipeline.ingest(batch).await {
                    error!(pe = %queue.pe, %err, "batch aborted");
                }
            }
        }
    }

    /// Spawns the drain loop. The loop parks on the wakeup notifier
    /// between runs; concurrent wakeups coalesce into one deferred run.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.drain_once().await;
                this.wakeup.notified().await;
            }
        })
    }
}
