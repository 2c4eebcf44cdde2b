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

//! The replication cursor: tails the local DAG from an offset and emits a
//! filtered, connected sub-DAG to one subscriber.
//!
//! When the filter excludes a revision, later descendants that pass the
//! filter list the nearest included ancestor on each branch as their
//! parent; the emitted copy is rewritten, the stored revision is not. Each
//! emitted revision then runs through a chain of asynchronous hooks that
//! may transform or silently suppress it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use futures::stream;
use thiserror::Error;
use tracing::debug;

use crate::backend::BackendError;
use crate::ids::DocId;
use crate::ids::Version;
use crate::revision::Parents;
use crate::revision::Revision;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ReplicateError {
    /// The offset version was not found within the DAG's current size.
    #[error("replication offset {offset} not found")]
    OffsetNotFound { offset: Version },
    #[error("replication hook failed")]
    Hook(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-revision transformation applied before a revision goes out. A hook
/// may rewrite the revision or suppress it by returning `None`; suppression
/// is silent and does not terminate the stream.
#[async_trait]
pub trait ReplicationHook: Send + Sync {
    async fn transform(
        &self,
        rev: Revision,
    ) -> Result<Option<Revision>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Predicate deciding which local revisions a subscriber receives.
pub type RevisionFilter = Box<dyn Fn(&Revision) -> bool + Send + Sync>;

/// A cursor over the local perspective, in increment order. Blocks waiting
/// for new data once caught up; dropping the cursor tears the stream down,
/// after any in-flight hook invocation finishes.
pub struct ReplicationCursor {
    store: Arc<Store>,
    filter: Option<RevisionFilter>,
    hooks: Vec<Arc<dyn ReplicationHook>>,
    /// Increment of the last scanned revision, emitted or not.
    position: u64,
    /// Excluded version → the nearest included ancestors on each branch,
    /// already transitively resolved.
    reparent: HashMap<(DocId, Version), Parents>,
}

impl std::fmt::Debug for ReplicationCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCursor")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl ReplicationCursor {
    /// Opens a cursor after `offset` (`None` replays from the start).
    /// Locating the offset scans at most the DAG's current size; an
    /// unknown offset is [`ReplicateError::OffsetNotFound`].
    pub fn open(
        store: Arc<Store>,
        offset: Option<Version>,
        filter: Option<RevisionFilter>,
        hooks: Vec<Arc<dyn ReplicationHook>>,
    ) -> Result<Self, ReplicateError> {
        let mut cursor = Self {
            store,
            filter,
            hooks,
            position: 0,
            reparent: HashMap::new(),
        };
        let Some(offset) = offset else {
            return Ok(cursor);
        };
        // Walk the committed prefix up to the offset, seeding the reparent
        // map so exclusions before the offset still reconnect descendants
        // emitted after it.
        let mut found = false;
        for rev in cursor.store.scan_increments(0)? {
            let i = rev.i.ok_or(BackendError::IncrementUnassigned {
                id: rev.id.clone(),
            })?;
            cursor.position = i;
            if rev.pe.is_local() {
                cursor.note_excluded_if_filtered(&rev);
            }
            if rev.pe.is_local() && rev.v.as_ref() == Some(&offset) {
                found = true;
                break;
            }
        }
        if !found {
            return Err(ReplicateError::OffsetNotFound { offset });
        }
        debug!(position = cursor.position, "cursor opened");
        Ok(cursor)
    }

    /// The next replicated revision. Waits for a commit when caught up.
    pub async fn next(&mut self) -> Result<Revision, ReplicateError> {
        loop {
            let store = self.store.clone();
            let watch = store.commit_watch();
            let rows = store.scan_increments(self.position)?;
            let mut emitted = None;
            for rev in rows {
                self.position = rev.i.ok_or(BackendError::IncrementUnassigned {
                    id: rev.id.clone(),
                })?;
                if !rev.pe.is_local() {
                    continue;
                }
                if self.note_excluded_if_filtered(&rev) {
                    continue;
                }
                let mut out = rev.clone();
                out.pa = self.rewritten_parents(&rev);
                match self.apply_hooks(out).await? {
                    Some(out) => {
                        emitted = Some(out);
                        break;
                    }
                    // A suppressing hook yields silently.
                    None => continue,
                }
            }
            if let Some(out) = emitted {
                return Ok(out);
            }
            watch.await;
        }
    }

    /// Turns the cursor into an endless stream of replicated revisions.
    pub fn into_stream(self) -> impl Stream<Item = Result<Revision, ReplicateError>> {
        stream::unfold(self, |mut cursor| async move {
            let item = cursor.next().await;
            Some((item, cursor))
        })
    }

    /// Applies the filter bookkeeping; returns whether `rev` is excluded.
    fn note_excluded_if_filtered(&mut self, rev: &Revision) -> bool {
        let Some(filter) = &self.filter else {
            return false;
        };
        if filter(rev) {
            return false;
        }
        if let Some(v) = &rev.v {
            let mapped = self.rewritten_parents(rev);
            self.reparent.insert((rev.id.clone(), v.clone()), mapped);
        }
        true
    }

    /// The parents of `rev` with every excluded version replaced by its
    /// nearest included ancestors.
    fn rewritten_parents(&self, rev: &Revision) -> Parents {
        let mut out = Parents::new();
        for parent in &rev.pa {
            match self.reparent.get(&(rev.id.clone(), parent.clone())) {
                Some(ancestors) => {
                    for ancestor in ancestors {
                        if !out.contains(ancestor) {
                            out.push(ancestor.clone());
                        }
                    }
                }
                None => out.push(parent.clone()),
            }
        }
        out
    }

    async fn apply_hooks(&self, rev: Revision) -> Result<Option<Revision>, ReplicateError> {
        let mut current = rev;
        for hook in &self.hooks {
            match hook.transform(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(None),
                Err(err) => return Err(ReplicateError::Hook(err)),
            }
        }
        Ok(Some(current))
    }
}
