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

//! The change bridge: adapts a source collection's change feed and
//! snapshot into ingestion input, and mirrors committed local heads back.
//!
//! The source adapter is split into two capabilities: the feed the bridge
//! consumes, and the mirror the ingestion pipeline writes through. One
//! adapter object usually implements both.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use smallvec::smallvec;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::backend::BackendError;
use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::ingest::RevisionQueue;
use crate::revision::Body;
use crate::revision::Parents;
use crate::revision::Revision;
use crate::revision::RevisionError;
use crate::store::DagView as _;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source collection unavailable")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("change event for unknown document {id}")]
    UnknownDocument { id: DocId },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Revision(#[from] RevisionError),
}

/// A document as the source collection holds it: the payload plus the
/// version field the replica maintains in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub id: DocId,
    pub version: Option<Version>,
    pub body: Body,
}

/// A partial update: field assignments and removals applied to the
/// previous state of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifier {
    pub set: Body,
    pub unset: Vec<String>,
}

impl Modifier {
    /// Applies this modifier to a scratch copy of `base`.
    pub fn apply(&self, base: &Body) -> Body {
        let mut body = base.clone();
        for (name, value) in &self.set {
            body.insert(name.clone(), value.clone());
        }
        for name in &self.unset {
            body.remove(name);
        }
        body
    }
}

/// One entry of the source change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert {
        id: DocId,
        body: Body,
        version: Option<Version>,
        cursor: u64,
    },
    UpdateFull {
        id: DocId,
        body: Body,
        version: Option<Version>,
        cursor: u64,
    },
    UpdateModifier {
        id: DocId,
        modifier: Modifier,
        version: Option<Version>,
        cursor: u64,
    },
    Delete {
        id: DocId,
        cursor: u64,
    },
}

impl ChangeEvent {
    pub fn cursor(&self) -> u64 {
        match self {
            Self::Insert { cursor, .. }
            | Self::UpdateFull { cursor, .. }
            | Self::UpdateModifier { cursor, .. }
            | Self::Delete { cursor, .. } => *cursor,
        }
    }
}

/// The read side of a source collection: a full snapshot and a change feed
/// resumable from an opaque cursor.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    async fn snapshot(&self) -> SourceResult<BoxStream<'static, SourceResult<SourceDocument>>>;

    async fn changes(
        &self,
        from_cursor: u64,
    ) -> SourceResult<BoxStream<'static, SourceResult<ChangeEvent>>>;
}

/// The write side of a source collection, used to mirror committed local
/// heads.
#[async_trait]
pub trait SourceMirror: Send + Sync {
    async fn upsert(&self, doc: &SourceDocument) -> SourceResult<()>;

    async fn remove(&self, id: &DocId) -> SourceResult<()>;
}

/// Translates source-collection activity into local-perspective revisions
/// and feeds them to the ingestion queue.
pub struct ChangeBridge {
    store: Arc<Store>,
    feed: Arc<dyn SourceFeed>,
    queue: Arc<RevisionQueue>,
    /// Heads created by this bridge that may not have been drained yet,
    /// so consecutive feed events chain instead of forking.
    queued_heads: StdMutex<HashMap<DocId, (Version, Body)>>,
}

impl ChangeBridge {
    pub fn new(store: Arc<Store>, feed: Arc<dyn SourceFeed>, queue: Arc<RevisionQueue>) -> Self {
        Self {
            store,
            feed,
            queue,
            queued_heads: StdMutex::new(HashMap::new()),
        }
    }

    /// Walks the source collection and injects every document the DAG does
    /// not know yet. Run once at startup, before tailing the feed.
    #[instrument(skip_all)]
    pub async fn backfill(&self) -> Result<usize, BridgeError> {
        let mut docs = self.feed.snapshot().await?;
        let mut injected = 0;
        while let Some(doc) = docs.next().await {
            let doc = doc?;
            if let Some(version) = &doc.version
                && self
                    .store
                    .get(&doc.id, version, &Perspective::local())?
                    .is_some()
            {
                continue;
            }
            let head = self.store.last_acked_or_local(&doc.id)?;
            let pa: Parents = match &head {
                Some(head) => smallvec![head.version()?.clone()],
                None => Parents::new(),
            };
            let mut rev = Revision::new(doc.id.clone(), Perspective::local(), pa, doc.body);
            if let Some(version) = doc.version {
                rev.v = Some(version);
            }
            rev.lo = true;
            self.remember_queued(&rev);
            self.queue.push(rev).await;
            injected += 1;
        }
        info!(injected, "source backfill complete");
        Ok(injected)
    }

    /// Tails the change feed from where the DAG left off, translating each
    /// event. Runs until the feed ends.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let from = self.resume_cursor()?;
        debug!(from, "tailing source changes");
        let mut changes = self.feed.changes(from).await?;
        while let Some(event) = changes.next().await {
            if let Some(rev) = self.translate(event?)? {
                self.queue.push(rev).await;
            }
        }
        Ok(())
    }

    /// The highest source cursor any committed local revision was observed
    /// at; the feed resumes from there.
    pub fn resume_cursor(&self) -> Result<u64, BridgeError> {
        let mut max = 0;
        for rev in self.store.scan_increments(0)? {
            if rev.pe.is_local() {
                max = max.max(rev.op);
            }
        }
        Ok(max)
    }

    /// Translates one change event into a revision to ingest, or `None`
    /// when the event only confirms an already known head. A produced
    /// revision becomes the graft point for subsequent events of the same
    /// document, even before it drains.
    pub fn translate(&self, event: ChangeEvent) -> Result<Option<Revision>, BridgeError> {
        let produced = self.translate_event(event)?;
        if let Some(rev) = &produced {
            self.remember_queued(rev);
        }
        Ok(produced)
    }

    fn translate_event(&self, event: ChangeEvent) -> Result<Option<Revision>, BridgeError> {
        match event {
            ChangeEvent::Insert {
                id,
                body,
                version,
                cursor,
            }
            | ChangeEvent::UpdateFull {
                id,
                body,
                version,
                cursor,
            } => {
                // A full document whose version already matches the head
                // is our own write coming back: close the loop. Only a
                // committed head can be acked; an echo of a still-queued
                // head is dropped and acks once it drains and echoes again.
                if let Some(version) = &version {
                    if self
                        .queued_head(&id)
                        .is_some_and(|(queued_v, _)| queued_v == *version)
                    {
                        return Ok(None);
                    }
                    let heads = self.store.heads(&id, &Perspective::local(), true)?;
                    if heads.first().and_then(|head| head.v.as_ref()) == Some(version) {
                        self.store
                            .mark_acked(&id, version, &Perspective::local(), cursor)?;
                        return Ok(None);
                    }
                }
                let pa = self.graft_point(&id)?;
                let mut rev = Revision::new(id, Perspective::local(), pa, body);
                rev.lo = true;
                rev.ack = true;
                rev.op = cursor;
                Ok(Some(rev))
            }
            ChangeEvent::UpdateModifier {
                id,
                modifier,
                version: _,
                cursor,
            } => {
                let Some((_, base)) = self.current_head(&id)? else {
                    return Err(BridgeError::UnknownDocument { id });
                };
                let body = modifier.apply(&base);
                let pa = self.graft_point(&id)?;
                let mut rev = Revision::new(id, Perspective::local(), pa, body);
                rev.lo = true;
                rev.ack = true;
                rev.op = cursor;
                Ok(Some(rev))
            }
            ChangeEvent::Delete { id, cursor } => {
                let Some((_, last_body)) = self.current_head(&id)? else {
                    // Deleting a document the DAG never saw; nothing to
                    // record.
                    return Ok(None);
                };
                let pa = self.graft_point(&id)?;
                let mut rev = Revision::new(id, Perspective::local(), pa, last_body);
                rev.d = true;
                rev.lo = true;
                rev.ack = true;
                rev.op = cursor;
                Ok(Some(rev))
            }
        }
    }

    /// The parent the next source-originated revision grafts onto: the
    /// newest queued-but-undrained head, else the most recent acked or
    /// locally-originated committed revision. A tombstone head is linked
    /// as the single parent of the re-inserted root.
    fn graft_point(&self, id: &DocId) -> Result<Parents, BridgeError> {
        if let Some((version, _)) = self.queued_head(id) {
            return Ok(smallvec![version]);
        }
        match self.store.last_acked_or_local(id)? {
            Some(head) => Ok(smallvec![head.version()?.clone()]),
            None => Ok(Parents::new()),
        }
    }

    /// The newest head as the bridge sees it: a queued-but-undrained head
    /// wins over the committed one.
    fn current_head(&self, id: &DocId) -> Result<Option<(Version, Body)>, BridgeError> {
        if let Some(entry) = self.queued_head(id) {
            return Ok(Some(entry));
        }
        let heads = self.store.heads(id, &Perspective::local(), true)?;
        match heads.first() {
            Some(head) => Ok(Some((head.version()?.clone(), head.body.clone()))),
            None => Ok(None),
        }
    }

    fn queued_head(&self, id: &DocId) -> Option<(Version, Body)> {
        self.queued_heads
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(id)
            .cloned()
    }

    fn remember_queued(&self, rev: &Revision) {
        if let Some(v) = &rev.v {
            self.queued_heads
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .insert(rev.id.clone(), (v.clone(), rev.body.clone()));
        }
    }
}
