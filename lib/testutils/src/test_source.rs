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

//! An in-memory source collection implementing both adapter capabilities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use peerdoc_lib::bridge::ChangeEvent;
use peerdoc_lib::bridge::SourceDocument;
use peerdoc_lib::bridge::SourceFeed;
use peerdoc_lib::bridge::SourceMirror;
use peerdoc_lib::bridge::SourceResult;
use peerdoc_lib::ids::DocId;

/// A source collection held in memory: a document map, a scripted change
/// feed, and a log of every mirror write.
#[derive(Debug, Default)]
pub struct TestSource {
    docs: Mutex<BTreeMap<DocId, SourceDocument>>,
    events: Mutex<Vec<ChangeEvent>>,
    mirrored: Mutex<Vec<MirrorWrite>>,
}

/// One mirror operation the replica performed against the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorWrite {
    Upsert(SourceDocument),
    Remove(DocId),
}

impl TestSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Places a document in the collection without going through the feed.
    pub fn seed(&self, doc: SourceDocument) {
        self.docs
            .lock()
            .unwrap()
            .insert(doc.id.clone(), doc);
    }

    /// Appends an event the next `changes` stream will deliver.
    pub fn push_event(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn document(&self, id: &DocId) -> Option<SourceDocument> {
        self.docs.lock().unwrap().get(id).cloned()
    }

    /// Every mirror write in order.
    pub fn mirrored(&self) -> Vec<MirrorWrite> {
        self.mirrored.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceFeed for TestSource {
    async fn snapshot(&self) -> SourceResult<BoxStream<'static, SourceResult<SourceDocument>>> {
        let docs: Vec<_> = self.docs.lock().unwrap().values().cloned().collect();
        Ok(Box::pin(stream::iter(docs.into_iter().map(Ok))))
    }

    async fn changes(
        &self,
        from_cursor: u64,
    ) -> SourceResult<BoxStream<'static, SourceResult<ChangeEvent>>> {
        let events: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.cursor() > from_cursor)
            .cloned()
            .collect();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

#[async_trait]
impl SourceMirror for TestSource {
    async fn upsert(&self, doc: &SourceDocument) -> SourceResult<()> {
        self.docs
            .lock()
            .unwrap()
            .insert(doc.id.clone(), doc.clone());
        self.mirrored
            .lock()
            .unwrap()
            .push(MirrorWrite::Upsert(doc.clone()));
        Ok(())
    }

    async fn remove(&self, id: &DocId) -> SourceResult<()> {
        self.docs.lock().unwrap().remove(id);
        self.mirrored
            .lock()
            .unwrap()
            .push(MirrorWrite::Remove(id.clone()));
        Ok(())
    }
}
