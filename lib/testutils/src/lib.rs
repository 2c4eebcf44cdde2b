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

//! Fixtures for seeding stores with hand-shaped revision DAGs.

use std::sync::Arc;

use peerdoc_lib::ids::DocId;
use peerdoc_lib::ids::Perspective;
use peerdoc_lib::ids::Version;
use peerdoc_lib::memory_backend::MemoryBackend;
use peerdoc_lib::revision::Body;
use peerdoc_lib::revision::Parents;
use peerdoc_lib::revision::Revision;
use peerdoc_lib::store::Store;
use serde_json::Value;

pub mod test_source;

pub fn new_store() -> Arc<Store> {
    Store::new(Box::new(MemoryBackend::new()))
}

/// Interprets a JSON literal as a document body.
pub fn body(value: Value) -> Body {
    match value {
        Value::Object(map) => map,
        _ => panic!("test body must be a JSON object"),
    }
}

/// A revision with explicit, readable versions, for seeding exact DAG
/// shapes. `parents` are version strings.
pub fn revision(id: &str, v: &str, parents: &[&str], pe: &Perspective, value: Value) -> Revision {
    let pa: Parents = parents
        .iter()
        .map(|p| Version::try_from_str(p).unwrap())
        .collect();
    Revision {
        id: DocId::from_str_key(id),
        v: Some(Version::try_from_str(v).unwrap()),
        pa,
        pe: pe.clone(),
        i: None,
        d: false,
        lo: false,
        ack: false,
        op: 0,
        body: body(value),
    }
}

/// Commits one revision directly, bypassing the ingestion gate. Panics on
/// store errors; tests seed known-good shapes.
pub fn commit(store: &Store, mut rev: Revision) -> Revision {
    rev.i = Some(store.next_increment().unwrap());
    store.commit_batch(std::slice::from_ref(&rev)).unwrap();
    rev
}

/// Commits a chain of revisions in order.
pub fn commit_all(store: &Store, revs: impl IntoIterator<Item = Revision>) -> Vec<Revision> {
    revs.into_iter().map(|rev| commit(store, rev)).collect()
}
