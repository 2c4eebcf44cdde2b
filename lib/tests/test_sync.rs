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

//! Two replicas exchanging revisions over the wire shape until their
//! histories converge.

use std::sync::Arc;
use std::time::Duration;

use peerdoc_lib::ids::DocId;
use peerdoc_lib::ids::Perspective;
use peerdoc_lib::ids::Version;
use peerdoc_lib::ingest::AutoProcessor;
use peerdoc_lib::ingest::IngestPipeline;
use peerdoc_lib::replicate::ReplicationCursor;
use peerdoc_lib::revision::Revision;
use peerdoc_lib::settings::ReplicaSettings;
use peerdoc_lib::store::DagView as _;
use peerdoc_lib::store::Store;
use peerdoc_lib::wire::decode_frame;
use peerdoc_lib::wire::encode_frame;
use serde_json::Value;
use serde_json::json;
use testutils::body;
use testutils::new_store;
use testutils::revision;
use tokio::time::timeout;

struct Peer {
    name: &'static str,
    store: Arc<Store>,
    processor: Arc<AutoProcessor>,
}

fn peer(name: &'static str) -> Peer {
    let settings = ReplicaSettings::default();
    let store = new_store();
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), None, &settings));
    let processor = AutoProcessor::new(pipeline, &settings);
    Peer {
        name,
        store,
        processor,
    }
}

impl Peer {
    /// Applies one local edit, the way a drained source batch would.
    async fn edit(&self, id: &str, v: &str, parents: &[&str], value: Value) {
        let mut rev = revision(id, v, parents, &Perspective::local(), value);
        rev.lo = true;
        let queue = self.processor.source_queue();
        queue.push(rev).await;
        self.processor.drain_once().await;
    }

    fn head(&self, id: &str) -> Revision {
        self.store
            .heads(&DocId::from_str_key(id), &Perspective::local(), true)
            .unwrap()
            .first()
            .cloned()
            .unwrap()
    }
}

/// Ships everything committed on `from` after `offset` to `to`, through
/// encoded frames, and drains it there. Returns the new resume offset.
async fn replicate(from: &Peer, to: &Peer, offset: Option<Version>) -> Option<Version> {
    let mut cursor = ReplicationCursor::open(from.store.clone(), offset.clone(), None, vec![])
        .unwrap();
    let identity = Perspective::remote(from.name);
    let queue = to.processor.remote_queue(&identity);
    let mut last = offset;
    while let Ok(rev) = timeout(Duration::from_millis(50), cursor.next()).await {
        let rev = rev.unwrap();
        let frame = encode_frame(&rev).unwrap();
        let (decoded, consumed) = decode_frame(&frame, &identity).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        last = decoded.v.clone();
        queue.push(decoded).await;
    }
    to.processor.drain_once().await;
    last
}

#[tokio::test]
async fn test_edit_flows_to_the_other_peer() {
    let alpha = peer("alpha");
    let beta = peer("beta");

    alpha.edit("x", "vA00", &[], json!({"title": "draft"})).await;
    alpha
        .edit("x", "vB00", &["vA00"], json!({"title": "final"}))
        .await;
    replicate(&alpha, &beta, None).await;

    let head = beta.head("x");
    assert_eq!(head.v, Some(Version::from_static("vB00")));
    assert_eq!(head.body, body(json!({"title": "final"})));
    // Received, not locally originated.
    assert!(!head.lo);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let alpha = peer("alpha");
    let beta = peer("beta");

    // A shared root, then an edit on each side while disconnected.
    alpha.edit("x", "vA00", &[], json!({})).await;
    let a_to_b = replicate(&alpha, &beta, None).await;
    let b_to_a = replicate(&beta, &alpha, None).await;

    alpha.edit("x", "vB00", &["vA00"], json!({"foo": 2})).await;
    beta.edit("x", "vD00", &["vA00"], json!({"bar": 5})).await;

    // One full exchange: beta merges alpha's edit, alpha fast-forwards
    // onto beta's merge, and a final pass brings beta up to date.
    let a_to_b = replicate(&alpha, &beta, a_to_b).await;
    let b_to_a = replicate(&beta, &alpha, b_to_a).await;
    let a_to_b = replicate(&alpha, &beta, a_to_b).await;

    let merged = body(json!({"foo": 2, "bar": 5}));
    let alpha_head = alpha.head("x");
    let beta_head = beta.head("x");
    assert_eq!(alpha_head.body, merged);
    assert_eq!(beta_head.body, merged);
    assert_eq!(alpha_head.v, beta_head.v);
    assert_eq!(alpha_head.pa, beta_head.pa);

    // Quiescence: nothing further to exchange produces new revisions.
    let alpha_len = alpha.store.len().unwrap();
    let beta_len = beta.store.len().unwrap();
    let a_to_b = replicate(&alpha, &beta, a_to_b).await;
    let b_to_a = replicate(&beta, &alpha, b_to_a).await;
    assert_eq!(alpha.store.len().unwrap(), alpha_len);
    assert_eq!(beta.store.len().unwrap(), beta_len);
    let _ = (a_to_b, b_to_a);
}

#[tokio::test]
async fn test_deletion_propagates() {
    let alpha = peer("alpha");
    let beta = peer("beta");

    alpha.edit("x", "vA00", &[], json!({"n": 1})).await;
    let a_to_b = replicate(&alpha, &beta, None).await;

    let mut tomb = revision("x", "vT00", &["vA00"], &Perspective::local(), json!({"n": 1}));
    tomb.d = true;
    tomb.lo = true;
    alpha.processor.source_queue().push(tomb).await;
    alpha.processor.drain_once().await;

    replicate(&alpha, &beta, a_to_b).await;

    let head = beta.head("x");
    assert!(head.d);
    assert_eq!(head.v, Some(Version::from_static("vT00")));
    // The tombstone still carries the last known fields.
    assert_eq!(head.body, body(json!({"n": 1})));
}
