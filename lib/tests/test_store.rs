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

use assert_matches::assert_matches;
use peerdoc_lib::backend::Backend as _;
use peerdoc_lib::backend::BackendError;
use peerdoc_lib::ids::DocId;
use peerdoc_lib::ids::Perspective;
use peerdoc_lib::ids::Version;
use peerdoc_lib::store::DagView as _;
use serde_json::json;
use testutils::body;
use testutils::commit;
use testutils::new_store;
use testutils::revision;

#[test]
fn test_put_and_get() {
    let store = new_store();
    let local = Perspective::local();
    let rev = commit(&store, revision("x", "vA00", &[], &local, json!({"n": 1})));

    let found = store
        .get(&DocId::from_str_key("x"), rev.v.as_ref().unwrap(), &local)
        .unwrap()
        .unwrap();
    assert_eq!(found.body, body(json!({"n": 1})));
    assert_eq!(found.i, Some(1));

    assert!(
        store
            .get(
                &DocId::from_str_key("x"),
                &Version::from_static("zzzz"),
                &local
            )
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_duplicate_version_rejected() {
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));

    let mut dup = revision("x", "vA00", &[], &local, json!({}));
    dup.i = Some(store.next_increment().unwrap());
    assert_matches!(
        store.commit_batch(std::slice::from_ref(&dup)),
        Err(BackendError::VersionExists { .. })
    );
}

#[test]
fn test_missing_parent_rejected() {
    let store = new_store();
    let local = Perspective::local();
    let mut orphan = revision("x", "vB00", &["vA00"], &local, json!({}));
    orphan.i = Some(store.next_increment().unwrap());
    assert_matches!(
        store.commit_batch(std::slice::from_ref(&orphan)),
        Err(BackendError::ParentMissing { .. })
    );
}

#[test]
fn test_parent_scoped_to_perspective() {
    // A parent present under another perspective does not satisfy the
    // same-perspective requirement.
    let store = new_store();
    commit(
        &store,
        revision("x", "vA00", &[], &Perspective::remote("p"), json!({})),
    );
    let mut child = revision("x", "vB00", &["vA00"], &Perspective::local(), json!({}));
    child.i = Some(store.next_increment().unwrap());
    assert_matches!(
        store.commit_batch(std::slice::from_ref(&child)),
        Err(BackendError::ParentMissing { .. })
    );
}

#[test]
fn test_heads_excludes_deleted_unless_requested() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &local, json!({"n": 1})));
    let mut tomb = revision("x", "vB00", &["vA00"], &local, json!({"n": 1}));
    tomb.d = true;
    commit(&store, tomb);

    assert!(store.heads(&id, &local, false).unwrap().is_empty());
    let with_deleted = store.heads(&id, &local, true).unwrap();
    assert_eq!(with_deleted.len(), 1);
    assert_eq!(with_deleted[0].v, Some(Version::from_static("vB00")));
}

#[test]
fn test_heads_one_per_branch() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));
    commit(&store, revision("x", "vC00", &["vA00"], &local, json!({})));

    let heads = store.heads(&id, &local, false).unwrap();
    let versions: Vec<_> = heads.iter().map(|h| h.v.clone().unwrap()).collect();
    assert_eq!(
        versions,
        vec![Version::from_static("vC00"), Version::from_static("vB00")]
    );
}

#[test]
fn test_history_is_newest_first() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    for (v, pa) in [("vA00", vec![]), ("vB00", vec!["vA00"]), ("vC00", vec!["vB00"])] {
        commit(&store, revision("x", v, &pa, &local, json!({})));
    }

    let history = store.history_from(&id, &local, None).unwrap();
    let versions: Vec<_> = history.iter().map(|r| r.v.clone().unwrap()).collect();
    assert_eq!(
        versions,
        ["vC00", "vB00", "vA00"].map(Version::from_static).to_vec()
    );

    // Increments strictly increase in insertion order.
    let increments: Vec<_> = history.iter().rev().map(|r| r.i.unwrap()).collect();
    assert_eq!(increments, vec![1, 2, 3]);

    let from_b = store
        .history_from(&id, &local, Some(&Version::from_static("vB00")))
        .unwrap();
    assert_eq!(from_b.len(), 2);
    assert_eq!(from_b[0].v, Some(Version::from_static("vB00")));
}

#[test]
fn test_last_acked_or_local() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    let mut a = revision("x", "vA00", &[], &local, json!({}));
    a.lo = true;
    commit(&store, a);
    // A merge-created revision: neither locally originated nor acked.
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));

    let graft = store.last_acked_or_local(&id).unwrap().unwrap();
    assert_eq!(graft.v, Some(Version::from_static("vA00")));

    store
        .mark_acked(&id, &Version::from_static("vB00"), &local, 7)
        .unwrap();
    let graft = store.last_acked_or_local(&id).unwrap().unwrap();
    assert_eq!(graft.v, Some(Version::from_static("vB00")));
}

#[test]
fn test_last_by_perspective_with_ack_filter() {
    let store = new_store();
    let peer = Perspective::remote("p");
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &peer, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &peer, json!({})));
    store
        .mark_acked(&id, &Version::from_static("vA00"), &peer, 3)
        .unwrap();

    let latest = store.last_by_perspective(&id, &peer, None).unwrap().unwrap();
    assert_eq!(latest.v, Some(Version::from_static("vB00")));
    let acked = store
        .last_by_perspective(&id, &peer, Some(true))
        .unwrap()
        .unwrap();
    assert_eq!(acked.v, Some(Version::from_static("vA00")));
}

#[test]
fn test_mark_acked_sets_op_once() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    let v = Version::from_static("vA00");

    store.mark_acked(&id, &v, &local, 11).unwrap();
    store.mark_acked(&id, &v, &local, 99).unwrap();
    let rev = store.get(&id, &v, &local).unwrap().unwrap();
    assert!(rev.ack);
    assert_eq!(rev.op, 11);
}

#[test]
fn test_next_increment_cold_start() {
    let store = new_store();
    // Write behind the facade's back so its counter has never been primed.
    let mut a = revision("x", "vA00", &[], &Perspective::local(), json!({}));
    a.i = Some(41);
    store.backend().put(&a).unwrap();

    assert_eq!(store.next_increment().unwrap(), 42);
    assert_eq!(store.next_increment().unwrap(), 43);
}

#[test]
fn test_next_increment_starts_at_one() {
    let store = new_store();
    assert_eq!(store.next_increment().unwrap(), 1);
    assert_eq!(store.next_increment().unwrap(), 2);
}

#[test]
fn test_overlay_answers_pending_reads() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &local, json!({"n": 1})));

    let pending = vec![revision("x", "vB00", &["vA00"], &local, json!({"n": 2}))];
    let overlay = store.overlay(&pending);

    let got = overlay
        .get(&id, &Version::from_static("vB00"), &local)
        .unwrap()
        .unwrap();
    assert_eq!(got.body, body(json!({"n": 2})));

    let history = overlay.history_from(&id, &local, None).unwrap();
    let versions: Vec<_> = history.iter().map(|r| r.v.clone().unwrap()).collect();
    assert_eq!(versions, ["vB00", "vA00"].map(Version::from_static).to_vec());

    let heads = overlay.heads(&id, &local, false).unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].v, Some(Version::from_static("vB00")));

    // The committed state never observes the overlay.
    assert!(
        store
            .get(&id, &Version::from_static("vB00"), &local)
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_is_ancestor() {
    let store = new_store();
    let local = Perspective::local();
    let id = DocId::from_str_key("x");
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));
    commit(&store, revision("x", "vC00", &["vB00"], &local, json!({})));

    let a = Version::from_static("vA00");
    let c = Version::from_static("vC00");
    assert!(store.is_ancestor(&id, &local, &a, &c).unwrap());
    assert!(!store.is_ancestor(&id, &local, &c, &a).unwrap());
    // Inclusive on equality.
    assert!(store.is_ancestor(&id, &local, &a, &a).unwrap());
}

#[test]
fn test_contains_id() {
    let store = new_store();
    commit(
        &store,
        revision("x", "vA00", &[], &Perspective::local(), json!({})),
    );
    assert!(store.contains_id(&DocId::from_str_key("x")).unwrap());
    assert!(!store.contains_id(&DocId::from_str_key("y")).unwrap());
}
