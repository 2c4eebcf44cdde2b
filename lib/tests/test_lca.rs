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
use peerdoc_lib::ids::Perspective;
use peerdoc_lib::ids::Version;
use peerdoc_lib::lca::Lca;
use peerdoc_lib::lca::LcaError;
use peerdoc_lib::lca::find_lcas;
use peerdoc_lib::revision::Revision;
use peerdoc_lib::store::Store;
use serde_json::json;
use testutils::commit;
use testutils::new_store;
use testutils::revision;

fn versions(lcas: &[Lca]) -> Vec<Version> {
    lcas.iter().map(|lca| lca.version.clone()).collect()
}

fn get(store: &Store, v: &'static str, pe: &Perspective) -> Revision {
    use peerdoc_lib::store::DagView as _;
    store
        .get(
            &peerdoc_lib::ids::DocId::from_str_key("x"),
            &Version::from_static(v),
            pe,
        )
        .unwrap()
        .unwrap()
}

#[test]
fn test_diamond_single_ancestor() {
    //   B   C
    //    \ /
    //     A
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({"foo": 1})));
    commit(&store, revision("x", "vC00", &["vA00"], &local, json!({"bar": 1})));

    let b = get(&store, "vB00", &local);
    let c = get(&store, "vC00", &local);
    let lcas = find_lcas(&b, &c, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
    assert_eq!(lcas[0].x, lcas[0].y);
}

#[test]
fn test_direct_parent_shortcut() {
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));

    let a = get(&store, "vA00", &local);
    let b = get(&store, "vB00", &local);
    let lcas = find_lcas(&a, &b, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
    let lcas = find_lcas(&b, &a, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
}

#[test]
fn test_descendant_beyond_direct_parent() {
    //  C
    //  |
    //  B
    //  |
    //  A
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));
    commit(&store, revision("x", "vC00", &["vB00"], &local, json!({})));

    let a = get(&store, "vA00", &local);
    let c = get(&store, "vC00", &local);
    let lcas = find_lcas(&c, &a, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
}

#[test]
fn test_equal_leaves() {
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    let a = get(&store, "vA00", &local);
    let lcas = find_lcas(&a, &a, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
}

#[test]
fn test_criss_cross_two_ancestors() {
    //  E   F
    //  |\ /|
    //  | X |
    //  |/ \|
    //  C   D
    //   \ /
    //    B
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vB00", &[], &local, json!({})));
    commit(&store, revision("x", "vC00", &["vB00"], &local, json!({"c": 1})));
    commit(&store, revision("x", "vD00", &["vB00"], &local, json!({"d": 1})));
    commit(
        &store,
        revision("x", "vE00", &["vC00", "vD00"], &local, json!({"c": 1, "d": 1})),
    );
    commit(
        &store,
        revision("x", "vF00", &["vC00", "vD00"], &local, json!({"c": 1, "d": 1})),
    );

    let e = get(&store, "vE00", &local);
    let f = get(&store, "vF00", &local);
    let mut found = versions(&find_lcas(&e, &f, store.as_ref(), store.as_ref()).unwrap());
    found.sort();
    assert_eq!(
        found,
        vec![Version::from_static("vC00"), Version::from_static("vD00")]
    );
}

#[test]
fn test_deep_ancestor_is_shadowed() {
    //  E   F
    //  |\  |\
    //  | \ | \
    //  C  \|  |
    //  |   D  |
    //  B   |  B (shared)
    //   \  |  |
    //    \ | /
    //      A
    //
    // E merges C (child of B) and D (child of A); F merges B and D. The
    // common ancestors are B, D, and A, but A is an ancestor of both B and
    // D, so only B and D are lowest.
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));
    commit(&store, revision("x", "vC00", &["vB00"], &local, json!({})));
    commit(&store, revision("x", "vD00", &["vA00"], &local, json!({})));
    commit(&store, revision("x", "vE00", &["vC00", "vD00"], &local, json!({})));
    commit(&store, revision("x", "vF00", &["vB00", "vD00"], &local, json!({})));

    let e = get(&store, "vE00", &local);
    let f = get(&store, "vF00", &local);
    let mut found = versions(&find_lcas(&e, &f, store.as_ref(), store.as_ref()).unwrap());
    found.sort();
    assert_eq!(
        found,
        vec![Version::from_static("vB00"), Version::from_static("vD00")]
    );
}

#[test]
fn test_no_common_ancestor() {
    let store = new_store();
    let local = Perspective::local();
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    // A disjoint root: only possible after a deletion, but the search does
    // not care why.
    let mut tomb = revision("x", "vT00", &["vA00"], &local, json!({}));
    tomb.d = true;
    commit(&store, tomb);
    commit(&store, revision("x", "vZ00", &[], &local, json!({})));

    let a = get(&store, "vA00", &local);
    let z = get(&store, "vZ00", &local);
    assert_matches!(
        find_lcas(&a, &z, store.as_ref(), store.as_ref()),
        Err(LcaError::NoLca { .. })
    );
}

#[test]
fn test_cross_perspective_resolution() {
    // The same history exists under both perspectives; the ancestor must
    // resolve to the copy bound to each side.
    let store = new_store();
    let local = Perspective::local();
    let peer = Perspective::remote("p");
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({"foo": 1})));
    commit(&store, revision("x", "vA00", &[], &peer, json!({})));
    commit(&store, revision("x", "vC00", &["vA00"], &peer, json!({"bar": 1})));

    let b = get(&store, "vB00", &local);
    let c = get(&store, "vC00", &peer);
    let lcas = find_lcas(&b, &c, store.as_ref(), store.as_ref()).unwrap();
    assert_eq!(versions(&lcas), vec![Version::from_static("vA00")]);
    assert_eq!(lcas[0].x.pe, local);
    assert_eq!(lcas[0].y.pe, peer);
}

#[test]
fn test_missing_perspective_copy() {
    // A pending remote revision names an ancestor the store only holds
    // under the local perspective. The ancestor is found, but its
    // remote-bound copy cannot be resolved.
    let store = new_store();
    let local = Perspective::local();
    let peer = Perspective::remote("p");
    commit(&store, revision("x", "vA00", &[], &local, json!({})));
    commit(&store, revision("x", "vB00", &["vA00"], &local, json!({})));

    let pending = vec![revision("x", "vC00", &["vA00"], &peer, json!({}))];
    let overlay = store.overlay(&pending);
    let b = get(&store, "vB00", &local);
    let c = pending[0].clone();
    assert_matches!(
        find_lcas(&b, &c, store.as_ref(), &overlay),
        Err(LcaError::MissingPerspective { .. })
    );
}
