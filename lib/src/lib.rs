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

//! Engine of a peer-to-peer, multi-master, versioned document store.
//!
//! Each peer holds a collection of documents keyed by identifier and, per
//! document and perspective, an append-only DAG of revisions. Peers
//! exchange revisions and reconcile divergent histories with a recursive
//! three-way merge over the lowest common ancestors.

#![warn(missing_docs)]
#![deny(unused_must_use)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod bridge;
pub mod ids;
pub mod ingest;
pub mod lca;
pub mod memory_backend;
pub mod merge;
pub mod reconcile;
pub mod replicate;
pub mod revision;
pub mod settings;
pub mod store;
pub mod wire;
