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

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::revision::Revision;

/// In-memory DAG backend over ordered maps, laid out as the three key
/// families an on-disk ordered KV store would use. The reference backend
/// for tests and for single-process deployments without persistence.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// `i -> revision`: monotone replication order.
    by_increment: BTreeMap<u64, Revision>,
    /// `(id, v, pe) -> i`: primary lookup.
    primary: BTreeMap<(DocId, Version, Perspective), u64>,
    /// `(id, pe, i) -> ()`: head and latest-by-perspective scans, read in
    /// reverse for newest-first order.
    by_perspective: BTreeMap<(DocId, Perspective, u64), ()>,
}

impl MemoryBackend {
    pub fn name() -> &'static str {
        "memory"
    }

    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a writer panicked mid-update; the
        // maps are updated insert-only, so the state is still coherent.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        Self::name()
    }

    fn put(&self, rev: &Revision) -> BackendResult<()> {
        let Some(v) = &rev.v else {
            return Err(BackendError::VirtualRevision { id: rev.id.clone() });
        };
        let Some(i) = rev.i else {
            return Err(BackendError::IncrementUnassigned { id: rev.id.clone() });
        };
        let mut inner = self.locked();
        let primary_key = (rev.id.clone(), v.clone(), rev.pe.clone());
        if inner.primary.contains_key(&primary_key) {
            return Err(BackendError::VersionExists {
                id: rev.id.clone(),
                version: v.clone(),
                perspective: rev.pe.clone(),
            });
        }
        for parent in &rev.pa {
            let parent_key = (rev.id.clone(), parent.clone(), rev.pe.clone());
            if !inner.primary.contains_key(&parent_key) {
                return Err(BackendError::ParentMissing {
                    id: rev.id.clone(),
                    parent: parent.clone(),
                    perspective: rev.pe.clone(),
                });
            }
        }
        inner.by_increment.insert(i, rev.clone());
        inner.primary.insert(primary_key, i);
        inner
            .by_perspective
            .insert((rev.id.clone(), rev.pe.clone(), i), ());
        Ok(())
    }

    fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> BackendResult<Option<Revision>> {
        let inner = self.locked();
        let Some(&i) = inner.primary.get(&(id.clone(), v.clone(), pe.clone())) else {
            return Ok(None);
        };
        let rev = inner
            .by_increment
            .get(&i)
            .cloned()
            .ok_or(BackendError::IncrementNotFound { increment: i })?;
        Ok(Some(rev))
    }

    fn by_increment(&self, i: u64) -> BackendResult<Option<Revision>> {
        Ok(self.locked().by_increment.get(&i).cloned())
    }

    fn max_increment(&self) -> BackendResult<Option<u64>> {
        Ok(self.locked().by_increment.keys().next_back().copied())
    }

    fn scan_increments(&self, from_exclusive: u64) -> BackendResult<Vec<Revision>> {
        use std::ops::Bound;
        let inner = self.locked();
        Ok(inner
            .by_increment
            .range((Bound::Excluded(from_exclusive), Bound::Unbounded))
            .map(|(_, rev)| rev.clone())
            .collect())
    }

    fn history(&self, id: &DocId, pe: &Perspective) -> BackendResult<Vec<Revision>> {
        let inner = self.locked();
        let lo = (id.clone(), pe.clone(), 0);
        let hi = (id.clone(), pe.clone(), u64::MAX);
        let mut out = Vec::new();
        for ((_, _, i), ()) in inner.by_perspective.range(lo..=hi).rev() {
            let rev = inner
                .by_increment
                .get(i)
                .cloned()
                .ok_or(BackendError::IncrementNotFound { increment: *i })?;
            out.push(rev);
        }
        Ok(out)
    }

    fn contains_id(&self, id: &DocId) -> BackendResult<bool> {
        let inner = self.locked();
        let found = inner
            .primary
            .range((id.clone(), Version::min_bound(), Perspective::min_bound())..)
            .next()
            .is_some_and(|((found_id, _, _), _)| found_id == id);
        Ok(found)
    }

    fn mark_acked(&self, id: &DocId, v: &Version, pe: &Perspective, op: u64) -> BackendResult<()> {
        let mut inner = self.locked();
        let Some(&i) = inner.primary.get(&(id.clone(), v.clone(), pe.clone())) else {
            return Err(BackendError::RevisionNotFound {
                id: id.clone(),
                version: v.clone(),
                perspective: pe.clone(),
            });
        };
        let rev = inner
            .by_increment
            .get_mut(&i)
            .ok_or(BackendError::IncrementNotFound { increment: i })?;
        rev.ack = true;
        if rev.op == 0 {
            rev.op = op;
        }
        Ok(())
    }

    fn len(&self) -> BackendResult<usize> {
        Ok(self.locked().by_increment.len())
    }
}
