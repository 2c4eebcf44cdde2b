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

//! Replica configuration.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid replica settings")]
    Parse(#[from] toml_edit::de::Error),
}

/// Tunables for one replica. All fields have defaults, so an empty
/// configuration is valid.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ReplicaSettings {
    /// The name this peer presents to remote peers.
    pub peer_name: String,
    /// Queued revisions per perspective before producers back off.
    pub queue_capacity: usize,
    /// Largest batch the drain assembles for one pipeline run.
    pub batch_limit: usize,
    /// Back-pressure retry interval, in milliseconds.
    pub retry_interval_ms: u64,
    /// Skip merge-conflict and missing-ancestor items instead of aborting
    /// the whole batch.
    pub proceed_on_error: bool,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            peer_name: String::new(),
            queue_capacity: 5000,
            batch_limit: 500,
            retry_interval_ms: 100,
            proceed_on_error: false,
        }
    }
}

impl ReplicaSettings {
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml_edit::de::from_str(text)?)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
