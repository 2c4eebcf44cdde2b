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

//! Identifier types for documents, versions, and perspectives.

use std::fmt;
use std::fmt::Debug;

use rand::Rng as _;

/// Identifier of a document. Opaque bytes; most sources use printable keys,
/// but nothing here assumes that.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct DocId(Vec<u8>);

impl DocId {
    pub fn new(value: Vec<u8>) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Builds a `DocId` from a string key, the common case for document
    /// sources keyed by name.
    pub fn from_str_key(key: &str) -> Self {
        Self(key.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.debug_tuple("DocId").field(&s).finish(),
            Err(_) => f.debug_tuple("DocId").field(&self.hex()).finish(),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.pad(s),
            Err(_) => f.pad(&self.hex()),
        }
    }
}

impl serde::Serialize for DocId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            self.hex().serialize(serializer)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> serde::Deserialize<'de> for DocId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex = String::deserialize(deserializer)?;
            let bytes = hex::decode(&hex).map_err(serde::de::Error::custom)?;
            Ok(Self(bytes))
        } else {
            Ok(Self(Vec::<u8>::deserialize(deserializer)?))
        }
    }
}

/// The alphabet versions are drawn from. URL-safe base64 symbols, so a
/// generated version is always a short printable identifier.
const VERSION_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Number of symbols in a generated version. 8 symbols of a 64-symbol
/// alphabet carry 48 bits, enough for collision-free random assignment at
/// any realistic collection size.
pub const GENERATED_VERSION_LEN: usize = 8;

const MIN_VERSION_LEN: usize = 4;
const MAX_VERSION_LEN: usize = 16;

/// A revision version: a short random printable identifier, globally unique
/// with overwhelming probability. Not a content hash; a version follows the
/// revision it was assigned to and never changes.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Version(String);

impl Version {
    /// Generates a fresh random version.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let symbols = (0..GENERATED_VERSION_LEN)
            .map(|_| VERSION_ALPHABET[rng.random_range(0..VERSION_ALPHABET.len())] as char)
            .collect();
        Self(symbols)
    }

    /// Parses a version string. Returns `None` unless it is a short
    /// identifier over the version alphabet.
    pub fn try_from_str(s: &str) -> Option<Self> {
        Self::is_valid(s).then(|| Self(s.to_owned()))
    }

    /// Parses a version string that is known to be valid. A static str is
    /// required to prevent API misuse.
    pub fn from_static(s: &'static str) -> Self {
        Self::try_from_str(s).unwrap()
    }

    pub fn is_valid(s: &str) -> bool {
        (MIN_VERSION_LEN..=MAX_VERSION_LEN).contains(&s.len())
            && s.bytes().all(|b| VERSION_ALPHABET.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The smallest value in `Version` order. Not a valid version; used as
    /// a range bound for prefix scans.
    pub(crate) fn min_bound() -> Self {
        Self(String::new())
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("Version").field(&self.0).finish()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.0)
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::try_from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid version {s:?}")))
    }
}

/// Reserved perspective name for the owning peer's own viewpoint.
const LOCAL_NAME: &str = "_local";

/// A named viewpoint on the revision graph: one per remote peer, plus the
/// reserved [`Perspective::local()`] for the owning peer.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Perspective(String);

impl Perspective {
    /// The owning peer's perspective. Authoritative for replication offsets
    /// and for source-collection mirroring.
    pub fn local() -> Self {
        Self(LOCAL_NAME.to_owned())
    }

    /// A remote peer's perspective. `name` must not collide with the
    /// reserved local name.
    pub fn remote(name: &str) -> Self {
        assert_ne!(name, LOCAL_NAME, "remote perspective must not be named {LOCAL_NAME}");
        Self(name.to_owned())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_NAME
    }

    /// The smallest value in `Perspective` order, for range bounds.
    pub(crate) fn min_bound() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("Perspective").field(&self.0).finish()
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.0)
    }
}
