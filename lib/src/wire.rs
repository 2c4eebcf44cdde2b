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

//! The peer wire shape: length-prefixed revision frames and the
//! line-delimited opening exchange.
//!
//! The transport itself (WebSocket, TLS, the preauth proxy) lives outside
//! this crate; these types define what crosses it. A frame carries one
//! revision with ordered keys, split into a header document `h` and the
//! body `b`. Perspective, origin flags, and the source cursor never go on
//! the wire: the receiver restamps the perspective from the authenticated
//! peer identity.

use serde_json::Value;
use thiserror::Error;

use crate::ids::DocId;
use crate::ids::Perspective;
use crate::ids::Version;
use crate::revision::Body;
use crate::revision::Parents;
use crate::revision::Revision;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
    #[error("frame encoding failed")]
    Encode(#[source] serde_json::Error),
}

/// Upper bound on one frame's payload; a peer sending more is broken.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// First client line of the opening exchange.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub db: String,
}

/// Server answer: where the peer wants the revision stream to start.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DataRequest {
    pub start: StartPoint,
}

/// `true` for the whole history, or the version to resume after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Beginning,
    After(Version),
}

impl serde::Serialize for StartPoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Beginning => serializer.serialize_bool(true),
            Self::After(version) => version.serialize(serializer),
        }
    }
}

impl<'de> serde::Deserialize<'de> for StartPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Bool(true) => Ok(Self::Beginning),
            Value::String(s) => Version::try_from_str(&s)
                .map(Self::After)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid start version {s:?}"))),
            other => Err(serde::de::Error::custom(format!(
                "invalid start point {other}"
            ))),
        }
    }
}

/// Encodes one revision as a length-prefixed frame with ordered keys:
/// `h = {id, v, pa, [i], [d]}`, then `b`. The length prefix is a
/// little-endian `u32` over the payload.
pub fn encode_frame(rev: &Revision) -> Result<Vec<u8>, WireError> {
    let Some(v) = &rev.v else {
        return Err(WireError::Malformed {
            reason: format!("revision of {} has no version", rev.id),
        });
    };
    let mut header = serde_json::Map::new();
    header.insert("id".to_owned(), Value::String(rev.id.hex()));
    header.insert("v".to_owned(), Value::String(v.as_str().to_owned()));
    header.insert(
        "pa".to_owned(),
        Value::Array(
            rev.pa
                .iter()
                .map(|p| Value::String(p.as_str().to_owned()))
                .collect(),
        ),
    );
    if let Some(i) = rev.i {
        header.insert("i".to_owned(), Value::from(i));
    }
    if rev.d {
        header.insert("d".to_owned(), Value::Bool(true));
    }
    let mut frame = serde_json::Map::new();
    frame.insert("h".to_owned(), Value::Object(header));
    frame.insert("b".to_owned(), Value::Object(rev.body.clone()));
    let payload = serde_json::to_vec(&Value::Object(frame)).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes one frame from the front of `buf`, stamping `pe` from the
/// authenticated peer identity. Returns the revision and the bytes
/// consumed, or `None` when the buffer does not yet hold a whole frame.
pub fn decode_frame(buf: &[u8], pe: &Perspective) -> Result<Option<(Revision, usize)>, WireError> {
    let Some(prefix) = buf.get(..4) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes(prefix.try_into().expect("4-byte slice")) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let Some(payload) = buf.get(4..4 + len) else {
        return Ok(None);
    };
    let value: Value = serde_json::from_slice(payload).map_err(|err| WireError::Malformed {
        reason: err.to_string(),
    })?;
    let malformed = |reason: &str| WireError::Malformed {
        reason: reason.to_owned(),
    };
    let Value::Object(mut frame) = value else {
        return Err(malformed("frame is not an object"));
    };
    let Some(Value::Object(header)) = frame.remove("h") else {
        return Err(malformed("missing header"));
    };
    let body: Body = match frame.remove("b") {
        Some(Value::Object(body)) => body,
        Some(_) => return Err(malformed("body is not an object")),
        None => Body::new(),
    };
    let id = match header.get("id") {
        Some(Value::String(hex)) => DocId::new(
            hex::decode(hex).map_err(|_| malformed("header id is not hex"))?,
        ),
        _ => return Err(malformed("missing header id")),
    };
    let v = match header.get("v") {
        Some(Value::String(s)) => {
            Version::try_from_str(s).ok_or_else(|| malformed("malformed header version"))?
        }
        _ => return Err(malformed("missing header version")),
    };
    let mut pa = Parents::new();
    match header.get("pa") {
        Some(Value::Array(items)) => {
            for item in items {
                let Value::String(s) = item else {
                    return Err(malformed("parent is not a string"));
                };
                pa.push(Version::try_from_str(s).ok_or_else(|| malformed("malformed parent"))?);
            }
        }
        Some(_) => return Err(malformed("parents are not a list")),
        None => {}
    }
    let i = match header.get("i") {
        Some(value) => Some(
            value
                .as_u64()
                .ok_or_else(|| malformed("header increment is not an integer"))?,
        ),
        None => None,
    };
    let d = matches!(header.get("d"), Some(Value::Bool(true)));
    let rev = Revision {
        id,
        v: Some(v),
        pa,
        pe: pe.clone(),
        i,
        d,
        lo: false,
        ack: false,
        op: 0,
        body,
    };
    Ok(Some((rev, 4 + len)))
}
