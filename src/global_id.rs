//! Global object identifiers.
//!
//! A global ID names an object anywhere in the supergraph: the typename of the
//! object plus an opaque key understood only by the owning subgraph. On the wire
//! it is the standard base64 encoding of `typename ++ DIVIDER ++ key`.

use base64::{Engine, engine::general_purpose::STANDARD};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Separates the typename from the key. Never valid inside a GraphQL name.
pub const DIVIDER: u8 = b':';

#[derive(Debug, Error, PartialEq)]
pub enum MalformedIdError {
    #[error("node ID is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("node ID has no typename divider")]
    MissingDivider,
    #[error("node ID typename is not valid UTF-8")]
    Typename,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GlobalId {
    typename: String,
    key: Vec<u8>,
}

impl GlobalId {
    pub fn new(typename: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        GlobalId {
            typename: typename.into(),
            key: key.into(),
        }
    }

    pub fn typename(&self) -> &str {
        &self.typename
    }

    /// The key exactly as the owning subgraph encoded it.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn encode(&self) -> String {
        encode(&self.typename, &self.key)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for GlobalId {
    type Err = MalformedIdError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        decode(token)
    }
}

pub fn encode(typename: &str, key: impl AsRef<[u8]>) -> String {
    let key = key.as_ref();
    let mut raw = Vec::with_capacity(typename.len() + 1 + key.len());
    raw.extend_from_slice(typename.as_bytes());
    raw.push(DIVIDER);
    raw.extend_from_slice(key);
    STANDARD.encode(raw)
}

/// Splits a token at the first divider. The typename is not checked against
/// any set of known types; that is up to the caller.
pub fn decode(token: &str) -> Result<GlobalId, MalformedIdError> {
    let raw = STANDARD.decode(token)?;
    let divider = raw
        .iter()
        .position(|byte| *byte == DIVIDER)
        .ok_or(MalformedIdError::MissingDivider)?;

    let typename =
        std::str::from_utf8(&raw[..divider]).map_err(|_| MalformedIdError::Typename)?;

    Ok(GlobalId {
        typename: typename.to_string(),
        key: raw[divider + 1..].to_vec(),
    })
}
