//! Deterministic actor identifiers.

use std::fmt;
use std::str::FromStr;

use hv_cbor::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub const ID_LEN: usize = 20;

const DOMAIN: &[u8] = b"hv/actor-id/v1";

/// Fixed-width actor identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId([u8; ID_LEN]);

impl ActorId {
    pub const fn from_array(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdParseError> {
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdParseError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Numeric identity: the nonce big-endian in the low bytes.
    pub fn from_nonce(nonce: u64) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 8..].copy_from_slice(&nonce.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Derive the ID of the actor created with `nonce` by `parent` (or by the
/// hypervisor itself when `parent` is `None`).
///
/// The preimage has a fixed layout, so distinct `(parent, nonce)` pairs never
/// share one; the result is the SHA-256 of it truncated to [`ID_LEN`] bytes.
pub fn derive_id(parent: Option<ActorId>, nonce: u64) -> ActorId {
    let mut preimage = Vec::with_capacity(DOMAIN.len() + 8 + 1 + ID_LEN);
    preimage.extend_from_slice(DOMAIN);
    preimage.extend_from_slice(&nonce.to_be_bytes());
    match parent {
        Some(parent) => {
            preimage.push(1);
            preimage.extend_from_slice(parent.as_bytes());
        }
        None => preimage.push(0),
    }
    ActorId(Hash::of_bytes(&preimage).truncate::<ID_LEN>())
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.to_hex())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("actor id must be 20 bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl FromStr for ActorId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }
}

// Hex string in every format, so IDs read the same in JSON scripts and
// CBOR responses. Byte strings are accepted on input as well.
impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = ActorId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a hex string or {ID_LEN} bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                ActorId::from_slice(v).map_err(E::custom)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(ID_LEN);
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                ActorId::from_slice(&bytes).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}
