use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::SerializationError;

/// Length in bytes of a PTM encrypted payload hash.
pub const ENCRYPTED_PAYLOAD_HASH_LENGTH: usize = 64;

/// Length in bytes of a block hash or state root.
pub const HASH_LENGTH: usize = 32;

/// 32-byte hash used for block hashes and state roots
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_LENGTH]);

/// 64-byte content hash of an encrypted payload held by the PTM.
///
/// The all-zero value means "no payload" and never reaches the PTM.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncryptedPayloadHash(pub [u8; ENCRYPTED_PAYLOAD_HASH_LENGTH]);

impl Hash {
    /// Build from arbitrary bytes, keeping the trailing bytes and left padding with zeros
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; HASH_LENGTH];
        copy_right_aligned(&mut out, bytes);
        Self(out)
    }

    /// Hash whose bytes are the UTF-8 bytes of `s` (test and fixture helper)
    pub fn from_string(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SerializationError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| SerializationError::InvalidFormat(format!("invalid base64 hash {}: {}", encoded, e)))?;
        Ok(Self::from_slice(&bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SerializationError> {
        let bytes = decode_prefixed_hex(encoded)?;
        Ok(Self::from_slice(&bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl EncryptedPayloadHash {
    /// Build from arbitrary bytes, keeping the trailing bytes and left padding with zeros
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; ENCRYPTED_PAYLOAD_HASH_LENGTH];
        copy_right_aligned(&mut out, bytes);
        Self(out)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SerializationError> {
        let bytes = BASE64.decode(encoded).map_err(|e| {
            SerializationError::InvalidFormat(format!("unable to decode encrypted payload hash: {}. Cause: {}", encoded, e))
        })?;
        Ok(Self::from_slice(&bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SerializationError> {
        let bytes = decode_prefixed_hex(encoded)?;
        Ok(Self::from_slice(&bytes))
    }

    /// True for the zero hash, which denotes "no private payload"
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl Default for EncryptedPayloadHash {
    fn default() -> Self {
        Self([0u8; ENCRYPTED_PAYLOAD_HASH_LENGTH])
    }
}

fn copy_right_aligned(out: &mut [u8], bytes: &[u8]) {
    let src = if bytes.len() > out.len() {
        &bytes[bytes.len() - out.len()..]
    } else {
        bytes
    };
    let offset = out.len() - src.len();
    out[offset..].copy_from_slice(src);
}

fn decode_prefixed_hex(encoded: &str) -> Result<Vec<u8>, SerializationError> {
    let stripped = encoded
        .strip_prefix("0x")
        .or_else(|| encoded.strip_prefix("0X"))
        .unwrap_or(encoded);
    hex::decode(stripped).map_err(|e| SerializationError::InvalidFormat(format!("invalid hex {}: {}", encoded, e)))
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EncryptedPayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedPayloadHash({})", self.to_base64())
    }
}

impl fmt::Display for EncryptedPayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Human readable formats (JSON) carry 0x-hex strings, binary formats carry raw bytes.
macro_rules! impl_hash_serde {
    ($ty:ident, $len:expr) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HashVisitor;

                impl<'de> Visitor<'de> for HashVisitor {
                    type Value = $ty;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "a 0x-prefixed hex string or {} raw bytes", $len)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        $ty::from_hex(v).map_err(E::custom)
                    }

                    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                        if v.len() != $len {
                            return Err(E::invalid_length(v.len(), &self));
                        }
                        Ok($ty::from_slice(v))
                    }

                    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                        self.visit_bytes(&v)
                    }

                    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                        let mut bytes = Vec::with_capacity($len);
                        while let Some(b) = seq.next_element::<u8>()? {
                            bytes.push(b);
                        }
                        self.visit_bytes(&bytes)
                    }
                }

                if deserializer.is_human_readable() {
                    deserializer.deserialize_str(HashVisitor)
                } else {
                    deserializer.deserialize_bytes(HashVisitor)
                }
            }
        }
    };
}

impl_hash_serde!(Hash, HASH_LENGTH);
impl_hash_serde!(EncryptedPayloadHash, ENCRYPTED_PAYLOAD_HASH_LENGTH);
