//! Serde adapter for byte vectors carried as 0x-prefixed hex strings.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    let stripped = s.strip_prefix("0x").unwrap_or(&s);
    hex::decode(stripped).map_err(serde::de::Error::custom)
}

/// Decode a 0x-prefixed hex string; the prefix is optional
pub fn decode(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

pub fn encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
