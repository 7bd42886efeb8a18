use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use pvt_common::{serde_hex, EncryptedPayloadHash, ExtraMetadata, Hash, PrivateStateIdentifier, QuorumPayloadExtra};

/// One private payload shipped to a light client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateTransactionData {
    pub hash: EncryptedPayloadHash,
    #[serde(with = "serde_hex")]
    pub payload: Vec<u8>,
    pub extra: ExtraMetadata,
    pub is_sender: bool,
}

impl PrivateTransactionData {
    /// RPC form the light client's caching proxy stores
    pub fn to_payload_extra(&self) -> QuorumPayloadExtra {
        QuorumPayloadExtra {
            payload: serde_hex::encode(&self.payload),
            extra_metadata: Some(self.extra.clone()),
            is_sender: self.is_sender,
        }
    }
}

/// Private data of one block as seen by one private state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPrivateData {
    pub block_hash: Hash,
    pub psi: PrivateStateIdentifier,
    pub private_state_root: Hash,
    pub private_transactions: Vec<PrivateTransactionData>,
}

/// Cache key for per-PSI block data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QLightCacheKey {
    pub block_hash: Hash,
    pub psi: PrivateStateIdentifier,
}

impl QLightCacheKey {
    pub fn new(block_hash: Hash, psi: PrivateStateIdentifier) -> Self {
        Self { block_hash, psi }
    }

    /// Length prefixed binary encoding, base64 encoded
    pub fn to_cache_key(&self) -> Result<String, bincode::Error> {
        Ok(BASE64.encode(bincode::serialize(self)?))
    }
}
