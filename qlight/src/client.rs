//! Light client side of qlight: ingests shipped private block data.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use pvt_common::{
    EncryptedPayloadHash, Hash, PrivacyResult, PrivateStateIdentifier, PtmResult, QLightError, QuorumPayloadExtra,
};
use pvt_ptm::cache::{CLEANUP_INTERVAL, DEFAULT_EXPIRATION};
use pvt_ptm::engine::CachingProxy;
use pvt_ptm::{PrivateStateRootStore, TtlCache};

use crate::types::BlockPrivateData;

/// Destination for payloads received from the server peer
pub trait PrivateCacheSink: Send + Sync {
    fn cache(&self, hash: EncryptedPayloadHash, data: &QuorumPayloadExtra) -> PtmResult<()>;

    fn check_and_add_empty(&self, hash: EncryptedPayloadHash);
}

impl PrivateCacheSink for CachingProxy {
    fn cache(&self, hash: EncryptedPayloadHash, data: &QuorumPayloadExtra) -> PtmResult<()> {
        CachingProxy::cache(self, hash, data)
    }

    fn check_and_add_empty(&self, hash: EncryptedPayloadHash) {
        CachingProxy::check_and_add_empty(self, hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AdvertisedRoot {
    psi: PrivateStateIdentifier,
    root: Hash,
}

pub struct ClientCache {
    sink: Arc<dyn PrivateCacheSink>,
    roots: TtlCache<Hash, AdvertisedRoot>,
    store: Arc<dyn PrivateStateRootStore>,
}

impl ClientCache {
    pub fn new(sink: Arc<dyn PrivateCacheSink>, store: Arc<dyn PrivateStateRootStore>) -> Self {
        Self::with_expiration(sink, store, DEFAULT_EXPIRATION, CLEANUP_INTERVAL)
    }

    pub fn with_expiration(
        sink: Arc<dyn PrivateCacheSink>,
        store: Arc<dyn PrivateStateRootStore>,
        ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            sink,
            roots: TtlCache::with_expiration(ttl, cleanup_interval),
            store,
        }
    }

    /// Cache every payload of the block and remember the advertised private state root
    pub fn add_private_block(&self, data: &BlockPrivateData) -> PrivacyResult<()> {
        for ptd in &data.private_transactions {
            self.sink.cache(ptd.hash, &ptd.to_payload_extra())?;
        }
        debug!(block = %data.block_hash, txs = data.private_transactions.len(), "cached private block data");
        self.roots.set(
            data.block_hash,
            AdvertisedRoot {
                psi: data.psi.clone(),
                root: data.private_state_root,
            },
        );
        Ok(())
    }

    /// Mark a payload this client is not party to, so it is never requested from the server
    pub fn check_and_add_empty_entry(&self, hash: EncryptedPayloadHash) {
        self.sink.check_and_add_empty(hash);
    }

    /// Compare the root the server advertised for `block_hash` with the locally computed one.
    ///
    /// Blocks without advertised private data pass trivially.
    pub fn validate_private_state_root(&self, block_hash: Hash, public_root: Hash) -> PrivacyResult<()> {
        let Some(advertised) = self.roots.get(&block_hash) else {
            return Ok(());
        };
        let psi = if advertised.psi.as_str().is_empty() {
            PrivateStateIdentifier::default_psi()
        } else {
            advertised.psi
        };

        match self.store.private_state_root(&public_root, &psi) {
            Some(actual) if actual == advertised.root => Ok(()),
            None if advertised.root.is_zero() => Ok(()),
            None => {
                error!(block = %block_hash, %public_root, "no local private state root to validate against");
                Err(QLightError::MissingPrivateStateRoot(public_root).into())
            }
            Some(actual) => {
                error!(block = %block_hash, expected = %advertised.root, %actual, "private state root mismatch");
                Err(QLightError::PrivateStateRootMismatch {
                    block_hash,
                    expected: advertised.root,
                    actual,
                }
                .into())
            }
        }
    }
}
