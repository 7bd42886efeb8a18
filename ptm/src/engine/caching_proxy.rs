use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use pvt_common::{
    serde_hex, EncryptedPayloadHash, ExtraMetadata, PrivacyGroup, PtmError, PtmResult, QuorumPayloadExtra,
};

use super::{FeatureSet, PrivatePayload, PrivateTransactionManager, PtmFeature};
use crate::cache::{CacheEntry, PayloadCache, PrivateCacheItem};

/// RPC method a light client uses to pull a payload from its server peer
pub const GET_QUORUM_PAYLOAD_EXTRA: &str = "eth_getQuorumPayloadExtra";

/// JSON-RPC access to the qlight server peer
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> PtmResult<Value>;
}

/// Adapter for light clients without PTM access.
///
/// Payloads arrive ahead of time through [`CachingProxy::cache`] as the server
/// ships private block data. A cache miss falls back to asking the server peer.
pub struct CachingProxy {
    features: FeatureSet,
    cache: PayloadCache,
    rpc: RwLock<Option<Arc<dyn RpcCaller>>>,
}

impl CachingProxy {
    pub fn new() -> Self {
        Self::with_cache(PayloadCache::new())
    }

    pub fn with_cache(cache: PayloadCache) -> Self {
        Self {
            features: FeatureSet::new(&[PtmFeature::PrivacyEnhancements]),
            cache,
            rpc: RwLock::new(None),
        }
    }

    /// Attach the server peer once the qlight connection is up
    pub fn set_rpc_caller(&self, caller: Arc<dyn RpcCaller>) {
        *self.rpc.write() = Some(caller);
    }

    pub fn cache_handle(&self) -> &PayloadCache {
        &self.cache
    }

    /// Store a payload shipped by the server peer
    pub fn cache(&self, hash: EncryptedPayloadHash, data: &QuorumPayloadExtra) -> PtmResult<()> {
        if hash.is_empty() {
            return Ok(());
        }
        let payload = serde_hex::decode(&data.payload)
            .map_err(|e| PtmError::InvalidPayload(format!("unable to decode payload for {}. Cause: {}", hash, e)))?;
        let item = PrivateCacheItem {
            payload,
            extra: data.extra_metadata.clone().unwrap_or_default(),
            is_sender: Some(data.is_sender),
        };
        self.cache.put_complete(hash, item);
        Ok(())
    }

    /// Remember that this node is not party to `hash`, unless the payload is already known
    pub fn check_and_add_empty(&self, hash: EncryptedPayloadHash) {
        if self.cache.mark_empty(hash) {
            debug!(%hash, "qlight: cached empty payload marker");
        }
    }

    async fn fetch_from_server(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        let caller = self.rpc.read().clone().ok_or(PtmError::NotReady)?;
        info!(%hash, "qlight: no private data in ptm cache, retrieving from qlight server node");
        let value = caller
            .call(GET_QUORUM_PAYLOAD_EXTRA, vec![Value::String(hash.to_hex())])
            .await?;
        let result: QuorumPayloadExtra = serde_json::from_value(value).map_err(|e| PtmError::Decode {
            method: "RPC".to_string(),
            path: GET_QUORUM_PAYLOAD_EXTRA.to_string(),
            reason: e.to_string(),
        })?;
        if result.payload.len() <= 3 {
            return Ok(None);
        }

        let payload = serde_hex::decode(&result.payload)
            .map_err(|e| PtmError::InvalidPayload(format!("unable to decode payload for {}. Cause: {}", hash, e)))?;
        if let Err(e) = self.cache(*hash, &result) {
            warn!(%hash, error = %e, "unable to cache ptm data");
        }
        Ok(Some(PrivatePayload::new(payload, result.extra_metadata.unwrap_or_default())))
    }
}

impl Default for CachingProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrivateTransactionManager for CachingProxy {
    fn name(&self) -> &'static str {
        "CachingP2PProxy"
    }

    fn has_feature(&self, feature: PtmFeature) -> bool {
        self.features.has_feature(feature)
    }

    async fn send(
        &self,
        _payload: &[u8],
        _from: &str,
        _to: &[String],
        _extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash> {
        Err(PtmError::NotSupported)
    }

    async fn store_raw(&self, _payload: &[u8], _from: &str) -> PtmResult<EncryptedPayloadHash> {
        Err(PtmError::NotSupported)
    }

    async fn send_signed_tx(
        &self,
        _hash: &EncryptedPayloadHash,
        _to: &[String],
        _extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        Err(PtmError::NotSupported)
    }

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        if hash.is_empty() {
            return Ok(None);
        }
        match self.cache.get(hash) {
            Some(CacheEntry::Empty) => Ok(None),
            Some(CacheEntry::Incomplete(item)) | Some(CacheEntry::Complete(item)) => {
                Ok(Some(PrivatePayload::new(item.payload, item.extra)))
            }
            None => self.fetch_from_server(hash).await,
        }
    }

    async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        self.receive(hash).await
    }

    async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        self.receive(hash).await?;
        let is_sender = self
            .cache
            .get(hash)
            .and_then(|entry| entry.item().and_then(|item| item.is_sender))
            .unwrap_or(false);
        Ok(is_sender)
    }

    async fn get_participants(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        Err(PtmError::NotSupported)
    }

    async fn get_mandatory(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        Err(PtmError::NotSupported)
    }

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>> {
        Err(PtmError::NotSupported)
    }
}
