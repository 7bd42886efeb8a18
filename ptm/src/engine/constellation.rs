use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use pvt_common::{
    decode_ac_hashes, decode_exec_hash, EncryptedPayloadHash, ExtraMetadata, PrivacyGroup, PtmError, PtmResult,
};

use super::{split_keys, FeatureSet, PrivatePayload, PrivateTransactionManager, PtmFeature};
use crate::cache::{CacheEntry, PayloadCache, PrivateCacheItem};
use crate::transport::{PtmClient, PtmRequest, PtmResponse};

/// Adapter for legacy constellation nodes, which predate privacy enhancements
pub struct ConstellationClient {
    client: PtmClient,
    features: FeatureSet,
    cache: PayloadCache,
}

impl ConstellationClient {
    pub fn new(client: PtmClient) -> Self {
        Self {
            client,
            features: FeatureSet::default(),
            cache: PayloadCache::new(),
        }
    }

    fn decode_hash_body(response: &PtmResponse) -> PtmResult<Vec<u8>> {
        BASE64
            .decode(response.body.as_ref())
            .map_err(|e| PtmError::InvalidPayload(format!("unable to decode encrypted payload hash. Cause: {}", e)))
    }

    fn metadata_headers(request: PtmRequest, extra: &ExtraMetadata) -> PtmRequest {
        request
            .header("c11n-ACT", extra.ac_hashes_base64().join(","))
            .header("c11n-EH", extra.ac_merkle_root.to_base64())
    }
}

#[async_trait]
impl PrivateTransactionManager for ConstellationClient {
    fn name(&self) -> &'static str {
        "Constellation"
    }

    fn has_feature(&self, feature: PtmFeature) -> bool {
        self.features.has_feature(feature)
    }

    async fn send(
        &self,
        payload: &[u8],
        from: &str,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash> {
        if !extra.privacy_flag.is_standard_private() {
            return Err(PtmError::DoesNotSupportPrivacyEnhancements);
        }
        let mut request = PtmRequest::post("/sendraw", payload.to_vec())
            .header("c11n-to", to.join(","))
            .header("Content-Type", "application/octet-stream");
        if !from.is_empty() {
            request = request.header("c11n-from", from);
        }
        let request = Self::metadata_headers(request, extra);

        let response = self.client.execute(request).await?.error_for_status()?;
        let hash = EncryptedPayloadHash::from_slice(&Self::decode_hash_body(&response)?);
        self.cache
            .put_complete(hash, PrivateCacheItem::new(payload.to_vec(), extra.clone()));
        Ok(hash)
    }

    async fn store_raw(&self, _payload: &[u8], _from: &str) -> PtmResult<EncryptedPayloadHash> {
        Err(PtmError::NotSupported)
    }

    async fn send_signed_tx(
        &self,
        hash: &EncryptedPayloadHash,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        if !extra.privacy_flag.is_standard_private() {
            return Err(PtmError::DoesNotSupportPrivacyEnhancements);
        }
        let request = PtmRequest::post("/sendsignedtx", hash.as_bytes().to_vec())
            .header("c11n-to", to.join(","))
            .header("Content-Type", "application/octet-stream");
        let request = Self::metadata_headers(request, extra);

        let response = self.client.execute(request).await?.error_for_status()?;
        Self::decode_hash_body(&response)
    }

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        if hash.is_empty() {
            return Ok(None);
        }
        if let Some(CacheEntry::Complete(item)) = self.cache.get(hash) {
            return Ok(Some(PrivatePayload::new(item.payload, item.extra)));
        }

        let request = PtmRequest::get("/receiveraw").header("c11n-key", hash.to_base64());
        let response = self.client.execute(request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.error_for_status()?;

        let ac_hashes = decode_ac_hashes(&split_keys(response.header("c11n-ACT").unwrap_or_default()))
            .map_err(|e| PtmError::InvalidPayload(e.to_string()))?;
        let ac_merkle_root = decode_exec_hash(response.header("c11n-EH").unwrap_or_default())
            .map_err(|e| PtmError::InvalidPayload(e.to_string()))?;
        let extra = ExtraMetadata {
            ac_hashes,
            ac_merkle_root,
            ..Default::default()
        };
        let payload = response.body.to_vec();

        self.cache
            .put_complete(*hash, PrivateCacheItem::new(payload.clone(), extra.clone()));
        Ok(Some(PrivatePayload::new(payload, extra)))
    }

    async fn receive_raw(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        Err(PtmError::NotSupported)
    }

    async fn is_sender(&self, _hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        Err(PtmError::NotSupported)
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
