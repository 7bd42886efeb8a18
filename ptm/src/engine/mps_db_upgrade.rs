use async_trait::async_trait;
use std::sync::Arc;

use pvt_common::{
    EncryptedPayloadHash, ExtraMetadata, PrivacyGroup, PrivateStateIdentifier, PtmResult, PRIVACY_GROUP_LEGACY,
};

use super::{PrivatePayload, PrivateTransactionManager, PtmFeature};

/// Wraps a real adapter while the database is upgraded to multiple private states.
///
/// Reports a single legacy `private` group and claims multiple private state
/// support so that the upgrade path resolves everything to that one state.
pub struct MpsDbUpgrade {
    inner: Arc<dyn PrivateTransactionManager>,
}

impl MpsDbUpgrade {
    pub fn new(inner: Arc<dyn PrivateTransactionManager>) -> Self {
        Self { inner }
    }

    fn legacy_group() -> PrivacyGroup {
        PrivacyGroup {
            group_type: PRIVACY_GROUP_LEGACY.to_string(),
            name: PrivateStateIdentifier::DEFAULT.to_string(),
            privacy_group_id: PrivateStateIdentifier::DEFAULT.to_string(),
            description: "private".to_string(),
            from: String::new(),
            members: Vec::new(),
        }
    }
}

#[async_trait]
impl PrivateTransactionManager for MpsDbUpgrade {
    fn name(&self) -> &'static str {
        "MPSDatabaseUpgrade"
    }

    fn has_feature(&self, feature: PtmFeature) -> bool {
        feature == PtmFeature::MultiplePrivateStates || self.inner.has_feature(feature)
    }

    async fn send(
        &self,
        payload: &[u8],
        from: &str,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash> {
        self.inner.send(payload, from, to, extra).await
    }

    async fn store_raw(&self, payload: &[u8], from: &str) -> PtmResult<EncryptedPayloadHash> {
        self.inner.store_raw(payload, from).await
    }

    async fn send_signed_tx(
        &self,
        hash: &EncryptedPayloadHash,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        self.inner.send_signed_tx(hash, to, extra).await
    }

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        self.inner.receive(hash).await
    }

    async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        self.inner.receive_raw(hash).await
    }

    async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        self.inner.is_sender(hash).await
    }

    async fn get_participants(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        self.inner.get_participants(hash).await
    }

    async fn get_mandatory(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        self.inner.get_mandatory(hash).await
    }

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>> {
        Ok(vec![Self::legacy_group()])
    }
}
