use async_trait::async_trait;

use pvt_common::{EncryptedPayloadHash, ExtraMetadata, PrivacyGroup, PtmError, PtmResult};

use super::{PrivatePayload, PrivateTransactionManager, PtmFeature};

/// Stand-in for nodes running without a PTM.
///
/// Reads behave as if the node is party to nothing; anything else fails with
/// the not-in-use sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotInUse;

#[async_trait]
impl PrivateTransactionManager for NotInUse {
    fn name(&self) -> &'static str {
        "NotInUse"
    }

    fn has_feature(&self, _feature: PtmFeature) -> bool {
        false
    }

    async fn send(
        &self,
        _payload: &[u8],
        _from: &str,
        _to: &[String],
        _extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash> {
        Err(PtmError::NotInUse)
    }

    async fn store_raw(&self, _payload: &[u8], _from: &str) -> PtmResult<EncryptedPayloadHash> {
        Err(PtmError::NotInUse)
    }

    async fn send_signed_tx(
        &self,
        _hash: &EncryptedPayloadHash,
        _to: &[String],
        _extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        Err(PtmError::NotInUse)
    }

    async fn receive(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        Ok(None)
    }

    async fn receive_raw(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        Err(PtmError::NotInUse)
    }

    async fn is_sender(&self, _hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        Err(PtmError::NotInUse)
    }

    async fn get_participants(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        Err(PtmError::NotInUse)
    }

    async fn get_mandatory(&self, _hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        Err(PtmError::NotInUse)
    }

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>> {
        Err(PtmError::NotInUse)
    }
}
