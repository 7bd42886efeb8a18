//! Private transaction manager adapters behind one capability interface.

pub mod caching_proxy;
pub mod constellation;
pub mod mps_db_upgrade;
pub mod not_in_use;
pub mod tessera;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use pvt_common::{EncryptedPayloadHash, ExtraMetadata, PrivacyGroup, PtmResult};

pub use caching_proxy::{CachingProxy, RpcCaller};
pub use constellation::ConstellationClient;
pub use mps_db_upgrade::MpsDbUpgrade;
pub use not_in_use::NotInUse;
pub use tessera::TesseraClient;

/// Optional PTM capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtmFeature {
    PrivacyEnhancements,
    MultiTenancy,
    MultiplePrivateStates,
    MandatoryRecipients,
}

impl PtmFeature {
    fn bit(self) -> u64 {
        match self {
            PtmFeature::PrivacyEnhancements => 1,
            PtmFeature::MultiTenancy => 1 << 1,
            PtmFeature::MultiplePrivateStates => 1 << 2,
            PtmFeature::MandatoryRecipients => 1 << 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet(u64);

impl FeatureSet {
    pub fn new(features: &[PtmFeature]) -> Self {
        Self(features.iter().fold(0, |all, f| all | f.bit()))
    }

    pub fn has_feature(&self, feature: PtmFeature) -> bool {
        self.0 & feature.bit() != 0
    }
}

/// Decrypted private payload with its sidecar metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivatePayload {
    pub payload: Vec<u8>,
    pub extra: ExtraMetadata,
}

impl PrivatePayload {
    pub fn new(payload: Vec<u8>, extra: ExtraMetadata) -> Self {
        Self { payload, extra }
    }

    pub fn sender(&self) -> &str {
        &self.extra.sender
    }

    pub fn managed_parties(&self) -> &[String] {
        &self.extra.managed_parties
    }
}

/// Operations every PTM adapter exposes.
///
/// `receive` and `receive_raw` return `Ok(None)` when the node holds no payload
/// for the hash, including the zero hash. Transport failures are always errors.
#[async_trait]
pub trait PrivateTransactionManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_feature(&self, feature: PtmFeature) -> bool;

    async fn send(
        &self,
        payload: &[u8],
        from: &str,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash>;

    async fn store_raw(&self, payload: &[u8], from: &str) -> PtmResult<EncryptedPayloadHash>;

    async fn send_signed_tx(
        &self,
        hash: &EncryptedPayloadHash,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>>;

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>>;

    /// Payload without metadata, paired with a later `send_signed_tx`
    async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>>;

    async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool>;

    async fn get_participants(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>>;

    async fn get_mandatory(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>>;

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>>;
}

/// The closed set of adapters a node can run with
pub enum PtmAdapter {
    Tessera(TesseraClient),
    Constellation(ConstellationClient),
    CachingProxy(CachingProxy),
    NotInUse(NotInUse),
    MpsDbUpgrade(MpsDbUpgrade),
}

impl fmt::Debug for PtmAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PtmAdapter({})", self.name())
    }
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            PtmAdapter::Tessera($adapter) => $call,
            PtmAdapter::Constellation($adapter) => $call,
            PtmAdapter::CachingProxy($adapter) => $call,
            PtmAdapter::NotInUse($adapter) => $call,
            PtmAdapter::MpsDbUpgrade($adapter) => $call,
        }
    };
}

impl PtmAdapter {
    pub fn into_shared(self) -> Arc<dyn PrivateTransactionManager> {
        Arc::new(self)
    }

    /// False only for the not-in-use adapter
    pub fn is_privacy_enabled(&self) -> bool {
        !matches!(self, PtmAdapter::NotInUse(_))
    }
}

#[async_trait]
impl PrivateTransactionManager for PtmAdapter {
    fn name(&self) -> &'static str {
        dispatch!(self, a => a.name())
    }

    fn has_feature(&self, feature: PtmFeature) -> bool {
        dispatch!(self, a => a.has_feature(feature))
    }

    async fn send(
        &self,
        payload: &[u8],
        from: &str,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<EncryptedPayloadHash> {
        dispatch!(self, a => a.send(payload, from, to, extra).await)
    }

    async fn store_raw(&self, payload: &[u8], from: &str) -> PtmResult<EncryptedPayloadHash> {
        dispatch!(self, a => a.store_raw(payload, from).await)
    }

    async fn send_signed_tx(
        &self,
        hash: &EncryptedPayloadHash,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        dispatch!(self, a => a.send_signed_tx(hash, to, extra).await)
    }

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        dispatch!(self, a => a.receive(hash).await)
    }

    async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        dispatch!(self, a => a.receive_raw(hash).await)
    }

    async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        dispatch!(self, a => a.is_sender(hash).await)
    }

    async fn get_participants(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        dispatch!(self, a => a.get_participants(hash).await)
    }

    async fn get_mandatory(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        dispatch!(self, a => a.get_mandatory(hash).await)
    }

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>> {
        dispatch!(self, a => a.groups().await)
    }
}

/// `/transaction/{key}` path segment for a payload hash
pub(crate) fn transaction_path(hash: &EncryptedPayloadHash) -> String {
    format!("/transaction/{}", urlencoding::encode(&hash.to_base64()))
}

/// Split a comma separated key list as the PTM returns it
pub(crate) fn split_keys(body: &str) -> Vec<String> {
    body.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set() {
        let features = FeatureSet::new(&[PtmFeature::PrivacyEnhancements, PtmFeature::MultiplePrivateStates]);
        assert!(features.has_feature(PtmFeature::PrivacyEnhancements));
        assert!(features.has_feature(PtmFeature::MultiplePrivateStates));
        assert!(!features.has_feature(PtmFeature::MultiTenancy));
        assert!(!FeatureSet::default().has_feature(PtmFeature::MandatoryRecipients));
    }

    #[test]
    fn test_transaction_path_escapes_base64() {
        let hash = EncryptedPayloadHash::from_slice(&[0xfb; 64]);
        let path = transaction_path(&hash);
        assert!(path.starts_with("/transaction/"));
        assert_eq!(path.matches('/').count(), 2);
        assert!(!path.contains('+'));
    }

    #[test]
    fn test_split_keys() {
        assert_eq!(split_keys("a, b,,c"), vec!["a", "b", "c"]);
        assert!(split_keys("").is_empty());
    }

    #[tokio::test]
    async fn test_adapter_dispatch() {
        let adapter = PtmAdapter::NotInUse(NotInUse);
        assert_eq!(adapter.name(), "NotInUse");
        assert!(!adapter.is_privacy_enabled());
        assert_eq!(adapter.receive(&EncryptedPayloadHash::from_slice(b"tx")).await, Ok(None));
        assert!(adapter.is_sender(&EncryptedPayloadHash::from_slice(b"tx")).await.is_err());
    }
}
