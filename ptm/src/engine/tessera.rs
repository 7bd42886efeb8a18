use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, warn};

use pvt_common::{
    decode_ac_hashes, decode_exec_hash, EncryptedPayloadHash, ExtraMetadata, PrivacyFlag, PrivacyGroup, PtmError,
    PtmResult,
};

use super::{split_keys, transaction_path, FeatureSet, PrivatePayload, PrivateTransactionManager, PtmFeature};
use crate::cache::{CacheEntry, PayloadCache, PrivateCacheItem};
use crate::transport::{HttpMethod, PtmClient, PtmRequest};

/// API version assumed when the PTM does not report one
pub const DEFAULT_API_VERSION: &str = "1.0";

/// Dotted PTM API version, compared component-wise
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PtmVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl PtmVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `major[.minor[.patch]]`; an empty string is rejected
    pub fn parse(version: &str) -> Result<Self, String> {
        let version = version.trim();
        if version.is_empty() {
            return Err("empty version".to_string());
        }
        let mut parts = [0u64; 3];
        for (i, component) in version.split('.').enumerate() {
            if i >= parts.len() {
                break;
            }
            parts[i] = component
                .parse()
                .map_err(|e| format!("invalid version component {:?} in {}: {}", component, version, e))?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl PartialOrd for PtmVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PtmVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for PtmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

const PRIVACY_ENHANCEMENTS_VERSION: PtmVersion = PtmVersion::new(2, 0, 0);
const MULTI_TENANCY_VERSION: PtmVersion = PtmVersion::new(2, 1, 0);
const MULTIPLE_PRIVATE_STATES_VERSION: PtmVersion = PtmVersion::new(3, 0, 0);
const MANDATORY_RECIPIENTS_VERSION: PtmVersion = PtmVersion::new(4, 0, 0);

/// Features a tessera API version supports
pub fn tessera_version_features(version: PtmVersion) -> FeatureSet {
    let table = [
        (PRIVACY_ENHANCEMENTS_VERSION, PtmFeature::PrivacyEnhancements),
        (MULTI_TENANCY_VERSION, PtmFeature::MultiTenancy),
        (MULTIPLE_PRIVATE_STATES_VERSION, PtmFeature::MultiplePrivateStates),
        (MANDATORY_RECIPIENTS_VERSION, PtmFeature::MandatoryRecipients),
    ];
    let features: Vec<PtmFeature> = table
        .iter()
        .filter(|(min, _)| version >= *min)
        .map(|(_, feature)| *feature)
        .collect();
    FeatureSet::new(&features)
}

/// Highest parseable version advertised on `/version/api`, `1.0` if none
pub async fn retrieve_api_version(client: &PtmClient) -> String {
    let versions: Vec<String> = match client.submit_json::<(), _>(HttpMethod::Get, "/version/api", None).await {
        Ok(versions) => versions,
        Err(e) => {
            debug!(error = %e, "unable to retrieve tessera api version, assuming {}", DEFAULT_API_VERSION);
            return DEFAULT_API_VERSION.to_string();
        }
    };
    versions
        .into_iter()
        .filter_map(|v| PtmVersion::parse(&v).ok().map(|parsed| (parsed, v)))
        .max_by_key(|(parsed, _)| *parsed)
        .map(|(_, raw)| raw)
        .unwrap_or_else(|| DEFAULT_API_VERSION.to_string())
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    #[serde(with = "base64_bytes")]
    payload: &'a [u8],
    #[serde(skip_serializing_if = "str::is_empty")]
    from: &'a str,
    to: &'a [String],
    affected_contract_transactions: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    exec_hash: String,
    privacy_flag: PrivacyFlag,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    mandatory_recipients: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreRawRequest<'a> {
    #[serde(with = "base64_bytes")]
    payload: &'a [u8],
    #[serde(skip_serializing_if = "str::is_empty")]
    from: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendSignedTxRequest<'a> {
    #[serde(with = "base64_bytes")]
    hash: &'a [u8],
    to: &'a [String],
    affected_contract_transactions: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    exec_hash: String,
    privacy_flag: PrivacyFlag,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    mandatory_recipients: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyResponse {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveResponse {
    #[serde(with = "base64_bytes", default)]
    payload: Vec<u8>,
    #[serde(default)]
    affected_contract_transactions: Vec<String>,
    #[serde(default)]
    exec_hash: String,
    #[serde(default)]
    privacy_flag: PrivacyFlag,
    #[serde(default)]
    managed_parties: Vec<String>,
    #[serde(default)]
    sender_key: String,
    #[serde(default)]
    mandatory_recipients: Vec<String>,
}

impl ReceiveResponse {
    fn extra_metadata(&self) -> PtmResult<ExtraMetadata> {
        let ac_hashes = decode_ac_hashes(&self.affected_contract_transactions).map_err(|e| {
            PtmError::InvalidPayload(format!(
                "unable to decode ACOTHs {:?}. Cause: {}",
                self.affected_contract_transactions, e
            ))
        })?;
        let ac_merkle_root = decode_exec_hash(&self.exec_hash).map_err(|e| {
            PtmError::InvalidPayload(format!("unable to decode execution hash {}. Cause: {}", self.exec_hash, e))
        })?;
        Ok(ExtraMetadata {
            ac_hashes,
            ac_merkle_root,
            privacy_flag: self.privacy_flag,
            managed_parties: self.managed_parties.clone(),
            sender: self.sender_key.clone(),
            mandatory_recipients: self.mandatory_recipients.clone(),
        })
    }
}

fn decode_key(key: &str) -> PtmResult<EncryptedPayloadHash> {
    EncryptedPayloadHash::from_base64(key)
        .map_err(|e| PtmError::InvalidPayload(format!("unable to decode encrypted payload hash: {}. Cause: {}", key, e)))
}

/// Adapter for tessera, with features negotiated from its API version
pub struct TesseraClient {
    client: PtmClient,
    version: PtmVersion,
    features: FeatureSet,
    cache: PayloadCache,
}

impl TesseraClient {
    pub fn new(client: PtmClient, version: &str) -> Self {
        let parsed = PtmVersion::parse(version).unwrap_or_else(|e| {
            warn!(version, error = %e, "unable to parse tessera version, transaction manager features unavailable");
            PtmVersion::default()
        });
        Self {
            client,
            version: parsed,
            features: tessera_version_features(parsed),
            cache: PayloadCache::new(),
        }
    }

    pub fn with_cache(mut self, cache: PayloadCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn version(&self) -> PtmVersion {
        self.version
    }

    pub fn cache(&self) -> &PayloadCache {
        &self.cache
    }

    fn check_privacy_flag(&self, flag: PrivacyFlag) -> PtmResult<()> {
        if !flag.is_standard_private() && !self.features.has_feature(PtmFeature::PrivacyEnhancements) {
            return Err(PtmError::DoesNotSupportPrivacyEnhancements);
        }
        if flag.requires_mandatory_recipients() && !self.features.has_feature(PtmFeature::MandatoryRecipients) {
            return Err(PtmError::DoesNotSupportMandatoryRecipients);
        }
        Ok(())
    }

    /// Pre privacy-enhancement `/sendsignedtx` taking the raw hash as octet stream
    async fn send_signed_octet_stream(&self, hash: &EncryptedPayloadHash, to: &[String]) -> PtmResult<String> {
        let request = PtmRequest::post("/sendsignedtx", hash.as_bytes().to_vec())
            .header("c11n-to", to.join(","))
            .header("Content-Type", "application/octet-stream");
        let response = self.client.execute(request).await?.error_for_status()?;
        Ok(response.text())
    }

    async fn receive_from_ptm(&self, hash: &EncryptedPayloadHash, raw: bool) -> PtmResult<Option<ReceiveResponse>> {
        let path = format!("{}?isRaw={}", transaction_path(hash), raw);
        match self.client.submit_json::<(), ReceiveResponse>(HttpMethod::Get, &path, None).await {
            Ok(response) => Ok(Some(response)),
            Err(PtmError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_key_list(&self, path: String) -> PtmResult<Vec<String>> {
        let response = self.client.get(path).await?.error_for_status()?;
        Ok(split_keys(&response.text()))
    }
}

#[async_trait]
impl PrivateTransactionManager for TesseraClient {
    fn name(&self) -> &'static str {
        "Tessera"
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
        self.check_privacy_flag(extra.privacy_flag)?;
        let request = SendRequest {
            payload,
            from,
            to,
            affected_contract_transactions: extra.ac_hashes_base64(),
            exec_hash: extra.ac_merkle_root_base64(),
            privacy_flag: extra.privacy_flag,
            mandatory_recipients: &extra.mandatory_recipients,
        };
        let response: KeyResponse = self.client.submit_json(HttpMethod::Post, "/send", Some(&request)).await?;
        let hash = decode_key(&response.key)?;

        self.cache
            .put_complete(hash, PrivateCacheItem::new(payload.to_vec(), extra.clone()));
        Ok(hash)
    }

    async fn store_raw(&self, payload: &[u8], from: &str) -> PtmResult<EncryptedPayloadHash> {
        let request = StoreRawRequest { payload, from };
        let response: KeyResponse = self.client.submit_json(HttpMethod::Post, "/storeraw", Some(&request)).await?;
        let hash = decode_key(&response.key)?;

        self.cache
            .put_incomplete(hash, PrivateCacheItem::new(payload.to_vec(), ExtraMetadata::default()));
        Ok(hash)
    }

    async fn send_signed_tx(
        &self,
        hash: &EncryptedPayloadHash,
        to: &[String],
        extra: &ExtraMetadata,
    ) -> PtmResult<Vec<u8>> {
        self.check_privacy_flag(extra.privacy_flag)?;
        let key = if self.features.has_feature(PtmFeature::PrivacyEnhancements) {
            let request = SendSignedTxRequest {
                hash: hash.as_bytes(),
                to,
                affected_contract_transactions: extra.ac_hashes_base64(),
                exec_hash: extra.ac_merkle_root_base64(),
                privacy_flag: extra.privacy_flag,
                mandatory_recipients: &extra.mandatory_recipients,
            };
            let response: KeyResponse = self
                .client
                .submit_json(HttpMethod::Post, "/sendsignedtx", Some(&request))
                .await?;
            response.key
        } else {
            self.send_signed_octet_stream(hash, to).await?
        };

        let returned = decode_key(&key)?;
        if self.cache.complete(*hash, extra.clone()) {
            debug!(hash = %hash, "completed cached payload after send signed tx");
        }
        Ok(returned.as_bytes().to_vec())
    }

    async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        if hash.is_empty() {
            return Ok(None);
        }
        if let Some(CacheEntry::Complete(item)) = self.cache.get(hash) {
            return Ok(Some(PrivatePayload::new(item.payload, item.extra)));
        }

        let Some(response) = self.receive_from_ptm(hash, false).await? else {
            return Ok(None);
        };
        let extra = response.extra_metadata()?;
        self.cache
            .put_complete(*hash, PrivateCacheItem::new(response.payload.clone(), extra.clone()));
        Ok(Some(PrivatePayload::new(response.payload, extra)))
    }

    async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>> {
        if hash.is_empty() {
            return Ok(None);
        }
        match self.cache.get(hash) {
            Some(CacheEntry::Incomplete(item)) | Some(CacheEntry::Complete(item)) => {
                return Ok(Some(PrivatePayload::new(item.payload, item.extra)));
            }
            _ => {}
        }

        let Some(response) = self.receive_from_ptm(hash, true).await? else {
            return Ok(None);
        };
        // raw responses carry no usable metadata beyond the sender
        let extra = ExtraMetadata {
            sender: response.sender_key.clone(),
            ..Default::default()
        };
        self.cache
            .put_incomplete(*hash, PrivateCacheItem::new(response.payload.clone(), extra.clone()));
        Ok(Some(PrivatePayload::new(response.payload, extra)))
    }

    async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool> {
        let path = format!("{}/isSender", transaction_path(hash));
        let response = self.client.get(path.clone()).await?.error_for_status()?;
        let body = response.text();
        body.trim().parse::<bool>().map_err(|e| PtmError::Decode {
            method: HttpMethod::Get.to_string(),
            path,
            reason: format!("{}: {:?}", e, body),
        })
    }

    async fn get_participants(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        self.get_key_list(format!("{}/participants", transaction_path(hash))).await
    }

    async fn get_mandatory(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>> {
        if !self.features.has_feature(PtmFeature::MandatoryRecipients) {
            return Err(PtmError::DoesNotSupportMandatoryRecipients);
        }
        self.get_key_list(format!("{}/mandatory", transaction_path(hash))).await
    }

    async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>> {
        self.client
            .submit_json::<(), _>(HttpMethod::Get, "/groups/resident", None)
            .await
    }
}
