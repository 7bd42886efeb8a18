use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::error::SerializationError;
use crate::hash::{EncryptedPayloadHash, Hash};

pub const PRIVACY_GROUP_RESIDENT: &str = "RESIDENT";
pub const PRIVACY_GROUP_LEGACY: &str = "LEGACY";
pub const PRIVACY_GROUP_PANTHEON: &str = "PANTHEON";

/// Set of affected contract transaction hashes
pub type EncryptedPayloadHashes = BTreeSet<EncryptedPayloadHash>;

/// Privacy mode attached to a private transaction.
///
/// The numeric values are the PTM wire values. State validation carries the
/// party-protection bit, so `has_party_protection` holds for it as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum PrivacyFlag {
    #[default]
    StandardPrivate,
    PartyProtection,
    MandatoryRecipients,
    StateValidation,
}

impl PrivacyFlag {
    const PARTY_PROTECTION_BIT: u64 = 1;

    pub fn bits(self) -> u64 {
        match self {
            PrivacyFlag::StandardPrivate => 0,
            PrivacyFlag::PartyProtection => 1,
            PrivacyFlag::MandatoryRecipients => 2,
            PrivacyFlag::StateValidation => 3,
        }
    }

    pub fn is_standard_private(self) -> bool {
        self == PrivacyFlag::StandardPrivate
    }

    pub fn has_party_protection(self) -> bool {
        self.bits() & Self::PARTY_PROTECTION_BIT == Self::PARTY_PROTECTION_BIT
    }

    pub fn requires_mandatory_recipients(self) -> bool {
        self == PrivacyFlag::MandatoryRecipients
    }
}

impl TryFrom<u64> for PrivacyFlag {
    type Error = SerializationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PrivacyFlag::StandardPrivate),
            1 => Ok(PrivacyFlag::PartyProtection),
            2 => Ok(PrivacyFlag::MandatoryRecipients),
            3 => Ok(PrivacyFlag::StateValidation),
            other => Err(SerializationError::InvalidPrivacyFlag(other)),
        }
    }
}

impl From<PrivacyFlag> for u64 {
    fn from(flag: PrivacyFlag) -> Self {
        flag.bits()
    }
}

/// Sidecar metadata the PTM carries alongside a private payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraMetadata {
    /// Hashes of affected contract transactions
    #[serde(rename = "ACHashes", default)]
    pub ac_hashes: EncryptedPayloadHashes,
    /// Root of the merkle trie of affected contract accounts
    #[serde(rename = "ACMerkleRoot", default)]
    pub ac_merkle_root: Hash,
    #[serde(rename = "PrivacyFlag", default)]
    pub privacy_flag: PrivacyFlag,
    /// Participants managed by the local PTM
    #[serde(rename = "ManagedParties", default)]
    pub managed_parties: Vec<String>,
    #[serde(rename = "Sender", default)]
    pub sender: String,
    #[serde(rename = "MandatoryRecipients", default)]
    pub mandatory_recipients: Vec<String>,
}

impl ExtraMetadata {
    pub fn with_privacy_flag(privacy_flag: PrivacyFlag) -> Self {
        Self {
            privacy_flag,
            ..Default::default()
        }
    }

    /// Affected contract hashes in the PTM's base64 wire form
    pub fn ac_hashes_base64(&self) -> Vec<String> {
        self.ac_hashes.iter().map(|h| h.to_base64()).collect()
    }

    /// Merkle root in base64, empty when unset
    pub fn ac_merkle_root_base64(&self) -> String {
        if self.ac_merkle_root.is_zero() {
            String::new()
        } else {
            self.ac_merkle_root.to_base64()
        }
    }
}

/// Decode the PTM's base64 affected-contract list, skipping blank entries
pub fn decode_ac_hashes(encoded: &[String]) -> Result<EncryptedPayloadHashes, SerializationError> {
    encoded
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| EncryptedPayloadHash::from_base64(s.trim()))
        .collect()
}

/// Decode the PTM's base64 execution hash; empty means unset
pub fn decode_exec_hash(encoded: &str) -> Result<Hash, SerializationError> {
    if encoded.is_empty() {
        return Ok(Hash::default());
    }
    Hash::from_base64(encoded)
}

/// Privacy group as reported by the PTM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyGroup {
    #[serde(rename = "type")]
    pub group_type: String,
    pub name: String,
    pub privacy_group_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Payload plus metadata exchanged with a qlight server over RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPayloadExtra {
    /// 0x-prefixed hex payload
    #[serde(rename = "Payload")]
    pub payload: String,
    #[serde(rename = "ExtraMetaData")]
    pub extra_metadata: Option<ExtraMetadata>,
    #[serde(rename = "IsSender")]
    pub is_sender: bool,
}

/// Identifier of a logical private state partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateStateIdentifier(pub String);

impl PrivateStateIdentifier {
    pub const DEFAULT: &'static str = "private";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_psi() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrivateStateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrivateStateIdentifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivateStateType {
    Resident,
    Legacy,
    Pantheon,
}

impl PrivateStateType {
    /// Map a PTM group type string; anything unrecognised is resident
    pub fn from_group_type(group_type: &str) -> Self {
        match group_type {
            PRIVACY_GROUP_LEGACY => PrivateStateType::Legacy,
            PRIVACY_GROUP_PANTHEON => PrivateStateType::Pantheon,
            _ => PrivateStateType::Resident,
        }
    }
}

/// Node-side view of a privacy group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateStateMetadata {
    pub id: PrivateStateIdentifier,
    pub name: String,
    pub description: String,
    pub state_type: PrivateStateType,
    /// Member keys, in the order the PTM reports them
    pub addresses: Vec<String>,
    address_index: HashSet<String>,
}

impl PrivateStateMetadata {
    pub fn new(
        id: PrivateStateIdentifier,
        name: impl Into<String>,
        description: impl Into<String>,
        state_type: PrivateStateType,
        addresses: Vec<String>,
    ) -> Self {
        let address_index = addresses.iter().cloned().collect();
        Self {
            id,
            name: name.into(),
            description: description.into(),
            state_type,
            addresses,
            address_index,
        }
    }

    /// The single private state of a node without multiple private states
    pub fn default_state() -> Self {
        Self::new(
            PrivateStateIdentifier::default_psi(),
            "private",
            "legacy private state",
            PrivateStateType::Resident,
            Vec::new(),
        )
    }

    pub fn from_group(group: &PrivacyGroup) -> Self {
        Self::new(
            PrivateStateIdentifier::new(group.privacy_group_id.clone()),
            group.name.clone(),
            group.description.clone(),
            PrivateStateType::from_group_type(&group.group_type),
            group.members.clone(),
        )
    }

    pub fn includes(&self, address: &str) -> bool {
        self.address_index.contains(address)
    }

    /// True when none of `addresses` is a member of this state
    pub fn not_include_any(&self, addresses: &[String]) -> bool {
        !addresses.iter().any(|a| self.includes(a))
    }

    /// Members of `addresses` that belong to this state, in input order.
    ///
    /// A state without an address list (the legacy single state) owns every key
    /// managed by the node, so nothing is filtered out.
    pub fn filter_addresses(&self, addresses: &[String]) -> Vec<String> {
        if self.address_index.is_empty() {
            return addresses.to_vec();
        }
        addresses.iter().filter(|a| self.includes(a)).cloned().collect()
    }
}

impl fmt::Display for PrivateStateMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID={},Name={},Desc={},Type={:?},Addresses={:?}",
            self.id, self.name, self.description, self.state_type, self.addresses
        )
    }
}

/// Decode a base64 resident group id back into its raw form
pub fn decode_group_id(encoded: &str) -> Result<String, SerializationError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| SerializationError::InvalidFormat(format!("group id {}: {}", encoded, e)))?;
    String::from_utf8(bytes).map_err(|e| SerializationError::InvalidFormat(format!("group id {}: {}", encoded, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Public,
    /// Standard private transaction whose data is an encrypted payload hash
    Private,
    /// Public transaction whose data references an inner private transaction
    PrivacyMarker,
}

/// Minimal transaction view needed to locate private payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub kind: TransactionKind,
    #[serde(with = "crate::serde_hex")]
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn is_private(&self) -> bool {
        self.kind == TransactionKind::Private
    }

    pub fn is_privacy_marker(&self) -> bool {
        self.kind == TransactionKind::PrivacyMarker
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Minimal block view: identity, public state root and transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: Hash,
    /// Public state root
    pub root: Hash,
    pub transactions: Vec<Transaction>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(number={}, hash={}, txs={})", self.number, self.hash, self.transactions.len())
    }
}

/// Request-scoped values consulted when resolving private state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    psi: Option<PrivateStateIdentifier>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_psi(psi: impl Into<PrivateStateIdentifier>) -> Self {
        Self { psi: Some(psi.into()) }
    }

    /// The request's PSI, or `private` when none was attached
    pub fn psi(&self) -> PrivateStateIdentifier {
        self.psi.clone().unwrap_or_else(PrivateStateIdentifier::default_psi)
    }
}

impl From<String> for PrivateStateIdentifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}
