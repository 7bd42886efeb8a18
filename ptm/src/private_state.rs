//! Private state identifier service and private state managers.
//!
//! A node with multiple private states maps every PTM privacy group to a
//! private state. Other nodes have a single `private` state that owns every
//! managed key.

use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use pvt_common::{
    decode_group_id, EncryptedPayloadHash, ExtraMetadata, Hash, PrivacyError, PrivacyGroup, PrivacyResult,
    PrivateStateError, PrivateStateIdentifier, PrivateStateMetadata, PrivateStateType, PtmResult, RequestContext,
    SerializationError, Transaction, PRIVACY_GROUP_RESIDENT,
};

use crate::engine::{PrivateTransactionManager, PtmFeature};

/// Persisted mapping from a block's public state root to private state roots
pub trait PrivateStateRootStore: Send + Sync {
    fn private_state_root(&self, public_root: &Hash, psi: &PrivateStateIdentifier) -> Option<Hash>;

    fn write_private_state_root(&self, public_root: Hash, psi: PrivateStateIdentifier, private_root: Hash);
}

/// In-memory root store, the state database stand-in for tests and tools
#[derive(Default)]
pub struct MemoryStateRootStore {
    roots: RwLock<HashMap<(Hash, PrivateStateIdentifier), Hash>>,
}

impl MemoryStateRootStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrivateStateRootStore for MemoryStateRootStore {
    fn private_state_root(&self, public_root: &Hash, psi: &PrivateStateIdentifier) -> Option<Hash> {
        self.roots.read().get(&(*public_root, psi.clone())).copied()
    }

    fn write_private_state_root(&self, public_root: Hash, psi: PrivateStateIdentifier, private_root: Hash) {
        self.roots.write().insert((public_root, psi), private_root);
    }
}

/// Private state roots as of one block
#[derive(Clone)]
pub struct PrivateStateRepository {
    block_root: Hash,
    store: Arc<dyn PrivateStateRootStore>,
    is_mps: bool,
}

impl PrivateStateRepository {
    pub fn new(block_root: Hash, store: Arc<dyn PrivateStateRootStore>, is_mps: bool) -> Self {
        Self {
            block_root,
            store,
            is_mps,
        }
    }

    pub fn block_root(&self) -> Hash {
        self.block_root
    }

    pub fn is_mps(&self) -> bool {
        self.is_mps
    }

    pub fn private_state_root(&self, psi: &PrivateStateIdentifier) -> Result<Hash, PrivateStateError> {
        if !self.is_mps && psi.as_str() != PrivateStateIdentifier::DEFAULT {
            return Err(PrivateStateError::UnknownPsi(psi.to_string()));
        }
        self.store
            .private_state_root(&self.block_root, psi)
            .ok_or_else(|| PrivateStateError::RootNotFound(psi.to_string()))
    }
}

#[derive(Default)]
struct GroupIndex {
    by_id: HashMap<PrivateStateIdentifier, Arc<PrivateStateMetadata>>,
    resident_by_key: HashMap<String, Arc<PrivateStateMetadata>>,
}

impl GroupIndex {
    fn build(groups: &[PrivacyGroup]) -> Result<Self, PrivateStateError> {
        let mut index = GroupIndex::default();
        for group in groups {
            let is_resident = group.group_type == PRIVACY_GROUP_RESIDENT;
            let mut group = group.clone();
            if is_resident {
                // resident ids arrive base64 encoded
                group.privacy_group_id =
                    decode_group_id(&group.privacy_group_id).map_err(|e| PrivateStateError::InvalidGroupId {
                        id: group.privacy_group_id.clone(),
                        reason: e.to_string(),
                    })?;
            }

            let metadata = Arc::new(PrivateStateMetadata::from_group(&group));
            if let Some(existing) = index.by_id.get(&metadata.id) {
                return Err(PrivateStateError::GroupIdClash {
                    id: existing.id.to_string(),
                    existing: existing.name.clone(),
                    duplicate: group.name.clone(),
                });
            }
            index.by_id.insert(metadata.id.clone(), Arc::clone(&metadata));

            if is_resident {
                for address in &group.members {
                    if let Some(existing) = index.resident_by_key.get(address) {
                        return Err(PrivateStateError::AddressInMultipleGroups {
                            address: address.clone(),
                            existing: existing.name.clone(),
                            duplicate: group.name.clone(),
                        });
                    }
                    index.resident_by_key.insert(address.clone(), Arc::clone(&metadata));
                }
            }
        }
        Ok(index)
    }
}

/// Resolves managed parties and request PSIs to privacy group backed private states.
///
/// The lookup maps are immutable once built; [`PrivacyGroupResolver::refresh`]
/// builds a fresh pair and swaps it in.
pub struct PrivacyGroupResolver {
    ptm: Arc<dyn PrivateTransactionManager>,
    index: ArcSwap<GroupIndex>,
}

impl PrivacyGroupResolver {
    pub async fn load(ptm: Arc<dyn PrivateTransactionManager>) -> PrivacyResult<Self> {
        let groups = ptm.groups().await?;
        let index = GroupIndex::build(&groups)?;
        info!(groups = index.by_id.len(), "built private state index from ptm privacy groups");
        Ok(Self {
            ptm,
            index: ArcSwap::from_pointee(index),
        })
    }

    /// Rebuild from the PTM's current groups; on failure the previous index stays live
    pub async fn refresh(&self) -> PrivacyResult<()> {
        let groups = self.ptm.groups().await?;
        let index = GroupIndex::build(&groups).map_err(|e| {
            warn!(error = %e, "unable to rebuild private state index, keeping previous groups");
            e
        })?;
        self.index.store(Arc::new(index));
        Ok(())
    }

    pub fn resolve_for_managed_party(&self, managed_party: &str) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        self.index
            .load()
            .resident_by_key
            .get(managed_party)
            .cloned()
            .ok_or_else(|| PrivateStateError::UnknownManagedParty(managed_party.to_string()))
    }

    /// Look the PSI up as given, then base64 decoded, then base64 encoded
    pub fn resolve_for_user_context(&self, ctx: &RequestContext) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        let psi = ctx.psi();
        let index = self.index.load();
        let decoded = BASE64
            .decode(psi.as_str())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let encoded = BASE64.encode(psi.as_str());

        std::iter::once(psi.as_str().to_string())
            .chain(decoded)
            .chain(std::iter::once(encoded))
            .find_map(|candidate| index.by_id.get(&PrivateStateIdentifier::new(candidate)).cloned())
            .ok_or_else(|| PrivateStateError::UnknownPsi(psi.to_string()))
    }

    pub fn psis(&self) -> Vec<PrivateStateIdentifier> {
        let mut psis: Vec<_> = self.index.load().by_id.keys().cloned().collect();
        psis.sort();
        psis
    }
}

/// Private state lookups used by block processing, qlight and RPC
pub trait PrivateStateManager: Send + Sync {
    fn resolve_for_managed_party(&self, managed_party: &str) -> Result<Arc<PrivateStateMetadata>, PrivateStateError>;

    fn resolve_for_user_context(&self, ctx: &RequestContext) -> Result<Arc<PrivateStateMetadata>, PrivateStateError>;

    fn psis(&self) -> Vec<PrivateStateIdentifier>;

    fn not_include_any(&self, psm: &PrivateStateMetadata, managed_parties: &[String]) -> bool;

    fn is_mps(&self) -> bool;

    fn state_repository(&self, block_root: Hash) -> Result<PrivateStateRepository, PrivateStateError>;
}

/// Single `private` state of a node without multiple private states
pub struct DefaultPrivateStateManager {
    metadata: Arc<PrivateStateMetadata>,
    store: Arc<dyn PrivateStateRootStore>,
}

impl DefaultPrivateStateManager {
    pub fn new(store: Arc<dyn PrivateStateRootStore>) -> Self {
        Self {
            metadata: Arc::new(PrivateStateMetadata::default_state()),
            store,
        }
    }
}

impl PrivateStateManager for DefaultPrivateStateManager {
    fn resolve_for_managed_party(&self, _managed_party: &str) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        Ok(Arc::clone(&self.metadata))
    }

    fn resolve_for_user_context(&self, _ctx: &RequestContext) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        Ok(Arc::clone(&self.metadata))
    }

    fn psis(&self) -> Vec<PrivateStateIdentifier> {
        vec![PrivateStateIdentifier::default_psi()]
    }

    fn not_include_any(&self, _psm: &PrivateStateMetadata, _managed_parties: &[String]) -> bool {
        // the single state is party to everything the node receives
        false
    }

    fn is_mps(&self) -> bool {
        false
    }

    fn state_repository(&self, block_root: Hash) -> Result<PrivateStateRepository, PrivateStateError> {
        Ok(PrivateStateRepository::new(block_root, Arc::clone(&self.store), false))
    }
}

/// Privacy group backed private states
pub struct MultiplePrivateStateManager {
    resolver: PrivacyGroupResolver,
    store: Arc<dyn PrivateStateRootStore>,
}

impl MultiplePrivateStateManager {
    pub fn new(resolver: PrivacyGroupResolver, store: Arc<dyn PrivateStateRootStore>) -> Self {
        Self { resolver, store }
    }

    pub fn resolver(&self) -> &PrivacyGroupResolver {
        &self.resolver
    }
}

impl PrivateStateManager for MultiplePrivateStateManager {
    fn resolve_for_managed_party(&self, managed_party: &str) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        self.resolver.resolve_for_managed_party(managed_party)
    }

    fn resolve_for_user_context(&self, ctx: &RequestContext) -> Result<Arc<PrivateStateMetadata>, PrivateStateError> {
        self.resolver.resolve_for_user_context(ctx)
    }

    fn psis(&self) -> Vec<PrivateStateIdentifier> {
        self.resolver.psis()
    }

    fn not_include_any(&self, psm: &PrivateStateMetadata, managed_parties: &[String]) -> bool {
        psm.not_include_any(managed_parties)
    }

    fn is_mps(&self) -> bool {
        true
    }

    fn state_repository(&self, block_root: Hash) -> Result<PrivateStateRepository, PrivateStateError> {
        Ok(PrivateStateRepository::new(block_root, Arc::clone(&self.store), true))
    }
}

/// Pick the manager matching the PTM's capabilities
pub async fn new_private_state_manager(
    ptm: Arc<dyn PrivateTransactionManager>,
    store: Arc<dyn PrivateStateRootStore>,
) -> PrivacyResult<Arc<dyn PrivateStateManager>> {
    if ptm.has_feature(PtmFeature::MultiplePrivateStates) {
        debug!(ptm = ptm.name(), "using multiple private state manager");
        let resolver = PrivacyGroupResolver::load(ptm).await?;
        Ok(Arc::new(MultiplePrivateStateManager::new(resolver, store)))
    } else {
        debug!(ptm = ptm.name(), "using default private state manager");
        Ok(Arc::new(DefaultPrivateStateManager::new(store)))
    }
}

/// Inner private transaction referenced by a privacy marker transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPrivateTransaction {
    pub transaction: Transaction,
    pub managed_parties: Vec<String>,
    pub extra: ExtraMetadata,
}

/// Fetch and decode the private transaction a privacy marker's data points at.
///
/// `Ok(None)` when this node is not party to the inner transaction.
pub async fn fetch_private_transaction(
    data: &[u8],
    ptm: &dyn PrivateTransactionManager,
) -> PrivacyResult<Option<InnerPrivateTransaction>> {
    let hash = EncryptedPayloadHash::from_slice(data);
    let Some(received) = ptm.receive(&hash).await? else {
        return Ok(None);
    };

    let transaction: Transaction = serde_json::from_slice(&received.payload).map_err(|e| {
        trace!(error = %e, "failed to deserialize private transaction");
        PrivacyError::from(SerializationError::from(e))
    })?;
    Ok(Some(InnerPrivateTransaction {
        transaction,
        managed_parties: received.extra.managed_parties.clone(),
        extra: received.extra,
    }))
}

/// Resident groups that contain `managed_party`, used by diagnostics
pub async fn resident_groups_for(
    ptm: &dyn PrivateTransactionManager,
    managed_party: &str,
) -> PtmResult<Vec<PrivacyGroup>> {
    let groups = ptm.groups().await?;
    Ok(groups
        .into_iter()
        .filter(|g| PrivateStateType::from_group_type(&g.group_type) == PrivateStateType::Resident)
        .filter(|g| g.members.iter().any(|m| m == managed_party))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NotInUse, PrivatePayload};
    use async_trait::async_trait;
    use mockall::mock;
    use pvt_common::{PtmError, TransactionKind, PRIVACY_GROUP_LEGACY};

    mock! {
        pub Ptm {}

        #[async_trait]
        impl PrivateTransactionManager for Ptm {
            fn name(&self) -> &'static str;
            fn has_feature(&self, feature: PtmFeature) -> bool;
            async fn send(&self, payload: &[u8], from: &str, to: &[String], extra: &ExtraMetadata) -> PtmResult<EncryptedPayloadHash>;
            async fn store_raw(&self, payload: &[u8], from: &str) -> PtmResult<EncryptedPayloadHash>;
            async fn send_signed_tx(&self, hash: &EncryptedPayloadHash, to: &[String], extra: &ExtraMetadata) -> PtmResult<Vec<u8>>;
            async fn receive(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>>;
            async fn receive_raw(&self, hash: &EncryptedPayloadHash) -> PtmResult<Option<PrivatePayload>>;
            async fn is_sender(&self, hash: &EncryptedPayloadHash) -> PtmResult<bool>;
            async fn get_participants(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>>;
            async fn get_mandatory(&self, hash: &EncryptedPayloadHash) -> PtmResult<Vec<String>>;
            async fn groups(&self) -> PtmResult<Vec<PrivacyGroup>>;
        }
    }

    fn group(group_type: &str, id: &str, name: &str, members: &[&str]) -> PrivacyGroup {
        PrivacyGroup {
            group_type: group_type.to_string(),
            name: name.to_string(),
            privacy_group_id: id.to_string(),
            description: String::new(),
            from: String::new(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn resident(id: &str, name: &str, members: &[&str]) -> PrivacyGroup {
        group(PRIVACY_GROUP_RESIDENT, &BASE64.encode(id), name, members)
    }

    fn ptm_with_groups(groups: Vec<PrivacyGroup>) -> Arc<dyn PrivateTransactionManager> {
        let mut ptm = MockPtm::new();
        ptm.expect_groups().returning(move || Ok(groups.clone()));
        ptm.expect_has_feature()
            .returning(|f| f == PtmFeature::MultiplePrivateStates);
        ptm.expect_name().return_const("MockPtm");
        Arc::new(ptm)
    }

    #[tokio::test]
    async fn test_resolves_resident_groups() {
        let ptm = ptm_with_groups(vec![
            resident("private", "private", &["key1", "key2"]),
            resident("psi2", "second", &["key3"]),
            group(PRIVACY_GROUP_LEGACY, "legacy", "legacy", &["key4"]),
        ]);
        let resolver = PrivacyGroupResolver::load(ptm).await.unwrap();

        assert_eq!(resolver.resolve_for_managed_party("key3").unwrap().id.as_str(), "psi2");
        assert!(matches!(
            resolver.resolve_for_managed_party("key4"),
            Err(PrivateStateError::UnknownManagedParty(_))
        ));

        let default = resolver.resolve_for_user_context(&RequestContext::new()).unwrap();
        assert_eq!(default.id.as_str(), "private");
        assert_eq!(default.state_type, PrivateStateType::Resident);
        assert_eq!(resolver.psis().len(), 3);
    }

    #[tokio::test]
    async fn test_group_id_clash_names_both_groups() {
        let ptm = ptm_with_groups(vec![resident("psi1", "first", &["a"]), resident("psi1", "second", &["b"])]);
        let err = PrivacyGroupResolver::load(ptm).await.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("first"));
        assert!(message.contains("second"));
        assert!(matches!(
            err,
            PrivacyError::PrivateState(PrivateStateError::GroupIdClash { .. })
        ));
    }

    #[tokio::test]
    async fn test_address_in_two_resident_groups_fails() {
        let ptm = ptm_with_groups(vec![resident("psi1", "first", &["a"]), resident("psi2", "second", &["a"])]);
        let err = PrivacyGroupResolver::load(ptm).await.err().unwrap();
        assert!(matches!(
            err,
            PrivacyError::PrivateState(PrivateStateError::AddressInMultipleGroups { .. })
        ));
    }

    #[tokio::test]
    async fn test_psi_resolution_falls_back_to_base64() {
        let ptm = ptm_with_groups(vec![
            group(PRIVACY_GROUP_LEGACY, &BASE64.encode("encoded"), "encoded", &[]),
            group(PRIVACY_GROUP_LEGACY, "plain", "plain", &[]),
        ]);
        let resolver = PrivacyGroupResolver::load(ptm).await.unwrap();

        let by_encoding = resolver.resolve_for_user_context(&RequestContext::with_psi("encoded")).unwrap();
        assert_eq!(by_encoding.name, "encoded");
        let by_decoding = resolver
            .resolve_for_user_context(&RequestContext::with_psi(BASE64.encode("plain").as_str()))
            .unwrap();
        assert_eq!(by_decoding.name, "plain");

        let err = resolver
            .resolve_for_user_context(&RequestContext::with_psi("missing"))
            .unwrap_err();
        assert_eq!(err.to_string(), "unable to find private state for context psi missing");
    }

    #[tokio::test]
    async fn test_refresh_swaps_index_and_keeps_old_on_failure() {
        let mut ptm = MockPtm::new();
        let mut seq = mockall::Sequence::new();
        ptm.expect_groups()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![resident("psi1", "first", &["a"])]));
        ptm.expect_groups()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![resident("psi1", "first", &["a"]), resident("psi2", "second", &["b"])]));
        ptm.expect_groups()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(PtmError::NotReady));

        let resolver = PrivacyGroupResolver::load(Arc::new(ptm)).await.unwrap();
        assert!(resolver.resolve_for_managed_party("b").is_err());

        resolver.refresh().await.unwrap();
        assert_eq!(resolver.resolve_for_managed_party("b").unwrap().id.as_str(), "psi2");

        assert!(resolver.refresh().await.is_err());
        assert_eq!(resolver.psis().len(), 2);
    }

    #[tokio::test]
    async fn test_manager_selection_by_feature() {
        let store: Arc<dyn PrivateStateRootStore> = Arc::new(MemoryStateRootStore::new());

        let mps = new_private_state_manager(ptm_with_groups(vec![resident("private", "private", &["a"])]), Arc::clone(&store))
            .await
            .unwrap();
        assert!(mps.is_mps());

        let default = new_private_state_manager(Arc::new(NotInUse), store).await.unwrap();
        assert!(!default.is_mps());
        let psm = default.resolve_for_managed_party("anyone").unwrap();
        assert_eq!(psm.id.as_str(), "private");
        assert!(!default.not_include_any(&psm, &["anyone".to_string()]));
        assert_eq!(default.psis(), vec![PrivateStateIdentifier::default_psi()]);
    }

    #[test]
    fn test_default_repository_only_knows_private() {
        let store = Arc::new(MemoryStateRootStore::new());
        let public_root = Hash::from_slice(b"public");
        let private_root = Hash::from_slice(b"private");
        store.write_private_state_root(public_root, PrivateStateIdentifier::default_psi(), private_root);

        let manager = DefaultPrivateStateManager::new(store);
        let repo = manager.state_repository(public_root).unwrap();
        assert_eq!(repo.private_state_root(&PrivateStateIdentifier::default_psi()), Ok(private_root));
        assert!(matches!(
            repo.private_state_root(&PrivateStateIdentifier::new("psi1")),
            Err(PrivateStateError::UnknownPsi(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_private_transaction_decodes_inner_tx() {
        let inner = Transaction {
            hash: Hash::from_slice(b"inner"),
            kind: TransactionKind::Private,
            data: EncryptedPayloadHash::from_slice(b"inner payload").as_bytes().to_vec(),
        };
        let payload = serde_json::to_vec(&inner).unwrap();
        let extra = ExtraMetadata {
            managed_parties: vec!["key1".to_string()],
            ..Default::default()
        };

        let mut ptm = MockPtm::new();
        let expected = EncryptedPayloadHash::from_slice(b"marker");
        ptm.expect_receive()
            .withf(move |hash| *hash == expected)
            .returning(move |_| Ok(Some(PrivatePayload::new(payload.clone(), extra.clone()))));

        let fetched = fetch_private_transaction(expected.as_bytes(), &ptm).await.unwrap().unwrap();
        assert_eq!(fetched.transaction, inner);
        assert_eq!(fetched.managed_parties, vec!["key1".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_private_transaction_not_a_party() {
        let fetched = fetch_private_transaction(b"marker", &NotInUse).await.unwrap();
        assert!(fetched.is_none());
    }
}
