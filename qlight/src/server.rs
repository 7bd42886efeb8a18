//! Server side of qlight: assembles the private data a light client needs for a block.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use pvt_common::{
    Block, EncryptedPayloadHash, Hash, PrivacyError, PrivacyResult, PrivateStateIdentifier, PrivateStateMetadata,
    RequestContext, SerializationError,
};
use pvt_ptm::cache::{CLEANUP_INTERVAL, DEFAULT_EXPIRATION};
use pvt_ptm::{fetch_private_transaction, PrivateStateManager, PrivateTransactionManager, TtlCache};

use crate::types::{BlockPrivateData, PrivateTransactionData, QLightCacheKey};

/// Produces the private data of a block for one private state.
///
/// `Ok(None)` means the private state has nothing to receive for the block.
#[async_trait]
pub trait PrivateBlockDataResolver: Send + Sync {
    async fn prepare_block_private_data(
        &self,
        block: &Block,
        psi: &PrivateStateIdentifier,
    ) -> PrivacyResult<Option<BlockPrivateData>>;
}

pub struct BlockDataResolver {
    private_state_manager: Arc<dyn PrivateStateManager>,
    ptm: Arc<dyn PrivateTransactionManager>,
}

impl BlockDataResolver {
    pub fn new(private_state_manager: Arc<dyn PrivateStateManager>, ptm: Arc<dyn PrivateTransactionManager>) -> Self {
        Self {
            private_state_manager,
            ptm,
        }
    }

    async fn fetch_private_data(
        &self,
        data: &[u8],
        psm: &PrivateStateMetadata,
    ) -> PrivacyResult<Option<PrivateTransactionData>> {
        let hash = EncryptedPayloadHash::from_slice(data);
        let Some(received) = self.ptm.receive(&hash).await? else {
            // not a party to this transaction
            return Ok(None);
        };
        let mut extra = received.extra;
        if self.private_state_manager.not_include_any(psm, &extra.managed_parties) {
            return Ok(None);
        }
        extra.managed_parties = psm.filter_addresses(&extra.managed_parties);

        let is_sender = if psm.addresses.is_empty() {
            // single private state, only the PTM knows
            self.ptm.is_sender(&hash).await?
        } else {
            !psm.not_include_any(std::slice::from_ref(&extra.sender))
        };

        Ok(Some(PrivateTransactionData {
            hash,
            payload: received.payload,
            extra,
            is_sender,
        }))
    }

    fn private_state_root(&self, block: &Block, psi: &PrivateStateIdentifier) -> Hash {
        let repository = match self.private_state_manager.state_repository(block.root) {
            Ok(repository) => repository,
            Err(e) => {
                debug!(block = block.number, %psi, error = %e, "unable to retrieve private state repo while preparing the private block data");
                return Hash::default();
            }
        };
        repository.private_state_root(psi).unwrap_or_else(|e| {
            debug!(block = block.number, %psi, error = %e, "unable to retrieve private state root while preparing the private block data");
            Hash::default()
        })
    }
}

#[async_trait]
impl PrivateBlockDataResolver for BlockDataResolver {
    async fn prepare_block_private_data(
        &self,
        block: &Block,
        psi: &PrivateStateIdentifier,
    ) -> PrivacyResult<Option<BlockPrivateData>> {
        let psm = self
            .private_state_manager
            .resolve_for_user_context(&RequestContext::with_psi(psi.clone()))?;

        let mut private_transactions = Vec::new();
        for tx in &block.transactions {
            let mut tx = tx.clone();
            if tx.is_privacy_marker() {
                if let Some(ptd) = self.fetch_private_data(tx.data(), &psm).await? {
                    private_transactions.push(ptd);
                }
                match fetch_private_transaction(tx.data(), self.ptm.as_ref()).await {
                    Ok(Some(inner)) => tx = inner.transaction,
                    Ok(None) => {}
                    Err(e) => trace!(tx = %tx.hash, error = %e, "unable to fetch inner private transaction"),
                }
            }
            if tx.is_private() {
                if let Some(ptd) = self.fetch_private_data(tx.data(), &psm).await? {
                    private_transactions.push(ptd);
                }
            }
        }
        if private_transactions.is_empty() {
            return Ok(None);
        }

        Ok(Some(BlockPrivateData {
            block_hash: block.hash,
            psi: psi.clone(),
            private_state_root: self.private_state_root(block, psi),
            private_transactions,
        }))
    }
}

type SharedResult = Arc<OnceCell<Option<BlockPrivateData>>>;

/// Memoizes assembled block data per block and PSI.
///
/// The first request for a key claims it; concurrent requests for the same key
/// wait on that computation instead of repeating it. Failures are not cached.
pub struct CachingBlockPrivateDataResolver<R> {
    inner: R,
    cache: TtlCache<String, SharedResult>,
}

impl<R: PrivateBlockDataResolver> CachingBlockPrivateDataResolver<R> {
    pub fn new(inner: R) -> Self {
        Self::with_expiration(inner, DEFAULT_EXPIRATION, CLEANUP_INTERVAL)
    }

    pub fn with_expiration(inner: R, ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::with_expiration(ttl, cleanup_interval),
        }
    }

    fn claim(&self, key: String) -> SharedResult {
        let cell: SharedResult = Arc::new(OnceCell::new());
        match self.cache.add(key.clone(), Arc::clone(&cell)) {
            Ok(()) => cell,
            Err(_) => self.cache.get(&key).unwrap_or(cell),
        }
    }
}

#[async_trait]
impl<R: PrivateBlockDataResolver> PrivateBlockDataResolver for CachingBlockPrivateDataResolver<R> {
    async fn prepare_block_private_data(
        &self,
        block: &Block,
        psi: &PrivateStateIdentifier,
    ) -> PrivacyResult<Option<BlockPrivateData>> {
        let key = QLightCacheKey::new(block.hash, psi.clone())
            .to_cache_key()
            .map_err(|e| PrivacyError::from(SerializationError::from(e)))?;
        let cell = self.claim(key);
        if let Some(cached) = cell.get() {
            metrics::counter!("qlight_block_cache_hits_total").increment(1);
            return Ok(cached.clone());
        }
        let result = cell
            .get_or_try_init(|| self.inner.prepare_block_private_data(block, psi))
            .await?;
        Ok(result.clone())
    }
}
