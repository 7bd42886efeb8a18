//! Private transaction manager integration.
//!
//! Adapters for the supported PTMs behind one [`PrivateTransactionManager`]
//! interface, the payload cache they share, adapter selection at startup and
//! the private state managers built on top of the PTM's privacy groups.

pub mod cache;
pub mod config;
pub mod connect;
pub mod engine;
pub mod private_state;
pub mod transport;

pub use cache::{CacheEntry, PayloadCache, PrivateCacheItem, TtlCache};
pub use config::{ConnectionType, PtmConfig, TlsMode};
pub use connect::{connect, connect_light_client};
pub use engine::{PrivatePayload, PrivateTransactionManager, PtmAdapter, PtmFeature};
pub use private_state::{
    fetch_private_transaction, new_private_state_manager, DefaultPrivateStateManager, MemoryStateRootStore,
    MultiplePrivateStateManager, PrivacyGroupResolver, PrivateStateManager, PrivateStateRepository,
    PrivateStateRootStore,
};
pub use transport::{PtmClient, PtmTransport};
