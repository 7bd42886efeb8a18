//! qlight private data replication.
//!
//! A full node prepares the private data of each block per private state and
//! ships it to light clients, which cache the payloads ahead of execution and
//! verify the advertised private state roots.

pub mod auth;
pub mod client;
pub mod rpc;
pub mod server;
pub mod token_holder;
pub mod types;

pub use auth::{AuthProvider, AuthenticatedToken, AuthenticationManager, GrantedAuthority};
pub use client::{ClientCache, PrivateCacheSink};
pub use rpc::HttpRpcCaller;
pub use server::{BlockDataResolver, CachingBlockPrivateDataResolver, PrivateBlockDataResolver};
pub use token_holder::{PluginTokenManager, RunningPeerAuthUpdater, TokenHolder};
pub use types::{BlockPrivateData, PrivateTransactionData, QLightCacheKey};
