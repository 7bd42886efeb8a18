//! Authorization of qlight sessions.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use pvt_common::{AuthError, PrivateStateIdentifier, RequestContext};
use pvt_ptm::PrivateStateManager;

pub const QLIGHT_P2P_AUTHORITY: &str = "p2p://qlight";
pub const ETH_RPC_AUTHORITY: &str = "rpc://eth_*";
const PSI_SERVICE: &str = "psi";

/// Authority granted to a token, e.g. `rpc://eth_*` or `psi://PS1?self.eoa=0x0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedAuthority {
    raw: String,
}

impl GrantedAuthority {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Scheme part, `rpc` for `rpc://eth_*`
    pub fn service(&self) -> &str {
        self.raw.split_once("://").map(|(service, _)| service).unwrap_or_default()
    }

    /// Host part, `eth_*` for `rpc://eth_*`
    pub fn method(&self) -> &str {
        self.raw
            .split_once("://")
            .map(|(_, rest)| rest.split(|c| c == '/' || c == '?').next().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn authorizes_psi(&self, psi: &PrivateStateIdentifier) -> bool {
        self.service().eq_ignore_ascii_case(PSI_SERVICE) && self.method() == psi.as_str()
    }
}

impl fmt::Display for GrantedAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Principal behind a successfully authenticated token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticatedToken {
    pub authorities: Vec<GrantedAuthority>,
}

impl AuthenticatedToken {
    pub fn new(authorities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            authorities: authorities.into_iter().map(GrantedAuthority::new).collect(),
        }
    }

    pub fn has_authority(&self, raw: &str) -> bool {
        self.authorities.iter().any(|a| a.raw() == raw)
    }

    pub fn is_psi_authorized(&self, psi: &PrivateStateIdentifier) -> bool {
        self.authorities.iter().any(|a| a.authorizes_psi(psi))
    }
}

/// Token verification backed by the node's security plugin
#[async_trait]
pub trait AuthenticationManager: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedToken, AuthError>;

    async fn is_enabled(&self) -> Result<bool, AuthError>;
}

/// Lazily supplies the authentication manager, `None` when no security plugin is configured
pub type AuthManagerProvider = Box<dyn Fn() -> Option<Arc<dyn AuthenticationManager>> + Send + Sync>;

enum AuthState {
    Uninitialized,
    Disabled,
    Enabled(Arc<dyn AuthenticationManager>),
}

/// Gatekeeper for incoming qlight connections
pub struct AuthProvider {
    private_state_manager: Arc<dyn PrivateStateManager>,
    manager_provider: Option<AuthManagerProvider>,
    state: RwLock<AuthState>,
}

impl AuthProvider {
    pub fn new(private_state_manager: Arc<dyn PrivateStateManager>, manager_provider: Option<AuthManagerProvider>) -> Self {
        Self {
            private_state_manager,
            manager_provider,
            state: RwLock::new(AuthState::Uninitialized),
        }
    }

    pub async fn initialize(&self) -> Result<(), AuthError> {
        let manager = self.manager_provider.as_ref().and_then(|provider| provider());
        let state = match manager {
            Some(manager) if manager.is_enabled().await? => AuthState::Enabled(manager),
            _ => AuthState::Disabled,
        };
        if matches!(state, AuthState::Enabled(_)) {
            info!("qlight authorization enabled");
        } else {
            info!("qlight authorization disabled");
        }
        *self.state.write() = state;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*self.state.read(), AuthState::Enabled(_))
    }

    /// Check a light client's token for access to `psi`
    pub async fn authorize(&self, token: &str, psi: &PrivateStateIdentifier) -> Result<(), AuthError> {
        let manager = match &*self.state.read() {
            AuthState::Enabled(manager) => Arc::clone(manager),
            AuthState::Disabled => return Ok(()),
            AuthState::Uninitialized => {
                debug!("qlight authorization requested before initialization, allowing");
                return Ok(());
            }
        };

        let token = manager.authenticate(token).await?;
        if !token.is_psi_authorized(psi) {
            return Err(AuthError::PsiNotAuthorized);
        }

        let p2p = token.has_authority(QLIGHT_P2P_AUTHORITY);
        let rpc_eth = token.has_authority(ETH_RPC_AUTHORITY);
        if !p2p || !rpc_eth {
            return Err(AuthError::MissingAuthority { p2p, rpc_eth });
        }

        self.private_state_manager
            .resolve_for_user_context(&RequestContext::with_psi(psi.clone()))
            .map_err(|e| AuthError::PsiResolution(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use pvt_common::{Hash, PrivateStateError, PrivateStateMetadata};
    use pvt_ptm::{DefaultPrivateStateManager, MemoryStateRootStore, PrivateStateRepository};

    mock! {
        pub AuthManager {}

        #[async_trait]
        impl AuthenticationManager for AuthManager {
            async fn authenticate(&self, token: &str) -> Result<AuthenticatedToken, AuthError>;
            async fn is_enabled(&self) -> Result<bool, AuthError>;
        }
    }

    mock! {
        pub Psm {}

        impl PrivateStateManager for Psm {
            fn resolve_for_managed_party(&self, managed_party: &str) -> Result<Arc<PrivateStateMetadata>, PrivateStateError>;
            fn resolve_for_user_context(&self, ctx: &RequestContext) -> Result<Arc<PrivateStateMetadata>, PrivateStateError>;
            fn psis(&self) -> Vec<PrivateStateIdentifier>;
            fn not_include_any(&self, psm: &PrivateStateMetadata, managed_parties: &[String]) -> bool;
            fn is_mps(&self) -> bool;
            fn state_repository(&self, block_root: Hash) -> Result<PrivateStateRepository, PrivateStateError>;
        }
    }

    fn default_psm() -> Arc<dyn PrivateStateManager> {
        Arc::new(DefaultPrivateStateManager::new(Arc::new(MemoryStateRootStore::new())))
    }

    fn provider(manager: MockAuthManager) -> Option<AuthManagerProvider> {
        let manager: Arc<dyn AuthenticationManager> = Arc::new(manager);
        Some(Box::new(move || Some(Arc::clone(&manager))))
    }

    fn full_token() -> AuthenticatedToken {
        AuthenticatedToken::new(["psi://private?self.eoa=0x0", QLIGHT_P2P_AUTHORITY, ETH_RPC_AUTHORITY])
    }

    #[test]
    fn test_authority_parts() {
        let authority = GrantedAuthority::new("psi://PS1?self.eoa=0x0&node.eoa=0x0");
        assert_eq!(authority.service(), "psi");
        assert_eq!(authority.method(), "PS1");
        assert!(authority.authorizes_psi(&"PS1".into()));
        assert!(!authority.authorizes_psi(&"PS2".into()));
        assert_eq!(GrantedAuthority::new(ETH_RPC_AUTHORITY).method(), "eth_*");
        assert_eq!(GrantedAuthority::new("garbage").service(), "");
    }

    #[tokio::test]
    async fn test_no_manager_allows_everything() {
        let auth = AuthProvider::new(default_psm(), None);
        auth.initialize().await.unwrap();
        assert!(!auth.is_enabled());
        assert!(auth.authorize("anything", &"psi9".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_manager_never_authenticates() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(false));
        manager.expect_authenticate().never();

        let auth = AuthProvider::new(default_psm(), provider(manager));
        auth.initialize().await.unwrap();
        assert!(auth.authorize("token", &"private".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_authentication_error_surfaces() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(true));
        manager
            .expect_authenticate()
            .returning(|_| Err(AuthError::Authentication("token expired".to_string())));

        let auth = AuthProvider::new(default_psm(), provider(manager));
        auth.initialize().await.unwrap();
        let err = auth.authorize("token", &"private".into()).await.unwrap_err();
        assert_eq!(err.to_string(), "token expired");
    }

    #[tokio::test]
    async fn test_psi_must_be_granted() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(true));
        manager.expect_authenticate().returning(|_| Ok(full_token()));

        let auth = AuthProvider::new(default_psm(), provider(manager));
        auth.initialize().await.unwrap();
        let err = auth.authorize("token", &"other".into()).await.unwrap_err();
        assert_eq!(err, AuthError::PsiNotAuthorized);
    }

    #[tokio::test]
    async fn test_missing_p2p_authority_is_named() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(true));
        manager
            .expect_authenticate()
            .withf(|token| token == "bearer-token")
            .returning(|_| Ok(AuthenticatedToken::new(["psi://private", ETH_RPC_AUTHORITY])));

        let auth = AuthProvider::new(default_psm(), provider(manager));
        auth.initialize().await.unwrap();
        let err = auth.authorize("bearer-token", &"private".into()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "The P2P token does not have the necessary authorization p2p=false rpcETH=true"
        );
    }

    #[tokio::test]
    async fn test_unresolvable_psi_is_wrapped() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(true));
        manager.expect_authenticate().returning(|_| Ok(full_token()));
        let mut psm = MockPsm::new();
        psm.expect_resolve_for_user_context()
            .returning(|ctx| Err(PrivateStateError::UnknownPsi(ctx.psi().to_string())));

        let auth = AuthProvider::new(Arc::new(psm), provider(manager));
        auth.initialize().await.unwrap();
        let err = auth.authorize("token", &"private".into()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "QLight auth error: unable to find private state for context psi private"
        );
    }

    #[tokio::test]
    async fn test_fully_authorized_token() {
        let mut manager = MockAuthManager::new();
        manager.expect_is_enabled().returning(|| Ok(true));
        manager.expect_authenticate().returning(|_| Ok(full_token()));

        let auth = AuthProvider::new(default_psm(), provider(manager));
        auth.initialize().await.unwrap();
        assert!(auth.is_enabled());
        assert!(auth.authorize("token", &"private".into()).await.is_ok());
    }
}
