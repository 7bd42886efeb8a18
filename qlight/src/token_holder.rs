//! Light client side token management.
//!
//! The light client presents a bearer token to its server peer. When a token
//! plugin is configured the token is refreshed shortly before it expires, both
//! lazily on access and from a background task.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use pvt_common::{PrivateStateIdentifier, QLightError};

/// Retry delay for a token that is already expired
const EXPIRED_RETRY: Duration = Duration::from_secs(1);

/// Token refresh backed by the node's qlight token plugin
#[async_trait]
pub trait PluginTokenManager: Send + Sync {
    async fn token_refresh(&self, current: &str, psi: &PrivateStateIdentifier) -> Result<String, QLightError>;

    /// How many milliseconds before expiry a token counts as expired
    async fn refresh_anticipation(&self) -> Result<i32, QLightError>;
}

/// Pushes a refreshed token to already connected server peers
pub trait RunningPeerAuthUpdater: Send + Sync {
    fn update_token_for_running_peers(&self, token: &str) -> Result<(), QLightError>;
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: i64,
}

pub struct TokenHolder {
    psi: PrivateStateIdentifier,
    token: RwLock<String>,
    refresh_anticipation_ms: RwLock<i64>,
    plugin: RwLock<Option<Arc<dyn PluginTokenManager>>>,
    peer_updater: RwLock<Option<Arc<dyn RunningPeerAuthUpdater>>>,
    refresh_lock: Mutex<()>,
    deadline: watch::Sender<Option<Instant>>,
}

impl TokenHolder {
    /// Build a holder, asking the plugin (if any) for its refresh anticipation
    pub async fn new(
        psi: PrivateStateIdentifier,
        plugin: Option<Arc<dyn PluginTokenManager>>,
    ) -> Result<Arc<Self>, QLightError> {
        let anticipation = match &plugin {
            Some(plugin) => plugin.refresh_anticipation().await.map_err(|e| {
                QLightError::TokenRefresh(format!("fetch refresh anticipation value: {}", e))
            })?,
            None => 0,
        };
        Ok(Self::with_plugin(psi, anticipation, plugin))
    }

    pub fn with_plugin(
        psi: PrivateStateIdentifier,
        refresh_anticipation_ms: i32,
        plugin: Option<Arc<dyn PluginTokenManager>>,
    ) -> Arc<Self> {
        let (deadline, deadline_rx) = watch::channel(None);
        let holder = Arc::new(Self {
            psi,
            token: RwLock::new(String::new()),
            refresh_anticipation_ms: RwLock::new(i64::from(refresh_anticipation_ms)),
            plugin: RwLock::new(plugin),
            peer_updater: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            deadline,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_refresher(Arc::downgrade(&holder), deadline_rx));
            }
            Err(_) => debug!("no tokio runtime, token will only refresh on access"),
        }
        holder
    }

    pub fn psi(&self) -> &PrivateStateIdentifier {
        &self.psi
    }

    pub fn set_peer_updater(&self, updater: Arc<dyn RunningPeerAuthUpdater>) {
        *self.peer_updater.write() = Some(updater);
    }

    pub fn set_current_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    pub fn set_expiration_anticipation(&self, anticipation_ms: i32) {
        *self.refresh_anticipation_ms.write() = i64::from(anticipation_ms);
    }

    /// The held token as is, without refreshing
    pub fn cached_token(&self) -> String {
        self.token.read().clone()
    }

    /// Swap the token plugin and reschedule the background refresh
    pub async fn reload_plugin(&self, plugin: Option<Arc<dyn PluginTokenManager>>) -> Result<(), QLightError> {
        let anticipation = match &plugin {
            Some(plugin) => plugin.refresh_anticipation().await?,
            None => 0,
        };
        *self.plugin.write() = plugin;
        self.set_expiration_anticipation(anticipation);
        self.update_timer()
    }

    /// Value for the `Authorization` header of requests to the server peer
    pub async fn http_credentials(&self) -> String {
        self.current_token().await
    }

    /// The token, refreshed through the plugin first when it is about to expire
    pub async fn current_token(&self) -> String {
        let Some(plugin) = self.plugin.read().clone() else {
            warn!("token plugin is missing, no update possible");
            return self.cached_token();
        };
        if !self.token_expired() {
            return self.cached_token();
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if !self.token_expired() {
            return self.cached_token();
        }

        let current = self.cached_token();
        match plugin.token_refresh(&current, &self.psi).await {
            Ok(refreshed) => {
                if refreshed != current {
                    debug!(psi = %self.psi, "new token from plugin");
                    let updater = self.peer_updater.read().clone();
                    if let Some(updater) = updater {
                        if let Err(e) = updater.update_token_for_running_peers(&refreshed) {
                            warn!(error = %e, "update token to qlight peers");
                        }
                    }
                }
                self.set_current_token(refreshed);
                if let Err(e) = self.update_timer() {
                    warn!(error = %e, "update token timer");
                }
            }
            Err(e) => error!(psi = %self.psi, error = %e, "get token from plugin"),
        }
        self.cached_token()
    }

    /// Milliseconds until the held token expires, negative once expired.
    ///
    /// Tokens that are not JWTs never expire, which reads as zero.
    fn expiration_delay_ms(&self) -> Result<i64, QLightError> {
        let token = self.cached_token();
        if token.is_empty() {
            return Ok(0);
        }
        let token = token.split_once(' ').map_or(token.as_str(), |(_, jwt)| jwt);
        let Some(claims) = token.split('.').nth(1) else {
            return Ok(0);
        };

        let decoded = URL_SAFE_NO_PAD
            .decode(claims)
            .or_else(|_| STANDARD_NO_PAD.decode(claims))
            .map_err(|e| QLightError::InvalidToken(format!("decode Base64: {}", e)))?;
        let claims: JwtClaims = serde_json::from_slice(&decoded)
            .map_err(|e| QLightError::InvalidToken(format!("unmarshal JSON: {}", e)))?;

        Ok(claims.exp * 1000 - Utc::now().timestamp_millis())
    }

    fn token_expired(&self) -> bool {
        match self.expiration_delay_ms() {
            Ok(delay) => delay < *self.refresh_anticipation_ms.read(),
            Err(e) => {
                warn!(error = %e, "error while checking if token is expired");
                true
            }
        }
    }

    /// Schedule the next background refresh ahead of the token's expiry
    fn update_timer(&self) -> Result<(), QLightError> {
        if self.plugin.read().is_none() {
            return Ok(());
        }
        let delay = self.expiration_delay_ms()?;
        let fire_in = if delay <= 0 {
            EXPIRED_RETRY
        } else {
            let ms = (delay - *self.refresh_anticipation_ms.read()).max(0);
            Duration::from_millis(ms as u64)
        };
        debug!(fire_in_ms = fire_in.as_millis() as u64, "token refresh scheduled");
        self.deadline.send_replace(Some(Instant::now() + fire_in));
        Ok(())
    }
}

/// Background refresh loop. Exits once the holder is dropped.
async fn run_refresher(holder: Weak<TokenHolder>, mut deadline: watch::Receiver<Option<Instant>>) {
    loop {
        let next = *deadline.borrow_and_update();
        match next {
            None => {
                if deadline.changed().await.is_err() {
                    return;
                }
            }
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let Some(holder) = holder.upgrade() else {
                            return;
                        };
                        holder.deadline.send_replace(None);
                        debug!(psi = %holder.psi, "token refresh timer triggered");
                        holder.current_token().await;
                    }
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
