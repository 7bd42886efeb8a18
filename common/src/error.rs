use thiserror::Error;

use crate::hash::Hash;

/// Main error type for the private transaction subsystem
#[derive(Error, Debug)]
pub enum PrivacyError {
    #[error("{0}")]
    Ptm(#[from] PtmError),

    #[error("{0}")]
    PrivateState(#[from] PrivateStateError),

    #[error("{0}")]
    QLight(#[from] QLightError),

    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Errors surfaced by private transaction manager adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PtmError {
    #[error("private transaction manager is not in use")]
    NotInUse,

    #[error("private transaction manager is not ready")]
    NotReady,

    #[error("private transaction manager does not support this operation")]
    NotSupported,

    #[error("private transaction manager does not support privacy enhancements")]
    DoesNotSupportPrivacyEnhancements,

    #[error("private transaction manager does not support mandatory recipients")]
    DoesNotSupportMandatoryRecipients,

    #[error("unable to submit request (method:{method},path:{path}). Cause: {reason}")]
    Transport {
        method: String,
        path: String,
        reason: String,
    },

    #[error("request to private transaction manager timed out after {timeout_ms}ms (method:{method},path:{path})")]
    Timeout {
        method: String,
        path: String,
        timeout_ms: u64,
    },

    #[error("{status} status: {body}")]
    Status { status: u16, body: String },

    #[error("unable to decode response body for (method:{method},path:{path}). Cause: {reason}")]
    Decode {
        method: String,
        path: String,
        reason: String,
    },

    #[error("rpc call {method} rejected by peer. code: {code}, message: {message}")]
    Rpc { method: String, code: i64, message: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unable to create connection to private tx manager due to: {0}")]
    Connection(String),
}

/// Private state resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrivateStateError {
    #[error("unable to find private state for context psi {0}")]
    UnknownPsi(String),

    #[error("unable to find private state metadata for managed party {0}")]
    UnknownManagedParty(String),

    #[error("privacy groups id clash id={id} existing.Name={existing} duplicate.Name={duplicate}")]
    GroupIdClash {
        id: String,
        existing: String,
        duplicate: String,
    },

    #[error("same address is part of two different groups: address={address} existing.Name={existing} duplicate.Name={duplicate}")]
    AddressInMultipleGroups {
        address: String,
        existing: String,
        duplicate: String,
    },

    #[error("invalid resident group id {id}: {reason}")]
    InvalidGroupId { id: String, reason: String },

    #[error("private state root not found for psi {0}")]
    RootNotFound(String),
}

/// qlight replication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QLightError {
    #[error("private state root mismatch for block {block_hash}: advertised {expected}, local state has {actual}")]
    PrivateStateRootMismatch {
        block_hash: Hash,
        expected: Hash,
        actual: Hash,
    },

    #[error("no private state root persisted for public state root {0}")]
    MissingPrivateStateRoot(Hash),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// qlight session authorization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Authentication(String),

    #[error("PSI not authorized")]
    PsiNotAuthorized,

    #[error("The P2P token does not have the necessary authorization p2p={p2p} rpcETH={rpc_eth}")]
    MissingAuthority { p2p: bool, rpc_eth: bool },

    #[error("QLight auth error: {0}")]
    PsiResolution(String),
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot specify both Socket and HTTP connections in config file")]
    SocketAndHttp,

    #[error("TLS is enabled but the transaction manager URL {0} is not https")]
    TlsWithoutHttps(String),

    #[error("missing details for HTTP connection with TLS, config file must specify both clientCert and clientKey")]
    IncompleteClientCertificate,

    #[error("invalid value for 'tls' in config file, must be either OFF or STRICT: {0}")]
    InvalidTlsMode(String),

    #[error("TLS is not supported over unix domain socket for private transaction manager connection")]
    TlsOverSocket,

    #[error("either Socket or HTTP connection must be specified in config file")]
    MissingConnection,

    #[error("failed to load config: {0}")]
    Load(String),

    #[error("failed to read TLS material {path}: {reason}")]
    TlsMaterial { path: String, reason: String },
}

/// Serialization/deserialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonFailed(String),

    #[error("Binary serialization failed: {0}")]
    BinaryFailed(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("invalid privacy flag {0}")]
    InvalidPrivacyFlag(u64),
}

/// TTL cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Item {0} already exists")]
    AlreadyExists(String),
}

impl From<serde_json::Error> for SerializationError {
    fn from(e: serde_json::Error) -> Self {
        SerializationError::JsonFailed(e.to_string())
    }
}

impl From<bincode::Error> for SerializationError {
    fn from(e: bincode::Error) -> Self {
        SerializationError::BinaryFailed(e.to_string())
    }
}

/// Result type alias for private transaction subsystem operations
pub type PrivacyResult<T> = Result<T, PrivacyError>;

/// Result type alias for PTM adapter operations
pub type PtmResult<T> = Result<T, PtmError>;

impl PrivacyError {
    /// Check if error is retryable by the caller's own policy
    pub fn is_retryable(&self) -> bool {
        match self {
            PrivacyError::Ptm(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PrivacyError::QLight(QLightError::PrivateStateRootMismatch { .. }) => ErrorSeverity::Critical,
            PrivacyError::Config(_) => ErrorSeverity::High,
            PrivacyError::PrivateState(_) => ErrorSeverity::High,
            PrivacyError::Auth(_) => ErrorSeverity::Medium,
            PrivacyError::Ptm(e) if e.is_retryable() => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }
}

impl PtmError {
    /// Transport failures and timeouts may succeed on retry; every other PTM error
    /// needs reconfiguration or is a permanent answer
    pub fn is_retryable(&self) -> bool {
        matches!(self, PtmError::Transport { .. } | PtmError::Timeout { .. })
    }

    /// True for the "no PTM configured" sentinel
    pub fn is_not_in_use(&self) -> bool {
        matches!(self, PtmError::NotInUse)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PtmError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}
