use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use pvt_common::ConfigError;

/// Environment variable holding the legacy PTM connection setting
pub const PRIVATE_CONFIG_ENV: &str = "PRIVATE_CONFIG";

/// Overall HTTP client call timeout when none is configured
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
/// Overall unix socket call timeout when none is configured
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_IDLE_CONN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    None,
    Unix,
    Http,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsMode {
    #[default]
    Off,
    Strict,
}

impl TryFrom<String> for TlsMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "" | "off" => Ok(TlsMode::Off),
            "strict" => Ok(TlsMode::Strict),
            _ => Err(ConfigError::InvalidTlsMode(value)),
        }
    }
}

impl From<TlsMode> for String {
    fn from(mode: TlsMode) -> Self {
        match mode {
            TlsMode::Off => "off".to_string(),
            TlsMode::Strict => "strict".to_string(),
        }
    }
}

/// Connection settings for the private transaction manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtmConfig {
    /// Derived from which of `socket`/`http_url` is set
    #[serde(skip)]
    pub connection_type: ConnectionType,
    /// Unix socket file name, relative to `work_dir` when that is set
    pub socket: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub http_url: Option<String>,
    /// Overall call timeout in seconds, zero disables it
    pub timeout_secs: Option<u64>,
    pub dial_timeout_secs: Option<u64>,
    /// Idle pooled connection timeout in seconds, zero disables it
    pub idle_conn_timeout_secs: Option<u64>,
    pub tls: TlsMode,
    pub tls_root_ca: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
    pub tls_insecure_skip_verify: bool,
}

impl PtmConfig {
    /// Configuration for a node running without a PTM
    pub fn no_connection() -> Self {
        Self::default()
    }

    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.set_socket(socket_path);
        config
    }

    pub fn with_http_url(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.set_http_url(url);
        config
    }

    pub fn set_socket(&mut self, socket_path: impl Into<PathBuf>) {
        let path: PathBuf = socket_path.into();
        self.connection_type = ConnectionType::Unix;
        match (path.parent(), path.file_name()) {
            (Some(dir), Some(file)) if !dir.as_os_str().is_empty() => {
                self.work_dir = Some(dir.to_path_buf());
                self.socket = Some(PathBuf::from(file));
            }
            _ => self.socket = Some(path),
        }
    }

    pub fn set_http_url(&mut self, url: impl Into<String>) {
        self.connection_type = ConnectionType::Http;
        self.http_url = Some(url.into());
    }

    /// Decode a TOML config file, overlaid with `PTM_*` environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("PTM").try_parsing(true))
            .build()
            .map_err(|e| ConfigError::Load(format!("error reading config from '{}' due to: {}", path.display(), e)))?;

        let mut cfg: PtmConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("error reading config from '{}' due to: {}", path.display(), e)))?;

        cfg.connection_type = if cfg.socket.is_some() {
            ConnectionType::Unix
        } else if cfg.http_url.is_some() {
            ConnectionType::Http
        } else {
            return Err(ConfigError::MissingConnection);
        };
        Ok(cfg)
    }

    /// Accepts a socket file or a config file path
    pub fn fetch(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let metadata = std::fs::symlink_metadata(path).map_err(|e| {
            ConfigError::Load(format!(
                "unable to check whether connection details are specified as a config file or ipc file '{}', due to: {}",
                path.display(),
                e
            ))
        })?;
        if is_socket(&metadata) {
            debug!(path = %path.display(), "PTM connection configured as unix socket");
            return Ok(Self::with_socket(path));
        }
        Self::load(path)
    }

    /// Empty or `ignore` means no connection, otherwise see [`PtmConfig::fetch`]
    pub fn fetch_or_ignore(path: &str) -> Result<Self, ConfigError> {
        if path.is_empty() || path.eq_ignore_ascii_case("ignore") {
            return Ok(Self::no_connection());
        }
        Self::fetch(path)
    }

    /// Resolve the legacy `PRIVATE_CONFIG` environment setting
    pub fn from_environment() -> Result<Self, ConfigError> {
        let path = std::env::var(PRIVATE_CONFIG_ENV).unwrap_or_default();
        Self::fetch_or_ignore(&path)
    }

    pub fn is_socket_configured(&self) -> bool {
        self.connection_type == ConnectionType::Unix
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        let socket = self.socket.as_ref()?;
        Some(match &self.work_dir {
            Some(dir) => dir.join(socket),
            None => socket.clone(),
        })
    }

    /// Overall call deadline, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        let default = match self.connection_type {
            ConnectionType::Unix => DEFAULT_SOCKET_TIMEOUT_SECS,
            _ => DEFAULT_HTTP_TIMEOUT_SECS,
        };
        non_zero_secs(self.timeout_secs.unwrap_or(default))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS))
    }

    pub fn idle_conn_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_conn_timeout_secs.unwrap_or(DEFAULT_IDLE_CONN_TIMEOUT_SECS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.connection_type {
            ConnectionType::None => Ok(()),
            ConnectionType::Unix => {
                if self.socket.is_none() {
                    return Err(ConfigError::MissingConnection);
                }
                if self.http_url.is_some() {
                    return Err(ConfigError::SocketAndHttp);
                }
                if self.tls != TlsMode::Off {
                    return Err(ConfigError::TlsOverSocket);
                }
                Ok(())
            }
            ConnectionType::Http => {
                if self.socket.is_some() {
                    return Err(ConfigError::SocketAndHttp);
                }
                let Some(url) = &self.http_url else {
                    return Err(ConfigError::MissingConnection);
                };
                if self.tls == TlsMode::Strict {
                    if !url.to_ascii_lowercase().starts_with("https") {
                        return Err(ConfigError::TlsWithoutHttps(url.clone()));
                    }
                    if self.tls_client_cert.is_some() != self.tls_client_key.is_some() {
                        return Err(ConfigError::IncompleteClientCertificate);
                    }
                }
                Ok(())
            }
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(unix)]
fn is_socket(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_http_config() {
        let file = write_config(
            r#"
http_url = "https://localhost:9101"
timeout_secs = 7
tls = "STRICT"
tls_client_cert = "/certs/client.pem"
tls_client_key = "/certs/client.key"
"#,
        );
        let cfg = PtmConfig::load(file.path()).unwrap();
        assert_eq!(cfg.connection_type, ConnectionType::Http);
        assert_eq!(cfg.tls, TlsMode::Strict);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(7)));
        assert_eq!(cfg.dial_timeout(), Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("http_url = \"http://localhost:9101\"\n");
        std::env::set_var("PTM_TIMEOUT_SECS", "0");
        let cfg = PtmConfig::load(file.path());
        std::env::remove_var("PTM_TIMEOUT_SECS");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.request_timeout(), None);
    }

    #[test]
    #[serial]
    fn test_config_without_connection_is_rejected() {
        let file = write_config("timeout_secs = 3\n");
        assert_eq!(PtmConfig::load(file.path()), Err(ConfigError::MissingConnection));
    }

    #[test]
    #[serial]
    fn test_unknown_tls_mode_is_rejected() {
        let file = write_config("http_url = \"https://localhost\"\ntls = \"sometimes\"\n");
        assert!(matches!(PtmConfig::load(file.path()), Err(ConfigError::Load(_))));
    }

    #[test]
    #[serial]
    fn test_environment_ignore_means_no_connection() {
        std::env::set_var(PRIVATE_CONFIG_ENV, "ignore");
        let cfg = PtmConfig::from_environment();
        std::env::remove_var(PRIVATE_CONFIG_ENV);
        assert_eq!(cfg.unwrap().connection_type, ConnectionType::None);

        assert_eq!(PtmConfig::from_environment().unwrap(), PtmConfig::no_connection());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn test_socket_path_yields_socket_config() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tm.ipc");
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let cfg = PtmConfig::fetch(&socket).unwrap();
        assert!(cfg.is_socket_configured());
        assert_eq!(cfg.socket_path(), Some(socket));
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(DEFAULT_SOCKET_TIMEOUT_SECS)));
    }

    #[test]
    fn test_validate_rejects_socket_and_http() {
        let mut cfg = PtmConfig::with_socket("/tmp/tm.ipc");
        cfg.http_url = Some("http://localhost".to_string());
        assert_eq!(cfg.validate(), Err(ConfigError::SocketAndHttp));
    }

    #[test]
    fn test_validate_rejects_tls_without_https() {
        let mut cfg = PtmConfig::with_http_url("http://localhost:9101");
        cfg.tls = TlsMode::Strict;
        assert!(matches!(cfg.validate(), Err(ConfigError::TlsWithoutHttps(_))));
    }

    #[test]
    fn test_validate_rejects_half_client_certificate() {
        let mut cfg = PtmConfig::with_http_url("https://localhost:9101");
        cfg.tls = TlsMode::Strict;
        cfg.tls_client_cert = Some(PathBuf::from("/certs/client.pem"));
        assert_eq!(cfg.validate(), Err(ConfigError::IncompleteClientCertificate));
    }

    #[test]
    fn test_set_socket_splits_work_dir() {
        let cfg = PtmConfig::with_socket("/var/run/tm/tm.ipc");
        assert_eq!(cfg.work_dir, Some(PathBuf::from("/var/run/tm")));
        assert_eq!(cfg.socket, Some(PathBuf::from("tm.ipc")));
        assert_eq!(cfg.socket_path(), Some(PathBuf::from("/var/run/tm/tm.ipc")));
    }
}
