//! HTTP and unix-socket plumbing shared by the PTM adapters.
//!
//! Every call goes through [`PtmClient`], which applies the configured
//! deadline and maps failures onto [`PtmError`] so that an unreachable PTM
//! never looks like "not found".

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use pvt_common::{ConfigError, PtmError, PtmResult};

use crate::config::{ConnectionType, PtmConfig, TlsMode};

const USER_AGENT: &str = concat!("pvt-ptm/", env!("CARGO_PKG_VERSION"));

/// Host used for requests tunneled over a unix socket
const SOCKET_HOST: &str = "c";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PtmRequest {
    pub method: HttpMethod,
    /// Path and query, starting with `/`
    pub path: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Bytes>,
}

impl PtmRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn transport_error(&self, reason: impl fmt::Display) -> PtmError {
        PtmError::Transport {
            method: self.method.to_string(),
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtmResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PtmResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status == 200 || self.status == 201
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fail with the PTM's status and body unless the call succeeded
    pub fn error_for_status(self) -> PtmResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PtmError::Status {
                status: self.status,
                body: self.text(),
            })
        }
    }
}

/// Raw request execution against a PTM endpoint
#[async_trait]
pub trait PtmTransport: Send + Sync {
    async fn execute(&self, request: &PtmRequest) -> PtmResult<PtmResponse>;
}

/// PTM over HTTP(S)
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> PtmResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PtmError::Connection(e.to_string()))?;
        Ok(Self::with_http_client(base_url, http))
    }

    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn from_config(config: &PtmConfig) -> Result<Self, ConfigError> {
        let url = config.http_url.clone().ok_or(ConfigError::MissingConnection)?;
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .connect_timeout(config.dial_timeout())
            .pool_idle_timeout(config.idle_conn_timeout());

        if config.tls == TlsMode::Strict {
            if let Some(ca) = &config.tls_root_ca {
                let pem = read_pem(ca)?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| tls_error(ca, e))?;
                builder = builder.add_root_certificate(cert);
            }
            if let (Some(cert), Some(key)) = (&config.tls_client_cert, &config.tls_client_key) {
                let mut pem = read_pem(cert)?;
                pem.extend_from_slice(b"\n");
                pem.extend(read_pem(key)?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| tls_error(cert, e))?;
                builder = builder.identity(identity);
            }
            builder = builder.danger_accept_invalid_certs(config.tls_insecure_skip_verify);
        }

        let http = builder.build().map_err(|e| ConfigError::Load(e.to_string()))?;
        Ok(Self::with_http_client(url, http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|e| tls_error(path, e))
}

fn tls_error(path: &Path, reason: impl fmt::Display) -> ConfigError {
    ConfigError::TlsMaterial {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl PtmTransport for HttpTransport {
    async fn execute(&self, request: &PtmRequest) -> PtmResult<PtmResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| request.transport_error(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| request.transport_error(e))?;
        Ok(PtmResponse { status, headers, body })
    }
}

/// PTM over a local unix domain socket, one HTTP/1 connection per call
pub struct UnixSocketTransport {
    path: PathBuf,
    dial_timeout: Duration,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>, dial_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            dial_timeout,
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl PtmTransport for UnixSocketTransport {
    async fn execute(&self, request: &PtmRequest) -> PtmResult<PtmResponse> {
        use http_body_util::{BodyExt, Full};
        use hyper_util::rt::TokioIo;

        let stream = tokio::time::timeout(self.dial_timeout, tokio::net::UnixStream::connect(&self.path))
            .await
            .map_err(|_| request.transport_error(format!("dial {} timed out", self.path.display())))?
            .map_err(|e| request.transport_error(e))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| request.transport_error(e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "ptm socket connection closed with error");
            }
        });

        let method = match request.method {
            HttpMethod::Get => hyper::Method::GET,
            HttpMethod::Post => hyper::Method::POST,
        };
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(request.path.as_str())
            .header(hyper::header::HOST, SOCKET_HOST)
            .header(hyper::header::USER_AGENT, USER_AGENT);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        let body = request.body.clone().unwrap_or_default();
        let http_request = builder
            .body(Full::new(body))
            .map_err(|e| request.transport_error(e))?;

        let response = sender
            .send_request(http_request)
            .await
            .map_err(|e| request.transport_error(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| request.transport_error(e))?
            .to_bytes();
        Ok(PtmResponse { status, headers, body })
    }
}

/// Deadline-bound access to a PTM transport
#[derive(Clone)]
pub struct PtmClient {
    transport: Arc<dyn PtmTransport>,
    timeout: Option<Duration>,
}

impl PtmClient {
    pub fn new(transport: Arc<dyn PtmTransport>, timeout: Option<Duration>) -> Self {
        Self { transport, timeout }
    }

    /// Plain HTTP client for `base_url`, mostly useful against test servers
    pub fn http(base_url: impl Into<String>, timeout: Option<Duration>) -> PtmResult<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(base_url)?), timeout))
    }

    pub fn from_config(config: &PtmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport: Arc<dyn PtmTransport> = match config.connection_type {
            ConnectionType::Http => Arc::new(HttpTransport::from_config(config)?),
            ConnectionType::Unix => {
                let path = config.socket_path().ok_or(ConfigError::MissingConnection)?;
                Arc::new(UnixSocketTransport::new(path, config.dial_timeout()))
            }
            ConnectionType::None => return Err(ConfigError::MissingConnection),
        };
        Ok(Self::new(transport, config.request_timeout()))
    }

    pub async fn execute(&self, request: PtmRequest) -> PtmResult<PtmResponse> {
        trace!(method = %request.method, path = %request.path, "ptm request");
        metrics::counter!("ptm_requests_total", "op" => operation_label(&request.path)).increment(1);
        let call = self.transport.execute(&request);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| PtmError::Timeout {
                method: request.method.to_string(),
                path: request.path.clone(),
                timeout_ms: limit.as_millis() as u64,
            })?,
            None => call.await,
        }
    }

    pub async fn get(&self, path: impl Into<String>) -> PtmResult<PtmResponse> {
        self.execute(PtmRequest::get(path)).await
    }

    /// JSON round trip; 200 and 201 are success, any other status becomes [`PtmError::Status`]
    pub async fn submit_json<Req, Resp>(&self, method: HttpMethod, path: &str, body: Option<&Req>) -> PtmResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut request = PtmRequest {
            method,
            path: path.to_string(),
            headers: vec![("Content-Type", "application/json".to_string()), ("Accept", "application/json".to_string())],
            body: None,
        };
        if let Some(body) = body {
            let encoded = serde_json::to_vec(body).map_err(|e| PtmError::InvalidPayload(format!(
                "unable to build json request for (method:{},path:{}). Cause: {}",
                method, path, e
            )))?;
            request.body = Some(Bytes::from(encoded));
        }

        let response = self.execute(request).await?.error_for_status()?;
        serde_json::from_slice(&response.body).map_err(|e| PtmError::Decode {
            method: method.to_string(),
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// First path segment, e.g. `transaction` for `/transaction/abc?isRaw=false`
fn operation_label(path: &str) -> String {
    path.trim_start_matches('/')
        .split(|c| c == '/' || c == '?')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct KeyResponse {
        key: String,
    }

    #[test]
    fn test_operation_label() {
        assert_eq!(operation_label("/transaction/abc%3D?isRaw=false"), "transaction");
        assert_eq!(operation_label("/upcheck"), "upcheck");
    }

    #[tokio::test]
    async fn test_submit_json_decodes_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "key": "abc" })))
            .mount(&server)
            .await;

        let client = PtmClient::http(server.uri(), Some(Duration::from_secs(5))).unwrap();
        let response: KeyResponse = client
            .submit_json(HttpMethod::Post, "/send", Some(&serde_json::json!({ "payload": "" })))
            .await
            .unwrap();
        assert_eq!(response.key, "abc");
    }

    #[tokio::test]
    async fn test_non_success_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/resident"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = PtmClient::http(server.uri(), None).unwrap();
        let err = client
            .submit_json::<(), Vec<String>>(HttpMethod::Get, "/groups/resident", None)
            .await
            .unwrap_err();
        assert_eq!(err, PtmError::Status { status: 500, body: "boom".to_string() });
        assert_eq!(err.to_string(), "500 status: boom");
    }

    #[tokio::test]
    async fn test_slow_ptm_surfaces_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upcheck"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = PtmClient::http(server.uri(), Some(Duration::from_millis(100))).unwrap();
        let err = client.get("/upcheck").await.unwrap_err();
        assert!(matches!(err, PtmError::Timeout { timeout_ms: 100, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_ptm_is_transport_error() {
        let client = PtmClient::http("http://127.0.0.1:1", Some(Duration::from_secs(2))).unwrap();
        let err = client.get("/upcheck").await.unwrap_err();
        assert!(matches!(err, PtmError::Transport { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PtmConfig::with_socket(dir.path().join("missing.ipc"));
        let client = PtmClient::from_config(&config).unwrap();
        let err = client.get("/upcheck").await.unwrap_err();
        assert!(matches!(err, PtmError::Transport { .. }));
    }
}
