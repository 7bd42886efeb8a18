//! JSON-RPC client a light client uses to reach its server peer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use pvt_common::{PtmError, PtmResult};
use pvt_ptm::engine::RpcCaller;

use crate::token_holder::TokenHolder;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

/// [`RpcCaller`] over HTTP, authenticated with the holder's current token
pub struct HttpRpcCaller {
    url: String,
    http: reqwest::Client,
    credentials: Option<Arc<TokenHolder>>,
    next_id: AtomicU64,
}

impl HttpRpcCaller {
    pub fn new(url: impl Into<String>, credentials: Option<Arc<TokenHolder>>) -> PtmResult<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PtmError::Connection(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
            credentials,
            next_id: AtomicU64::new(1),
        })
    }

    fn error(&self, method: &str, reason: impl ToString) -> PtmError {
        PtmError::Transport {
            method: "POST".to_string(),
            path: format!("{}#{}", self.url, method),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RpcCaller for HttpRpcCaller {
    async fn call(&self, method: &str, params: Vec<Value>) -> PtmResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(id, method, "qlight rpc call");

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(holder) = &self.credentials {
            let token = holder.http_credentials().await;
            if !token.is_empty() {
                request = request.header(reqwest::header::AUTHORIZATION, token);
            }
        }

        let response = request.send().await.map_err(|e| self.error(method, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PtmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let decoded: RpcResponse = response.json().await.map_err(|e| PtmError::Decode {
            method: "POST".to_string(),
            path: format!("{}#{}", self.url, method),
            reason: e.to_string(),
        })?;
        match decoded.error {
            Some(err) => Err(PtmError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            }),
            None => Ok(decoded.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_call_returns_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "jsonrpc": "2.0",
                "method": "eth_getQuorumPayloadExtra",
                "params": ["0x01"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"payload": "0x", "isSender": false},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let caller = HttpRpcCaller::new(server.uri(), None).unwrap();
        let result = caller
            .call("eth_getQuorumPayloadExtra", vec![json!("0x01")])
            .await
            .unwrap();
        assert_eq!(result["payload"], "0x");
    }

    #[tokio::test]
    async fn test_token_is_sent_as_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer opaque"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": null})))
            .expect(1)
            .mount(&server)
            .await;

        let holder = TokenHolder::with_plugin("psi1".into(), 0, None);
        holder.set_current_token("Bearer opaque");
        let caller = HttpRpcCaller::new(server.uri(), Some(holder)).unwrap();
        assert_eq!(caller.call("eth_blockNumber", Vec::new()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_rpc_error_object_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32000, "message": "not authorized"},
            })))
            .mount(&server)
            .await;

        let caller = HttpRpcCaller::new(server.uri(), None).unwrap();
        let err = caller.call("eth_getQuorumPayloadExtra", Vec::new()).await.unwrap_err();
        assert_eq!(
            err,
            PtmError::Rpc {
                method: "eth_getQuorumPayloadExtra".to_string(),
                code: -32000,
                message: "not authorized".to_string(),
            }
        );
        // the peer answered, retrying the same call gets the same answer
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let caller = HttpRpcCaller::new(server.uri(), None).unwrap();
        let err = caller.call("eth_getQuorumPayloadExtra", Vec::new()).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let caller = HttpRpcCaller::new("http://127.0.0.1:1", None).unwrap();
        let err = caller.call("eth_getQuorumPayloadExtra", Vec::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
