//! WebSocket client for the transactor (the platform's system of record).
//!
//! Wire format: JSON text frames.
//! ```text
//! → {"id": 1, "method": "findAttachment", "params": {"id": "doc-1"}}
//! ← {"id": 1, "result": {"id": "doc-1", "lastModified": 0, "size": 0, "modifiedBy": ""}}
//! ← {"id": 2, "error": {"code": 404, "message": "..."}}
//! ```
//!
//! The credential travels in the URL path (`{url}/{credential}`) and the
//! service id in the `User-Agent` header. Requests on one connection are
//! strictly sequential; responses carrying another id are skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    Account, Attachment, AttachmentUpdate, PlatformConnection, PlatformConnector, PlatformError,
};

pub const METHOD_FIND_ACCOUNT: &str = "findAccount";
pub const METHOD_FIND_ATTACHMENT: &str = "findAttachment";
pub const METHOD_UPDATE_ATTACHMENT: &str = "updateAttachment";

/// Request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Opens transactor connections.
#[derive(Debug, Clone)]
pub struct TransactorConnector {
    service_id: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TransactorConnector {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upper bound for one request/response exchange, and for closing.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

#[async_trait]
impl PlatformConnector for TransactorConnector {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
    ) -> Result<Box<dyn PlatformConnection>, PlatformError> {
        let endpoint = format!("{}/{}", url.trim_end_matches('/'), credential);
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| PlatformError::Connect(e.to_string()))?;
        let agent = HeaderValue::from_str(&self.service_id)
            .map_err(|e| PlatformError::Connect(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let connecting = tokio_tungstenite::connect_async(request);
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| PlatformError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|e| PlatformError::Connect(e.to_string()))?;

        log::debug!("Connected to transactor {url}");
        Ok(Box::new(TransactorConnection {
            ws: Mutex::new(ws),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            request_timeout: self.request_timeout,
        }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One transactor session.
pub struct TransactorConnection {
    ws: Mutex<WsStream>,
    next_id: AtomicU64,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl TransactorConnection {
    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, PlatformError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlatformError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        let text =
            serde_json::to_string(&request).map_err(|e| PlatformError::Protocol(e.to_string()))?;

        let mut ws = self.ws.lock().await;
        let exchange = Self::exchange(&mut ws, id, text);
        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Err(PlatformError::ConnectionClosed)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(PlatformError::ConnectionClosed)
            }
            Ok(result) => {
                let value = result?.unwrap_or(Value::Null);
                serde_json::from_value(value).map_err(|e| PlatformError::Protocol(e.to_string()))
            }
            Err(_) => Err(PlatformError::Timeout(format!(
                "{method} got no response within {:?}",
                self.request_timeout
            ))),
        }
    }

    /// Send one request and wait for the response carrying `id`.
    async fn exchange(ws: &mut WsStream, id: u64, text: String) -> Result<Option<Value>, PlatformError> {
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(body))) => {
                    let response: RpcResponse = serde_json::from_str(body.as_str())
                        .map_err(|e| PlatformError::Protocol(e.to_string()))?;
                    if response.id != id {
                        log::debug!("Skipping transactor response {} (waiting for {id})", response.id);
                        continue;
                    }
                    if let Some(err) = response.error {
                        return Err(PlatformError::Remote {
                            code: err.code,
                            message: err.message,
                        });
                    }
                    return Ok(response.result);
                }
                Some(Ok(Message::Close(_))) | None => return Err(PlatformError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PlatformError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl PlatformConnection for TransactorConnection {
    async fn find_account(&self, email: &str) -> Result<Option<Account>, PlatformError> {
        self.call(METHOD_FIND_ACCOUNT, json!({ "email": email })).await
    }

    async fn find_attachment(&self, id: &str) -> Result<Option<Attachment>, PlatformError> {
        self.call(METHOD_FIND_ATTACHMENT, json!({ "id": id })).await
    }

    async fn update_attachment(
        &self,
        id: &str,
        update: AttachmentUpdate,
        actor: &str,
    ) -> Result<(), PlatformError> {
        let params = json!({ "id": id, "update": update, "modifiedBy": actor });
        let _: Value = self.call(METHOD_UPDATE_ATTACHMENT, params).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut ws = self.ws.lock().await;
        let closing = tokio::time::timeout(self.request_timeout, ws.close(None)).await;
        let Ok(closing) = closing else {
            return Err(PlatformError::Timeout("close handshake".into()));
        };
        match closing {
            Ok(()) => Ok(()),
            // Peer already went away; nothing left to release
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(PlatformError::Transport(e.to_string())),
        }
    }
}
