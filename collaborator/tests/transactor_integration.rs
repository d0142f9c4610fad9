//! Transactor client against a mock transactor.
//!
//! The mock speaks the JSON-RPC text protocol, records the handshake path
//! and `User-Agent`, and keeps every request it receives.

use std::sync::{Arc, Mutex};

use collaborator::platform::transactor::{RpcRequest, RpcResponse};
use collaborator::extension::Extension;
use collaborator::{
    BlobStore, MeasureContext, MemoryBlobStore, PlatformConnector, PlatformError, SessionContext,
    StorageConfiguration, StorageExtension, Token, TokenIssuer, TransactorConnector,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use yrs::{Doc, Text, Transact, WriteTxn};

#[derive(Default)]
struct Recorded {
    path: Option<String>,
    user_agent: Option<String>,
    requests: Vec<RpcRequest>,
}

/// Accept one connection and answer until the client closes.
async fn start_mock_transactor(attachment_exists: bool) -> (String, Arc<Mutex<Recorded>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::new(Mutex::new(Recorded::default()));

    let state = recorded.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let handshake = state.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let mut r = handshake.lock().unwrap();
            r.path = Some(req.uri().path().to_string());
            r.user_agent = req
                .headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(body) = msg else { continue };
            let request: RpcRequest = serde_json::from_str(body.as_str()).unwrap();
            let result = match request.method.as_str() {
                "findAttachment" if attachment_exists => {
                    json!({ "id": request.params["id"], "lastModified": 0, "size": 0, "modifiedBy": "" })
                }
                "findAccount" => json!({ "id": "acc-alice", "email": request.params["email"] }),
                _ => Value::Null,
            };
            let response = RpcResponse {
                id: request.id,
                result: Some(result),
                error: None,
            };
            state.lock().unwrap().requests.push(request);
            let text = serde_json::to_string(&response).unwrap();
            if ws.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    (format!("ws://{addr}"), recorded)
}

fn doc_with_text(content: &str) -> Doc {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }
    doc
}

#[tokio::test]
async fn test_handshake_carries_credential_and_service_id() {
    let (url, recorded) = start_mock_transactor(true).await;
    let connector = TransactorConnector::new("collaborator-test");

    let conn = connector.connect(&url, "cred-123").await.unwrap();
    let record = conn.find_attachment("doc-1").await.unwrap();
    conn.close().await.unwrap();

    assert_eq!(record.unwrap().id, "doc-1");
    let r = recorded.lock().unwrap();
    assert_eq!(r.path.as_deref(), Some("/cred-123"));
    assert_eq!(r.user_agent.as_deref(), Some("collaborator-test"));
}

#[tokio::test]
async fn test_missing_attachment_is_none() {
    let (url, _) = start_mock_transactor(false).await;
    let conn = TransactorConnector::new("collaborator")
        .connect(&url, "cred")
        .await
        .unwrap();

    assert!(conn.find_attachment("doc-1").await.unwrap().is_none());
    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(matches!(
        conn.find_attachment("doc-1").await,
        Err(PlatformError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_store_updates_record_through_transactor() {
    let (url, recorded) = start_mock_transactor(true).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let issuer = Arc::new(TokenIssuer::new("secret", Duration::from_secs(60)));
    let extension = StorageExtension::new(StorageConfiguration {
        measure: MeasureContext::new("collaborator"),
        blobs: blobs.clone(),
        platform: Arc::new(TransactorConnector::new("collaborator")),
        issuer: issuer.clone(),
        transactor_url: url,
    });
    let context = SessionContext::new(Token::new("alice@example.com", "ws-1"));

    extension
        .on_store_document("doc-1", &context, &doc_with_text("Hello"))
        .await
        .unwrap();

    let stored = blobs.read("ws-1", "doc-1").await.unwrap();
    let r = recorded.lock().unwrap();

    let credential = r.path.as_deref().unwrap().trim_start_matches('/');
    let token = issuer.verify(credential).unwrap();
    assert_eq!(token.email, "alice@example.com");
    assert_eq!(token.workspace, "ws-1");

    let methods: Vec<&str> = r.requests.iter().map(|req| req.method.as_str()).collect();
    assert_eq!(methods, vec!["findAccount", "findAttachment", "updateAttachment"]);

    let update = &r.requests[2].params;
    assert_eq!(update["id"], "doc-1");
    assert_eq!(update["update"]["size"], stored.len() as u64);
    assert_eq!(update["modifiedBy"], "acc-alice");
}

/// Accept one connection, read everything, answer nothing.
async fn start_silent_transactor() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let url = start_silent_transactor().await;
    let conn = TransactorConnector::new("collaborator")
        .with_request_timeout(Duration::from_millis(200))
        .connect(&url, "cred")
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), conn.find_attachment("doc-1"))
        .await
        .expect("request should give up on its own");
    assert!(matches!(result, Err(PlatformError::Timeout(_))));
    let _ = conn.close().await;
}

#[tokio::test]
async fn test_store_completes_when_transactor_is_silent() {
    let url = start_silent_transactor().await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let extension = StorageExtension::new(StorageConfiguration {
        measure: MeasureContext::new("collaborator"),
        blobs: blobs.clone(),
        platform: Arc::new(
            TransactorConnector::new("collaborator").with_request_timeout(Duration::from_millis(200)),
        ),
        issuer: Arc::new(TokenIssuer::new("secret", Duration::from_secs(60))),
        transactor_url: url,
    });
    let context = SessionContext::new(Token::new("alice@example.com", "ws-1"));

    let stored = tokio::time::timeout(
        Duration::from_secs(5),
        extension.on_store_document("doc-1", &context, &doc_with_text("Hello")),
    )
    .await
    .expect("store should not wait on the transactor forever");

    assert!(stored.is_ok());
    assert!(blobs.stat("ws-1", "doc-1").await.unwrap().is_some());
}
