//! Wire-level tests for the aria2 JSON-RPC client
//!
//! Each test starts a throwaway axum server on 127.0.0.1 that answers like
//! aria2 does and records every request it receives, so the tests can check
//! both what the client sends and how it decodes the answers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};

use varia::daemon::{Aria2Client, DaemonClient, DaemonStatus, TransferId};
use varia::error::DaemonError;

type Requests = Arc<Mutex<Vec<Value>>>;

const GID: &str = "2089b05ecca3d829";

/// Answer one request the way aria2 would.
fn respond(request: &Value) -> (StatusCode, Value) {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();
    let params = request["params"].as_array().cloned().unwrap_or_default();

    // Strip the secret token the way aria2 does before dispatch
    let token = params
        .first()
        .and_then(Value::as_str)
        .filter(|t| t.starts_with("token:"))
        .map(str::to_owned);
    let params: Vec<Value> = match token {
        Some(token) if token != "token:s3cret" => return error(id, 1, "Unauthorized"),
        Some(_) => params[1..].to_vec(),
        None => params,
    };

    let result = match method {
        "aria2.getVersion" => json!({ "version": "1.37.0", "enabledFeatures": ["HTTPS"] }),
        "aria2.addUri" => json!(GID),
        "aria2.tellStatus" => match params.first().and_then(Value::as_str) {
            Some(GID) => json!({
                "gid": GID,
                "status": "active",
                "completedLength": "1048576",
                "totalLength": "4194304",
                "downloadSpeed": "2048",
                "errorCode": "0",
                "errorMessage": "",
                "files": [{ "index": "1", "path": "/downloads/file.iso" }]
            }),
            Some("badnumbers") => json!({ "gid": "badnumbers", "status": "active", "completedLength": "lots" }),
            Some(other) => return error(id, 1, &format!("GID {} is not found", other)),
            None => return error(id, 1, "missing gid"),
        },
        "aria2.pause" | "aria2.forcePause" | "aria2.unpause" | "aria2.forceRemove" | "aria2.remove" => {
            params.first().cloned().unwrap_or(Value::Null)
        }
        "aria2.changeGlobalOption" | "aria2.shutdown" => json!("OK"),
        _ => return error(id, 1, "No such method"),
    };

    (StatusCode::OK, json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn error(id: Value, code: i64, message: &str) -> (StatusCode, Value) {
    (
        StatusCode::BAD_REQUEST,
        json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }),
    )
}

async fn rpc(State(requests): State<Requests>, Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
    let (status, body) = respond(&request);
    requests.lock().unwrap().push(request);
    (status, Json(body))
}

/// Start a fake daemon and return its endpoint plus the request log.
async fn spawn_fake_aria2() -> (String, Requests) {
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/jsonrpc", post(rpc))
        .with_state(requests.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/jsonrpc", addr), requests)
}

fn last_request(requests: &Requests) -> Value {
    requests.lock().unwrap().last().cloned().expect("no request recorded")
}

// =============================================================================
// Request Shape Tests
// =============================================================================

#[tokio::test]
async fn test_add_uri_passes_directory() {
    let (endpoint, requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();

    let id = client
        .create("http://example.com/file.iso", Path::new("/downloads"))
        .await
        .unwrap();
    assert_eq!(id, TransferId::new(GID));

    let request = last_request(&requests);
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "aria2.addUri");
    assert_eq!(
        request["params"],
        json!([["http://example.com/file.iso"], { "dir": "/downloads" }])
    );
    assert!(request.get("id").is_some());
}

#[tokio::test]
async fn test_global_limit_request() {
    let (endpoint, requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();

    client.set_global_download_limit("500M").await.unwrap();

    let request = last_request(&requests);
    assert_eq!(request["method"], "aria2.changeGlobalOption");
    assert_eq!(request["params"], json!([{ "max-overall-download-limit": "500M" }]));
}

#[tokio::test]
async fn test_method_names() {
    let (endpoint, requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();
    let id = TransferId::new(GID);

    client.pause(&id).await.unwrap();
    client.force_pause(&id).await.unwrap();
    client.resume(&id).await.unwrap();
    client.remove(&id, true).await.unwrap();
    client.remove(&id, false).await.unwrap();
    client.shutdown().await.unwrap();

    let methods: Vec<String> = requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r["method"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        methods,
        vec![
            "aria2.pause",
            "aria2.forcePause",
            "aria2.unpause",
            "aria2.forceRemove",
            "aria2.remove",
            "aria2.shutdown"
        ]
    );
}

#[tokio::test]
async fn test_secret_sent_as_first_param() {
    let (endpoint, requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap().with_secret("s3cret");

    client.pause(&TransferId::new(GID)).await.unwrap();
    assert_eq!(last_request(&requests)["params"], json!(["token:s3cret", GID]));

    let wrong = Aria2Client::new(&endpoint).unwrap().with_secret("nope");
    let err = wrong.version().await.unwrap_err();
    assert!(matches!(err, DaemonError::Rpc { ref message, .. } if message == "Unauthorized"));
}

// =============================================================================
// Response Decoding Tests
// =============================================================================

#[tokio::test]
async fn test_tell_status_decoding() {
    let (endpoint, _requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();

    let status = client.query(&TransferId::new(GID)).await.unwrap();
    assert_eq!(status.status, DaemonStatus::Active);
    assert_eq!(status.completed_length, 1_048_576);
    assert_eq!(status.total_length, 4_194_304);
    assert_eq!(status.download_speed, 2048);
    assert_eq!(status.progress_percent(), 25.0);
    assert!(status.error_message.is_none());
    assert_eq!(status.file_path.as_deref(), Some(Path::new("/downloads/file.iso")));
}

#[tokio::test]
async fn test_rpc_error_is_not_unreachable() {
    let (endpoint, _requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();

    let err = client.query(&TransferId::new("ffff")).await.unwrap_err();
    assert!(!err.is_unreachable());
    match err {
        DaemonError::Rpc { code, message } => {
            assert_eq!(code, 1);
            assert_eq!(message, "GID ffff is not found");
        }
        other => panic!("expected an RPC error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_numbers_are_protocol_errors() {
    let (endpoint, _requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();

    let err = client.query(&TransferId::new("badnumbers")).await.unwrap_err();
    assert!(matches!(err, DaemonError::Protocol(_)));
}

#[tokio::test]
async fn test_get_version() {
    let (endpoint, _requests) = spawn_fake_aria2().await;
    let client = Aria2Client::new(&endpoint).unwrap();
    assert_eq!(client.version().await.unwrap(), "1.37.0");
}

// =============================================================================
// Transport Failure Tests
// =============================================================================

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
        Aria2Client::with_timeout(format!("http://{}/jsonrpc", addr), Duration::from_secs(2)).unwrap();
    let err = client.query(&TransferId::new(GID)).await.unwrap_err();
    assert!(err.is_unreachable(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_slow_daemon_times_out() {
    let app = Router::new().route(
        "/jsonrpc",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "{}"
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client =
        Aria2Client::with_timeout(format!("http://{}/jsonrpc", addr), Duration::from_millis(200)).unwrap();
    let err = client.shutdown().await.unwrap_err();
    assert!(matches!(err, DaemonError::Timeout(_)), "unexpected error: {:?}", err);
    assert!(err.is_unreachable());
}
