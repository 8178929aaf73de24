//! WOPI storage scenarios against an in-process mock host
//!
//! The mock host serves CheckFileInfo / GetFile / PutFile on a loopback
//! port; tests drive brokers against it to cover token replay, the info
//! frames sent at load, disk-full handling and the external-modification
//! latch.

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use common::*;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coedit::storage::TokenLedger;

#[derive(Debug)]
struct HostState {
    content: Vec<u8>,
    modified: String,
    put_status: u16,
    put_count: usize,
}

#[derive(Clone)]
struct Host {
    state: Arc<Mutex<HostState>>,
}

impl Host {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                content: b"spreadsheet bytes".to_vec(),
                modified: "2024-01-01T00:00:00Z".to_string(),
                put_status: 200,
                put_count: 0,
            })),
        }
    }

    fn set_modified(&self, value: &str) {
        self.state.lock().unwrap().modified = value.to_string();
    }

    fn set_put_status(&self, status: u16) {
        self.state.lock().unwrap().put_status = status;
    }

    fn put_count(&self) -> usize {
        self.state.lock().unwrap().put_count
    }
}

async fn check_file_info(State(host): State<Host>) -> Json<serde_json::Value> {
    let state = host.state.lock().unwrap();
    Json(serde_json::json!({
        "BaseFileName": "budget.ods",
        "Size": state.content.len(),
        "OwnerId": "alice",
        "UserId": "alice",
        "UserFriendlyName": "Alice",
        "UserCanWrite": true,
        "LastModifiedTime": state.modified,
        "PostMessageOrigin": "http://office.example.com",
        "HidePrintOption": false
    }))
}

async fn get_file(State(host): State<Host>) -> Vec<u8> {
    host.state.lock().unwrap().content.clone()
}

async fn put_file(State(host): State<Host>, body: axum::body::Bytes) -> StatusCode {
    let mut state = host.state.lock().unwrap();
    state.put_count += 1;
    let status = StatusCode::from_u16(state.put_status).unwrap();
    if status.is_success() {
        state.content = body.to_vec();
    }
    status
}

async fn spawn_host(host: Host) -> SocketAddr {
    let app = Router::new()
        .route("/wopi/files/42", get(check_file_info))
        .route("/wopi/files/42/contents", get(get_file).post(put_file))
        .with_state(host);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_wopi_load_sends_info_and_stats_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = spawn_host(Host::new()).await;

    let services = test_services(test_config(tmp.path()), None);
    let mut kit = supply_kit(&services, 1);
    let registry = make_registry(services);

    let uri = format!("http://{}/wopi/files/42?access_token=T1", addr);
    let broker = registry.find_or_create(&uri).await.unwrap();
    let (session, mut client_rx) = make_session(&uri);
    broker.add_session(session).await.unwrap();
    kit.expect_frame().await;

    let wopi_frame = recv_text(&mut client_rx).await;
    assert!(wopi_frame.starts_with("wopi: {"), "{}", wopi_frame);
    assert!(
        wopi_frame.contains("\"PostMessageOrigin\":\"http://office.example.com\""),
        "{}",
        wopi_frame
    );
    assert!(wopi_frame.contains("\"title\":\"budget.ods\""), "{}", wopi_frame);

    let stats_frame = recv_text(&mut client_rx).await;
    assert!(
        stats_frame.starts_with("stats: wopiloadduration "),
        "{}",
        stats_frame
    );
}

#[tokio::test]
async fn test_replayed_access_token_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = spawn_host(Host::new()).await;

    let ledger = TokenLedger::open_in_memory().await.unwrap();
    let services = test_services(test_config(tmp.path()), Some(ledger));
    let mut kit = supply_kit(&services, 1);
    let registry = make_registry(services);

    let uri = format!("http://{}/wopi/files/42?access_token=SECRET", addr);
    let broker = registry.find_or_create(&uri).await.unwrap();

    let (first, _rx1) = make_session(&uri);
    broker.add_session(first).await.unwrap();
    kit.expect_frame().await;

    // Same token again: refused before CheckFileInfo.
    let (replay, _rx2) = make_session(&uri);
    let err = broker.add_session(replay).await.unwrap_err();
    assert!(
        matches!(
            err,
            coedit::DocError::Storage(coedit::StorageError::Unauthorized { .. })
        ),
        "unexpected error: {}",
        err
    );

    // docpass=yes bypasses the ledger.
    let passed_uri = format!(
        "http://{}/wopi/files/42?access_token=SECRET&docpass=yes",
        addr
    );
    let (passed, _rx3) = make_session(&passed_uri);
    assert_eq!(broker.add_session(passed).await.unwrap(), 2);
    kit.expect_frame().await;
}

#[tokio::test]
async fn test_disk_full_on_save_goes_to_every_session() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Host::new();
    host.set_put_status(507);
    let addr = spawn_host(host.clone()).await;

    let services = test_services(test_config(tmp.path()), None);
    let mut kit = supply_kit(&services, 1);
    let registry = make_registry(services);

    let uri_a = format!("http://{}/wopi/files/42?access_token=TA", addr);
    let uri_b = format!("http://{}/wopi/files/42?access_token=TB", addr);

    let broker = registry.find_or_create(&uri_a).await.unwrap();
    let (s1, mut rx1) = make_session(&uri_a);
    let sid1 = s1.id().to_string();
    broker.add_session(s1).await.unwrap();
    kit.expect_frame().await;
    let (s2, mut rx2) = make_session(&uri_b);
    broker.add_session(s2).await.unwrap();
    kit.expect_frame().await;

    // Drain the load-time frames so only the error remains.
    recv_text(&mut rx1).await; // wopi:
    recv_text(&mut rx1).await; // stats:
    recv_text(&mut rx2).await;
    recv_text(&mut rx2).await;

    broker.client_command(&sid1, "save dontTerminateEdit=1 dontSaveIfUnmodified=0");
    kit.expect_frame().await;
    kit.send(&format!("client-{} unocommandresult: cmd=save success=true", sid1)).await;

    assert_eq!(
        recv_text(&mut rx1).await,
        "error: cmd=storage kind=savediskfull"
    );
    assert_eq!(
        recv_text(&mut rx2).await,
        "error: cmd=storage kind=savediskfull"
    );

    // The broker survives a full disk.
    assert_eq!(registry.broker_count().await, 1);
}

#[tokio::test]
async fn test_external_modification_latches_and_refuses_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Host::new();
    let addr = spawn_host(host.clone()).await;

    let services = test_services(test_config(tmp.path()), None);
    let mut kit = supply_kit(&services, 1);
    let registry = make_registry(services);

    let uri_a = format!("http://{}/wopi/files/42?access_token=TA", addr);
    let uri_b = format!("http://{}/wopi/files/42?access_token=TB", addr);

    let broker = registry.find_or_create(&uri_a).await.unwrap();
    let (s1, mut rx1) = make_session(&uri_a);
    let sid1 = s1.id().to_string();
    broker.add_session(s1).await.unwrap();
    kit.expect_frame().await;
    recv_text(&mut rx1).await;
    recv_text(&mut rx1).await;

    // Someone else wrote the file on the storage host.
    host.set_modified("2024-06-30T12:00:00Z");

    let (s2, _rx2) = make_session(&uri_b);
    broker.add_session(s2).await.unwrap();
    kit.expect_frame().await;

    broker.client_command(&sid1, "save dontTerminateEdit=1 dontSaveIfUnmodified=0");
    kit.expect_frame().await;
    kit.send(&format!("client-{} unocommandresult: cmd=save success=true", sid1)).await;

    assert_eq!(recv_text(&mut rx1).await, "error: cmd=storage kind=savefailed");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.put_count(), 0, "upload must not happen after the latch");
}
