//! End-to-end scenarios: the axum surface on one side, a fake worker
//! speaking the real wire protocol over a real Unix socket on the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::{unix::OwnedReadHalf, unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tower::ServiceExt;

use crate::config::ServerConfig;
use crate::func_config::FuncConfig;
use crate::gateway::Gateway;
use crate::grpc;
use crate::message_connection::{read_frame, run_ipc_listener, write_frame};
use crate::metrics::GatewayMetrics;
use crate::protocol::{FuncCall, Message, MessageType, MESSAGE_INLINE_DATA_SIZE};
use crate::routes::{create_routes, RouteState};
use crate::shm::{func_call_input_name, func_call_output_name, ShmRegion};
use crate::worker_manager::WorkerManager;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestGateway {
    gateway: Arc<Gateway>,
    router: Router,
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<()>,
    _tempdir: tempfile::TempDir,
}

fn start(config_json: &str, cap: u64) -> TestGateway {
    let tempdir = tempfile::tempdir().unwrap();
    let socket_path = tempdir.path().join("gateway.sock");
    let server_config = ServerConfig {
        func_config_file: "funcs.json".to_string(),
        max_running_external_requests: cap,
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::new(
        FuncConfig::load(config_json).unwrap(),
        config_json.to_string(),
        &server_config,
        Arc::new(WorkerManager::new()),
        GatewayMetrics::new(),
    ));
    let listener = UnixListener::bind(&socket_path).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(run_ipc_listener(listener, gateway.clone(), shutdown_rx));
    let router = create_routes(RouteState {
        gateway: gateway.clone(),
        server_handle: axum_server::Handle::new(),
        shutdown_tx: shutdown_tx.clone(),
    });
    TestGateway {
        gateway,
        router,
        socket_path,
        shutdown_tx,
        _tempdir: tempdir,
    }
}

async fn http_post(router: &Router, path: &str, body: &[u8]) -> (StatusCode, Bytes) {
    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .method(http::Method::POST)
                .uri(path)
                .body(axum::body::Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes)
}

async fn http_get(router: &Router, path: &str) -> (StatusCode, Bytes) {
    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .uri(path)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes)
}

struct FakeWorker {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FakeWorker {
    async fn connect(socket_path: &Path, func_id: u16) -> Self {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, Message::new_func_worker_handshake(func_id), &[])
            .await
            .unwrap();
        let (response, payload) = timeout(RECV_TIMEOUT, read_frame(&mut reader, usize::MAX))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.message_type, MessageType::HandshakeResponse);
        assert_ne!(response.func_call().client_id, 0);
        assert!(!payload.is_empty(), "config json must be echoed back");
        Self { reader, writer }
    }

    async fn recv_invoke(&mut self) -> (Message, Bytes) {
        let (message, payload) = timeout(
            RECV_TIMEOUT,
            read_frame(&mut self.reader, MESSAGE_INLINE_DATA_SIZE),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(message.message_type, MessageType::InvokeFunc);
        (message, payload)
    }

    async fn send_complete(&mut self, call: FuncCall, output: &[u8]) {
        if output.len() > MESSAGE_INLINE_DATA_SIZE {
            let mut region =
                ShmRegion::create(&func_call_output_name(call.full_call_id()), output.len())
                    .unwrap();
            region.as_mut_slice().copy_from_slice(output);
            let message = Message::new_func_call_complete(call, 100, -(output.len() as i32));
            write_frame(&mut self.writer, message, &[]).await.unwrap();
        } else {
            let message = Message::new_func_call_complete(call, 100, output.len() as i32);
            write_frame(&mut self.writer, message, output).await.unwrap();
        }
    }

    async fn send_failed(&mut self, call: FuncCall) {
        let message = Message::new_func_call_failed(call, 0);
        write_frame(&mut self.writer, message, &[]).await.unwrap();
    }
}

#[tokio::test]
async fn hello_responds() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let (status, body) = http_get(&harness.router, "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"Hello world\n");
}

#[tokio::test]
async fn unknown_function_is_not_found_before_admission() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let (status, _) = http_post(&harness.router, "/function/nope", b"hi").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(harness.gateway.counters().snapshot().incoming, 0);
}

#[tokio::test]
async fn small_payload_round_trips_inline() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let mut worker = FakeWorker::connect(&harness.socket_path, 1).await;

    let post = http_post(&harness.router, "/function/echo", b"hi");
    let serve = async {
        let (invoke, payload) = worker.recv_invoke().await;
        assert!(invoke.payload_size >= 0, "small inputs must stay inline");
        assert_eq!(payload.as_ref(), b"hi");
        // No input region may exist for an inline call.
        assert!(ShmRegion::open(&func_call_input_name(invoke.full_call_id)).is_err());
        worker.send_complete(invoke.func_call(), b"hi").await;
    };
    let ((status, body), ()) = tokio::join!(post, serve);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"hi");
}

#[tokio::test]
async fn large_payload_round_trips_through_shm() {
    let harness = start(r#"[{"funcName": "blob", "funcId": 3}]"#, 0);
    let mut worker = FakeWorker::connect(&harness.socket_path, 3).await;
    let input = vec![b'x'; 4096];

    let post = http_post(&harness.router, "/function/blob", &input);
    let serve = async {
        let (invoke, payload) = worker.recv_invoke().await;
        assert_eq!(invoke.payload_size, -4096);
        assert!(payload.is_empty());

        // The input region exists while the call is running.
        let region = ShmRegion::open(&func_call_input_name(invoke.full_call_id)).unwrap();
        assert_eq!(region.as_slice(), &input[..]);
        let echoed = region.as_slice().to_vec();
        drop(region);

        worker.send_complete(invoke.func_call(), &echoed).await;
        invoke.full_call_id
    };
    let ((status, body), full_call_id) = tokio::join!(post, serve);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), &input[..]);

    // Both regions are unlinked once the response is out.
    assert!(ShmRegion::open(&func_call_input_name(full_call_id)).is_err());
    assert!(ShmRegion::open(&func_call_output_name(full_call_id)).is_err());
}

#[tokio::test]
async fn dispatch_failure_when_no_worker_is_connected() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let (status, body) = http_post(&harness.router, "/function/echo", b"hi").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body.as_ref(), b"Dispatch failed for func_id 1\n");
    assert_eq!(harness.gateway.running_external_count(), 0);
}

#[tokio::test]
async fn worker_reported_failure_maps_to_500() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let mut worker = FakeWorker::connect(&harness.socket_path, 1).await;

    let post = http_post(&harness.router, "/function/echo", b"boom");
    let serve = async {
        let (invoke, _) = worker.recv_invoke().await;
        worker.send_failed(invoke.func_call()).await;
    };
    let ((status, body), ()) = tokio::join!(post, serve);
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body.as_ref(), b"Function call failed\n");
    assert_eq!(harness.gateway.running_external_count(), 0);
}

#[tokio::test]
async fn worker_disconnect_mid_call_resolves_as_dispatch_failure() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let mut worker = FakeWorker::connect(&harness.socket_path, 1).await;

    let post = http_post(&harness.router, "/function/echo", b"hi");
    let serve = async {
        let _ = worker.recv_invoke().await;
        // Peer dies before replying.
        drop(worker);
    };
    let ((status, body), ()) = tokio::join!(post, serve);
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body.as_ref(), b"Dispatch failed for func_id 1\n");
    assert_eq!(harness.gateway.running_external_count(), 0);
}

#[tokio::test]
async fn rejected_handshake_closes_the_connection_without_a_response() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, Message::new_func_worker_handshake(99), &[])
        .await
        .unwrap();
    let result = timeout(RECV_TIMEOUT, read_frame(&mut reader, usize::MAX))
        .await
        .unwrap();
    assert!(result.is_err(), "gateway must close without responding");
}

#[tokio::test]
async fn shutdown_route_broadcasts_the_stop_signal() {
    let harness = start(r#"[{"funcName": "echo", "funcId": 1}]"#, 0);
    let mut shutdown_rx = harness.shutdown_tx.subscribe();
    let (status, body) = http_post(&harness.router, "/shutdown", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"Server is shutting down\n");
    timeout(RECV_TIMEOUT, shutdown_rx.changed())
        .await
        .unwrap()
        .unwrap();
}

fn grpc_request(path: &str, payload: &[u8]) -> http::Request<http_body_util::Full<Bytes>> {
    let mut framed = Vec::with_capacity(5 + payload.len());
    framed.push(0);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header("te", "trailers")
        .body(http_body_util::Full::new(Bytes::from(framed)))
        .unwrap()
}

#[tokio::test]
async fn grpc_unary_call_round_trips() {
    let harness = start(
        r#"[{"funcName": "grpc:svc", "funcId": 4, "grpcMethods": ["Echo"]}]"#,
        0,
    );
    let mut worker = FakeWorker::connect(&harness.socket_path, 4).await;

    let call = grpc::handle_request(harness.gateway.clone(), grpc_request("/svc/Echo", b"hi"));
    let serve = async {
        let (invoke, payload) = worker.recv_invoke().await;
        assert_eq!(invoke.func_call().method_id, 0);
        assert_eq!(payload.as_ref(), b"hi");
        worker.send_complete(invoke.func_call(), b"hi").await;
    };
    let (response, ()) = tokio::join!(call, serve);
    assert_eq!(response.status(), http::StatusCode::OK);
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    let data = collected.to_bytes();
    assert_eq!(data.as_ref(), &[0, 0, 0, 0, 2, b'h', b'i']);
    let trailers = trailers.expect("unary responses end with trailers");
    assert_eq!(
        trailers.get("grpc-status"),
        Some(&http::HeaderValue::from_static("0"))
    );
}
