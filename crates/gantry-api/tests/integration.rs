//! Control-plane integration tests
//!
//! Drive the router end to end over an in-memory backend: reserve,
//! initialize, run, callbacks, drain refusal, and backend liveness.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    routing::put,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use gantry_api::{build_router, ApiState};
use gantry_backend::{BackendCapacity, InMemoryBackend};
use gantry_engine::{
    Capacity, DispatcherConfig, DownloadCache, DrainController, Executor, Registry, RunDispatcher,
    RunResult, Transformer,
};

struct TestNode {
    router: Router,
    backend: Arc<InMemoryBackend>,
    dispatcher: Arc<RunDispatcher>,
    drain: DrainController,
    _cache_dir: tempfile::TempDir,
}

/// Assemble a whole executor over a 1 GiB / 1 GiB / 1024-container backend
fn test_node() -> TestNode {
    let backend = Arc::new(InMemoryBackend::with_capacity(BackendCapacity {
        memory_in_bytes: 1024 * 1024 * 1024,
        disk_in_bytes: 1024 * 1024 * 1024,
        max_containers: 1024,
    }));

    let registry = Arc::new(Registry::new(
        Capacity {
            memory_mb: 1024,
            disk_mb: 1024,
            containers: 1024,
        },
        Duration::from_secs(60),
    ));

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DownloadCache::new(cache_dir.path().to_path_buf(), 1024 * 1024).unwrap());
    let transformer = Transformer::new(
        backend.clone(),
        cache,
        Arc::new(tokio::sync::Semaphore::new(2)),
        false,
    );
    let dispatcher = RunDispatcher::new(
        registry.clone(),
        backend.clone(),
        DispatcherConfig {
            worker_count: 2,
            callback_retries: 3,
            callback_backoff_base: Duration::from_millis(10),
        },
    );
    let (log_tx, _log_rx) = tokio::sync::mpsc::unbounded_channel();
    let executor = Arc::new(Executor::new(
        registry,
        backend.clone(),
        transformer,
        dispatcher.clone(),
        "executor-name".into(),
        1024,
        log_tx,
    ));

    let drain = DrainController::new(Duration::from_secs(60));
    let router = build_router(ApiState::new(executor, drain.clone()));
    TestNode {
        router,
        backend,
        dispatcher,
        drain,
        _cache_dir: cache_dir,
    }
}

/// A callback receiver the dispatcher can PUT results to
async fn callback_server() -> (String, Arc<Mutex<Vec<RunResult>>>) {
    let received: Arc<Mutex<Vec<RunResult>>> = Arc::new(Mutex::new(Vec::new()));

    async fn record(
        State(received): State<Arc<Mutex<Vec<RunResult>>>>,
        Json(result): Json<RunResult>,
    ) -> StatusCode {
        received.lock().unwrap().push(result);
        StatusCode::OK
    }

    let app = Router::new()
        .route("/result", put(record))
        .with_state(received.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/result", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (url, received)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn reserve(node: &TestNode, guid: &str) {
    let (status, _) = send(
        &node.router,
        post_json(
            &format!("/containers/{guid}"),
            json!({"memory_mb": 1024, "disk_mb": 1024}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn reserve_initialize_run_callback_release() {
    let node = test_node();
    let (callback_url, received) = callback_server().await;

    reserve(&node, "g1").await;

    let (status, body) = send(
        &node.router,
        post_json("/containers/g1/initialize", json!({"cpu_percent": 50.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["guid"], "g1");
    assert_eq!(body["state"], "initialized");

    let (status, _) = send(
        &node.router,
        post_json(
            "/containers/g1/run",
            json!({
                "actions": [{"action": "run", "path": "ls"}],
                "complete_url": callback_url,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    node.dispatcher.wait_idle().await;

    // The backend saw exactly the expected operation sequence
    use gantry_backend::memory::BackendEvent;
    let events = node.backend.events();
    let handle = match &events[0] {
        BackendEvent::Created { handle } => handle.clone(),
        other => panic!("expected create first, got {other:?}"),
    };
    assert_eq!(
        events,
        vec![
            BackendEvent::Created {
                handle: handle.clone()
            },
            BackendEvent::LimitedMemory {
                handle: handle.clone(),
                limit_in_bytes: 1024 * 1024 * 1024,
            },
            BackendEvent::LimitedDisk {
                handle: handle.clone(),
                byte_hard: 1024 * 1024 * 1024,
            },
            BackendEvent::LimitedCpu {
                handle: handle.clone(),
                limit_in_shares: 512,
            },
            BackendEvent::Ran {
                handle: handle.clone(),
                path: "ls".into(),
            },
            BackendEvent::Destroyed { handle },
        ]
    );

    // The callback carried the finished result
    assert_eq!(
        received.lock().unwrap().clone(),
        vec![RunResult {
            guid: "g1".into(),
            failed: false,
            failure_reason: String::new(),
            result: String::new(),
        }]
    );

    // Everything was released
    let (status, body) = send(&node.router, get("/resources/remaining")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"memory_mb": 1024, "disk_mb": 1024, "containers": 1024})
    );
}

#[tokio::test]
async fn invalid_cpu_percent_is_rejected() {
    let node = test_node();
    reserve(&node, "g1").await;

    for cpu in [101.0, -14.0] {
        let (status, _) = send(
            &node.router,
            post_json("/containers/g1/initialize", json!({"cpu_percent": cpu})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // The reservation is still there, untouched
    let (status, body) = send(&node.router, get("/containers/g1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "reserved");
}

#[tokio::test]
async fn ports_come_back_mapped() {
    let node = test_node();
    reserve(&node, "g1").await;
    node.backend.script_net_in(1234, 4567);
    node.backend.script_net_in(2468, 9134);

    let (status, body) = send(
        &node.router,
        post_json(
            "/containers/g1/initialize",
            json!({"ports": [
                {"host_port": 0, "container_port": 8080},
                {"host_port": 1234, "container_port": 8081},
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["ports"],
        json!([
            {"host_port": 1234, "container_port": 4567},
            {"host_port": 2468, "container_port": 9134},
        ])
    );
}

#[tokio::test]
async fn duplicate_guid_conflicts() {
    let node = test_node();
    reserve(&node, "g1").await;

    let (status, body) = send(
        &node.router,
        post_json("/containers/g1", json!({"memory_mb": 1, "disk_mb": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn over_reservation_is_service_unavailable() {
    let node = test_node();
    let (status, body) = send(
        &node.router,
        post_json("/containers/big", json!({"memory_mb": 4096, "disk_mb": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "insufficient_capacity");
}

#[tokio::test]
async fn unknown_guids_are_not_found() {
    let node = test_node();

    let (status, _) = send(&node.router, get("/containers/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &node.router,
        post_json("/containers/ghost/initialize", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &node.router,
        post_json(
            "/containers/ghost/run",
            json!({"actions": [{"action": "run", "path": "ls"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&node.router, delete("/containers/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn structurally_invalid_actions_are_bad_requests() {
    let node = test_node();
    reserve(&node, "g1").await;
    let (status, _) = send(
        &node.router,
        post_json("/containers/g1/initialize", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &node.router,
        post_json("/containers/g1/run", json!({"actions": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &node.router,
        post_json(
            "/containers/g1/run",
            json!({"actions": [{"action": "serial", "actions": []}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn draining_refuses_mutations_but_serves_reads() {
    let node = test_node();
    reserve(&node, "g1").await;

    node.drain.drain(node.dispatcher.clone());

    let (status, body) = send(
        &node.router,
        post_json("/containers/g2", json!({"memory_mb": 1, "disk_mb": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "draining");

    let (status, _) = send(
        &node.router,
        post_json("/containers/g1/initialize", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Reads keep working
    let (status, _) = send(&node.router, get("/containers")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&node.router, get("/resources/remaining")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn ping_reflects_backend_health() {
    let node = test_node();

    let (status, _) = send(&node.router, get("/ping")).await;
    assert_eq!(status, StatusCode::OK);

    node.backend.set_reachable(false);
    let (status, body) = send(&node.router, get("/ping")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "backend_unreachable");
}

#[tokio::test]
async fn list_shows_reserved_containers() {
    let node = test_node();
    reserve(&node, "g1").await;
    reserve(&node, "g2").await;

    let (status, body) = send(&node.router, get("/containers")).await;
    assert_eq!(status, StatusCode::OK);
    let guids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|record| record["guid"].as_str().unwrap())
        .collect();
    assert_eq!(guids, vec!["g1", "g2"]);
}

#[tokio::test]
async fn delete_releases_capacity() {
    let node = test_node();
    reserve(&node, "g1").await;

    let (status, body) = send(&node.router, get("/resources/remaining")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["memory_mb"], 0);

    let (status, _) = send(&node.router, delete("/containers/g1")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&node.router, get("/resources/remaining")).await;
    assert_eq!(body["memory_mb"], 1024);
}
