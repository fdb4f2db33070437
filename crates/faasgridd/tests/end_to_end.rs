//! End-to-end invocation tests.
//!
//! Runs the real control-plane router on 127.0.0.1, the real HTTP proxy,
//! and real executor servers. Only the worker agent is replaced: the
//! launcher below starts executors in-process instead of as child
//! processes, and they report readiness over HTTP like the binary does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use faasgrid_api::{ApiState, build_router};
use faasgrid_core::config::ExecutorConfig;
use faasgrid_core::{epoch_millis, http};
use faasgrid_dispatch::{Dispatcher, HttpProxy};
use faasgrid_executor::{ExecutorState, FunctionHandler, notify, server};
use faasgrid_scheduler::{
    BoxFuture, ColdStartScheduler, InstanceLauncher, LaunchError, LaunchRequest, ProvisionConfig,
};
use faasgrid_state::{Function, InstanceStatus, InvocationStatus, StateStore, WorkerHost};

const MODULE: &str = include_str!("../../faasgrid-executor/tests/fixtures/handler.wat");

/// Starts executors as tasks in this process.
struct InProcessLauncher {
    work_dir: tempfile::TempDir,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl InProcessLauncher {
    fn start(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        let code = request
            .decode_code()
            .map_err(|e| LaunchError::Rejected { status: 400, body: e.to_string() })?;
        let code_path = self.work_dir.path().join(format!("{}.wat", request.instance_id));
        std::fs::write(&code_path, code).map_err(|e| LaunchError::Unreachable(e.to_string()))?;

        let config = ExecutorConfig {
            code_path,
            entry_point: request.entry_point.clone(),
            port: 0,
            instance_id: request.instance_id.clone(),
            control_plane_url: request.control_plane_url.clone(),
            memory_mb: request.memory_mb,
            timeout_seconds: request.timeout_seconds,
        };
        let handler = FunctionHandler::load(&config)
            .map_err(|e| LaunchError::Rejected { status: 500, body: e.to_string() })?;

        let task = tokio::spawn(async move {
            let listener = server::bind(0).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let state = ExecutorState {
                handler,
                instance_id: config.instance_id.clone(),
            };
            let serving = tokio::spawn(server::serve(listener, state, std::future::pending()));
            if let Some(url) = &config.control_plane_url {
                notify::notify_ready(url, &config.instance_id, port).await.unwrap();
            }
            let _ = serving.await;
        });
        self.running
            .lock()
            .unwrap()
            .insert(request.instance_id.clone(), task);
        Ok(())
    }
}

impl InstanceLauncher for InProcessLauncher {
    fn launch<'a>(
        &'a self,
        _worker: &'a WorkerHost,
        request: LaunchRequest,
    ) -> BoxFuture<'a, Result<(), LaunchError>> {
        Box::pin(async move { self.start(&request) })
    }

    fn stop<'a>(
        &'a self,
        _worker: &'a WorkerHost,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<(), LaunchError>> {
        Box::pin(async move {
            if let Some(task) = self.running.lock().unwrap().remove(instance_id) {
                task.abort();
            }
            Ok(())
        })
    }
}

struct ControlPlane {
    url: String,
    store: StateStore,
    launcher: Arc<InProcessLauncher>,
}

async fn start_control_plane(entry_point: &str) -> ControlPlane {
    let store = StateStore::open_in_memory().unwrap();
    store
        .record_heartbeat("local", "127.0.0.1", 7070, 1024, 1024, epoch_millis())
        .unwrap();
    store
        .put_function(&Function {
            id: "fn-echo".to_string(),
            name: "echo".to_string(),
            description: String::new(),
            entry_point: entry_point.to_string(),
            memory_mb: 16,
            timeout_seconds: 2,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
    store
        .publish_deployment("echo", MODULE.as_bytes().to_vec(), "", "e2e", epoch_millis())
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let launcher = Arc::new(InProcessLauncher {
        work_dir: tempfile::tempdir().unwrap(),
        running: Mutex::new(HashMap::new()),
    });
    let scheduler = Arc::new(ColdStartScheduler::new(
        store.clone(),
        launcher.clone(),
        ProvisionConfig {
            control_plane_url: Some(url.clone()),
            ..ProvisionConfig::default()
        },
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone(), scheduler.clone(), Arc::new(HttpProxy))
            .with_proxy_buffer(Duration::from_secs(2)),
    );
    let router = build_router(ApiState::new(store.clone(), scheduler, dispatcher));
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    ControlPlane {
        url,
        store,
        launcher,
    }
}

async fn invoke(cp: &ControlPlane, body: serde_json::Value) -> http::HttpResponse {
    http::post_json(&format!("{}/invoke/echo", cp.url), &body)
        .await
        .unwrap()
}

fn record_for(cp: &ControlPlane, resp: &http::HttpResponse) -> faasgrid_state::InvocationRecord {
    let request_id = resp.header("x-request-id").unwrap();
    cp.store
        .find_invocation_by_request_id(request_id)
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_then_warm_reuse() {
    let cp = start_control_plane("handle").await;

    let first = invoke(&cp, serde_json::json!({"x": 1})).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.json::<serde_json::Value>().unwrap(), serde_json::json!({"x": 1}));
    let record = record_for(&cp, &first);
    assert!(record.is_cold_start);
    assert_eq!(record.status, Some(InvocationStatus::Success));

    let second = invoke(&cp, serde_json::json!({"x": 2})).await;
    assert_eq!(second.status, 200);
    let record = record_for(&cp, &second);
    assert!(!record.is_cold_start);

    let instances = cp.store.list_instances_for_function("echo").unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Running);
    assert_eq!(cp.launcher.running.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_failure_passes_through_and_instance_survives() {
    let cp = start_control_plane("handle").await;

    let failed = invoke(&cp, serde_json::json!({"fail": true})).await;
    assert_eq!(failed.status, 500);
    let body: serde_json::Value = failed.json().unwrap();
    assert_eq!(body["error"], "Function execution failed");
    assert_eq!(body["error_kind"], "trap");
    let record = record_for(&cp, &failed);
    assert_eq!(record.status, Some(InvocationStatus::Failure));
    assert_eq!(record.response_status_code, Some(500));

    let instances = cp.store.list_instances_for_function("echo").unwrap();
    assert_eq!(instances[0].status, InstanceStatus::Running);

    let ok = invoke(&cp, serde_json::json!({"x": 1})).await;
    assert_eq!(ok.status, 200);
    assert!(!record_for(&cp, &ok).is_cold_start);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_cold_misses_share_one_instance() {
    let cp = start_control_plane("handle").await;

    let calls = (0..8).map(|i| {
        let url = format!("{}/invoke/echo", cp.url);
        tokio::spawn(async move { http::post_json(&url, &serde_json::json!({"i": i})).await })
    });
    for call in calls.collect::<Vec<_>>() {
        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp.status, 200);
    }

    assert_eq!(cp.store.list_instances_for_function("echo").unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn runaway_handler_times_out_and_instance_survives() {
    let cp = start_control_plane("spin").await;

    let resp = invoke(&cp, serde_json::json!({})).await;
    assert_eq!(resp.status, 504);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error_kind"], "timeout");
    let record = record_for(&cp, &resp);
    assert_eq!(record.status, Some(InvocationStatus::Timeout));
    assert_eq!(record.response_status_code, Some(504));

    let instances = cp.store.list_instances_for_function("echo").unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Running);
}
