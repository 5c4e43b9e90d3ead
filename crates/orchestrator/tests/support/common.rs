#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use orchestrator::config::AppConfig;
use orchestrator::http::build_router;
use orchestrator::persistence::init_store;
use orchestrator::runtime::{
    ContainerDetails, ContainerResourceUsage, ContainerRuntime, ContainerRuntimeError,
    ContainerSpec, ContainerStatus, DEPLOYMENT_LABEL,
};
use orchestrator::state::Orchestrator;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// In-memory container runtime for integration tests. Containers live in a
/// table; builds and starts can be scripted to fail.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, ContainerDetails>,
    ports_by_container: HashMap<String, u16>,
    started: Vec<ContainerSpec>,
    bound_ports: HashSet<u16>,
    fail_builds: Vec<String>,
    fail_starts: Vec<String>,
    stats: HashMap<String, ContainerResourceUsage>,
}

impl FakeRuntime {
    /// Make the next `count` builds fail with `message`.
    pub fn fail_builds(&self, count: usize, message: &str) {
        let mut state = self.inner.lock().unwrap();
        state
            .fail_builds
            .extend(std::iter::repeat_n(message.to_string(), count));
    }

    pub fn fail_next_start(&self, message: &str) {
        self.inner.lock().unwrap().fail_starts.push(message.to_string());
    }

    pub fn bind_port(&self, port: u16) {
        self.inner.lock().unwrap().bound_ports.insert(port);
    }

    pub fn set_stats(&self, container_id: &str, usage: ContainerResourceUsage) {
        self.inner
            .lock()
            .unwrap()
            .stats
            .insert(container_id.to_string(), usage);
    }

    pub fn started_specs(&self) -> Vec<ContainerSpec> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn remove_all_containers(&self) {
        let mut state = self.inner.lock().unwrap();
        state.containers.clear();
        state.bound_ports.clear();
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        _project_dir: &Path,
        tag: &str,
    ) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.fail_builds.pop() {
            return Err(ContainerRuntimeError::BuildImage {
                tag: tag.to_string(),
                message,
                log: String::new(),
            });
        }
        Ok(tag.to_string())
    }

    async fn start_container(&self, spec: ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.fail_starts.pop() {
            return Err(ContainerRuntimeError::CreateContainer {
                name: spec.name.clone(),
                source: anyhow::anyhow!(message),
            });
        }
        let id = format!("ctr-{}", spec.name);
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                id: id.clone(),
                name: Some(spec.name.clone()),
                status: ContainerStatus::Running,
                labels: Some(spec.labels.iter().cloned().collect()),
            },
        );
        state.bound_ports.insert(spec.port.host_port);
        state.ports_by_container.insert(id.clone(), spec.port.host_port);
        state.started.push(spec);
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, ContainerRuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerRuntimeError::NotFound { id: id.to_string() })
    }

    async fn container_stats(
        &self,
        id: &str,
    ) -> Result<ContainerResourceUsage, ContainerRuntimeError> {
        let state = self.inner.lock().unwrap();
        if let Some(usage) = state.stats.get(id) {
            return Ok(usage.clone());
        }
        if !state.containers.contains_key(id) {
            return Err(ContainerRuntimeError::NotFound { id: id.to_string() });
        }
        Ok(ContainerResourceUsage {
            collected_at: Utc::now(),
            cpu_percent: 0.5,
            memory_bytes: 32 * 1024 * 1024,
            network_rx_bytes: 100,
            network_tx_bytes: 200,
        })
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(details) => {
                details.status = ContainerStatus::Exited { exit_code: Some(0) };
                Ok(())
            }
            None => Err(ContainerRuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        match state.containers.remove(id) {
            Some(_) => {
                if let Some(port) = state.ports_by_container.remove(id) {
                    state.bound_ports.remove(&port);
                }
                Ok(())
            }
            None => Err(ContainerRuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn list_managed_containers(
        &self,
    ) -> Result<Vec<ContainerDetails>, ContainerRuntimeError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|details| {
                details
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(DEPLOYMENT_LABEL))
            })
            .cloned()
            .collect())
    }

    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, ContainerRuntimeError> {
        Ok(self.inner.lock().unwrap().bound_ports.clone())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<Orchestrator>,
    pub queue_rx: Option<mpsc::UnboundedReceiver<Uuid>>,
    pub runtime: Arc<FakeRuntime>,
    pub workspace: TempDir,
}

pub fn test_config(workspace: &Path) -> AppConfig {
    AppConfig {
        http_host: "127.0.0.1".into(),
        http_port: 0,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        store_url: "sqlite::memory:".into(),
        upload_dir: workspace.join("uploads").display().to_string(),
        workspace_dir: workspace.join("extracted").display().to_string(),
        port_range_start: 3000,
        port_range_end: 3005,
        container_port: 3000,
        public_host: Some("apps.test".into()),
        require_approval: false,
        worker_error_backoff_ms: 10,
        cleanup_on_shutdown: false,
    }
}

pub async fn setup_app() -> TestApp {
    setup_app_with(|_| {}).await
}

pub async fn setup_app_with(adjust: impl FnOnce(&mut AppConfig)) -> TestApp {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(workspace.path());
    adjust(&mut cfg);
    std::fs::create_dir_all(&cfg.upload_dir).expect("upload dir");
    std::fs::create_dir_all(&cfg.workspace_dir).expect("workspace dir");

    let db = init_store("sqlite::memory:").await.expect("store");
    let runtime = Arc::new(FakeRuntime::default());
    let (state, queue_rx) = Orchestrator::new(cfg, db, Arc::clone(&runtime) as _);
    TestApp {
        router: build_router(Arc::clone(&state)),
        state,
        queue_rx: Some(queue_rx),
        runtime,
        workspace,
    }
}

/// Write a gzipped tar archive containing the given files.
pub fn write_archive(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).expect("create archive");
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .expect("append entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

pub fn node_project_archive(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    write_archive(
        &path,
        &[
            ("package.json", "{\"name\":\"app\",\"scripts\":{\"start\":\"node index.js\"}}"),
            ("index.js", "require('http')"),
        ],
    );
    path
}

const MULTIPART_BOUNDARY: &str = "slipway-test-boundary";

/// Build a multipart submission body with an owner field and an archive file.
pub fn multipart_upload(owner: &str, file_name: &str, archive: &[u8]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"owner\"\r\n\r\n\
             {owner}\r\n\
             --{MULTIPART_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/gzip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(archive);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    (
        format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
        body,
    )
}

pub async fn request_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = HttpRequest::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder
                .body(Body::from(serde_json::to_vec(&value).expect("serialize")))
                .expect("request")
        }
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

/// Poll the status endpoint until the deployment reaches a terminal state.
pub async fn wait_for_terminal(router: &Router, id: Uuid) -> serde_json::Value {
    for _ in 0..500 {
        let (status, body) = request_json(router, "GET", &format!("/deployments/{id}"), None).await;
        assert_eq!(status, StatusCode::OK, "status endpoint failed: {body}");
        let state = body["status"].as_str().expect("status field");
        if matches!(state, "completed" | "failed" | "rejected" | "deleted") {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("deployment {id} never reached a terminal state");
}
