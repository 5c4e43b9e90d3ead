//! Shared fakes for unit tests. Compiled only under `cfg(test)`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::AppConfig;
use crate::runtime::{
    ContainerDetails, ContainerResourceUsage, ContainerRuntime, ContainerRuntimeError,
    ContainerSpec, ContainerStatus, DEPLOYMENT_LABEL,
};

/// Scripted in-memory container runtime. Starts containers into a local
/// table, can be told to fail builds or starts, and reports what it was
/// asked to do.
#[derive(Default)]
pub struct MockRuntime {
    inner: StdMutex<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, ContainerDetails>,
    started: Vec<ContainerSpec>,
    built: Vec<String>,
    bound_ports: HashSet<u16>,
    fail_build: Option<String>,
    fail_start: Option<String>,
}

impl MockRuntime {
    pub fn fail_next_build(&self, message: &str) {
        self.inner.lock().unwrap().fail_build = Some(message.to_string());
    }

    pub fn fail_next_start(&self, message: &str) {
        self.inner.lock().unwrap().fail_start = Some(message.to_string());
    }

    pub fn bind_port(&self, port: u16) {
        self.inner.lock().unwrap().bound_ports.insert(port);
    }

    /// Pre-seed a container, as if a previous process had started it.
    pub fn seed_container(&self, id: &str, deployment_label: Option<&str>, running: bool) {
        let labels = deployment_label.map(|value| {
            HashMap::from([(DEPLOYMENT_LABEL.to_string(), value.to_string())])
        });
        let status = if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Exited { exit_code: Some(1) }
        };
        self.inner.lock().unwrap().containers.insert(
            id.to_string(),
            ContainerDetails {
                id: id.to_string(),
                name: Some(id.to_string()),
                status,
                labels,
            },
        );
    }

    pub fn started_specs(&self) -> Vec<ContainerSpec> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.inner.lock().unwrap().built.clone()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().containers.keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(
        &self,
        _project_dir: &Path,
        tag: &str,
    ) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.fail_build.take() {
            return Err(ContainerRuntimeError::BuildImage {
                tag: tag.to_string(),
                message,
                log: "step 1/5 FROM ...\n".to_string(),
            });
        }
        state.built.push(tag.to_string());
        Ok(tag.to_string())
    }

    async fn start_container(&self, spec: ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.fail_start.take() {
            return Err(ContainerRuntimeError::CreateContainer {
                name: spec.name.clone(),
                source: anyhow::anyhow!(message),
            });
        }
        let id = format!("ctr-{}", spec.name);
        let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                id: id.clone(),
                name: Some(spec.name.clone()),
                status: ContainerStatus::Running,
                labels: Some(labels),
            },
        );
        state.bound_ports.insert(spec.port.host_port);
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
        if !state.containers.contains_key(id) {
            return Err(ContainerRuntimeError::NotFound { id: id.to_string() });
        }
        Ok(ContainerResourceUsage {
            collected_at: Utc::now(),
            cpu_percent: 1.5,
            memory_bytes: 64 * 1024 * 1024,
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
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
            Some(_) => Ok(()),
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

pub fn base_config(workspace_dir: &Path) -> AppConfig {
    AppConfig {
        http_host: "127.0.0.1".into(),
        http_port: 0,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        store_url: "sqlite::memory:".into(),
        upload_dir: workspace_dir.join("uploads").display().to_string(),
        workspace_dir: workspace_dir.display().to_string(),
        port_range_start: 3000,
        port_range_end: 3010,
        container_port: 3000,
        public_host: Some("deploy.example.com".into()),
        require_approval: false,
        worker_error_backoff_ms: 10,
        cleanup_on_shutdown: false,
    }
}
