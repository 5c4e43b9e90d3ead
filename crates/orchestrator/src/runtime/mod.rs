use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod docker;
pub mod helpers;

pub type DynContainerRuntime = Arc<dyn ContainerRuntime>;

/// Label attached to every container this orchestrator manages.
pub const DEPLOYMENT_LABEL: &str = "slipway.deployment_id";

/// Deterministic container/image name for a deployment. Lookup by deployment
/// id never needs a side index.
pub fn container_name(deployment_id: Uuid) -> String {
    format!("slipway-deploy-{deployment_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited { exit_code: Option<i64> },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerResourceUsage {
    pub collected_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: Option<String>,
    pub status: ContainerStatus,
    pub labels: Option<HashMap<String, String>>,
}

/// One host-to-container TCP binding; each deployment gets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBindingSpec {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    pub port: PortBindingSpec,
    pub labels: Vec<(String, String)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from the project directory. The accumulated build log
    /// is retained inside the error on failure.
    async fn build_image(
        &self,
        project_dir: &Path,
        tag: &str,
    ) -> Result<String, ContainerRuntimeError>;

    async fn start_container(&self, spec: ContainerSpec) -> Result<String, ContainerRuntimeError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, ContainerRuntimeError>;

    /// Point-in-time resource snapshot, not a stream.
    async fn container_stats(
        &self,
        id: &str,
    ) -> Result<ContainerResourceUsage, ContainerRuntimeError>;

    /// Already-stopped containers are not an error.
    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError>;
    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError>;

    /// Containers carrying [`DEPLOYMENT_LABEL`], including stopped ones.
    async fn list_managed_containers(&self)
        -> Result<Vec<ContainerDetails>, ContainerRuntimeError>;

    /// Host ports currently bound by live containers, managed or not. Used by
    /// the allocator to reconcile its table against reality.
    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, ContainerRuntimeError>;
}

#[derive(Debug, Error)]
pub enum ContainerRuntimeError {
    #[error("failed to connect to runtime ({context}): {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to build image {tag}: {message}")]
    BuildImage {
        tag: String,
        message: String,
        /// Full build output, retained as diagnostic context.
        log: String,
    },
    #[error("failed to create container {name}: {source}")]
    CreateContainer {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to start container {id}: {source}")]
    StartContainer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to inspect container {id}: {source}")]
    InspectContainer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to stop container {id}: {source}")]
    StopContainer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to remove container {id}: {source}")]
    RemoveContainer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to collect stats for container {id}: {source}")]
    Stats {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] anyhow::Error),
    #[error("container {id} not found")]
    NotFound { id: String },
}

impl ContainerRuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerRuntimeError::NotFound { .. })
    }
}

pub use docker::DockerRuntime;
