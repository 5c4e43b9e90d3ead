use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use common::api::{DeploymentStatus, DeploymentView};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::PortAllocator;
use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::persistence::{self, Db, DeploymentRecord, NewDeployment};
use crate::runtime::{ContainerResourceUsage, ContainerStatus, DynContainerRuntime};
use crate::source::DeploymentSource;
use crate::telemetry;

/// Shared orchestrator state: the durable record store, the port table, the
/// container runtime handle and the FIFO work queue feeding the pipeline
/// worker. HTTP handlers and the worker both hold this behind an `Arc`.
pub struct Orchestrator {
    cfg: AppConfig,
    db: Db,
    allocator: PortAllocator,
    runtime: DynContainerRuntime,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_depth: AtomicUsize,
    // Source bytes live only until the pipeline consumes them; records keep a
    // textual description instead.
    sources: Mutex<HashMap<Uuid, DeploymentSource>>,
}

impl Orchestrator {
    pub fn new(
        cfg: AppConfig,
        db: Db,
        runtime: DynContainerRuntime,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let allocator = PortAllocator::new(cfg.port_range_start..=cfg.port_range_end);
        let state = Arc::new(Self {
            cfg,
            db,
            allocator,
            runtime,
            queue_tx,
            queue_depth: AtomicUsize::new(0),
            sources: Mutex::new(HashMap::new()),
        });
        (state, queue_rx)
    }

    pub fn cfg(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn runtime(&self) -> &DynContainerRuntime {
        &self.runtime
    }

    /// Directory a deployment's source is extracted or cloned into.
    pub fn workspace_path(&self, id: Uuid) -> PathBuf {
        PathBuf::from(&self.cfg.workspace_dir).join(id.to_string())
    }

    /// Register a new deployment. With approval required it parks in
    /// `pending`; otherwise it is queued immediately.
    pub async fn submit(
        &self,
        owner: String,
        source: DeploymentSource,
    ) -> Result<DeploymentRecord, OrchestratorError> {
        if owner.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "owner must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let status = if self.cfg.require_approval {
            DeploymentStatus::Pending
        } else {
            DeploymentStatus::Queued
        };
        let record = NewDeployment {
            id,
            owner,
            status,
            source_description: source.description(),
        }
        .into_record(Utc::now());

        persistence::deployments::upsert(&self.db, &record).await?;
        self.sources.lock().await.insert(id, source);

        info!(deployment_id = %id, status = %record.status, "deployment submitted");
        if status == DeploymentStatus::Queued {
            self.enqueue(id);
        }
        Ok(record)
    }

    /// Move a pending deployment through approval onto the queue.
    pub async fn approve(&self, id: Uuid) -> Result<DeploymentRecord, OrchestratorError> {
        let mut record = self.get(id).await?;
        self.check_transition(&record, DeploymentStatus::Approved)?;

        // Approved is transient; the record lands directly in the queue.
        record.status = DeploymentStatus::Queued;
        persistence::deployments::upsert(&self.db, &record).await?;
        info!(deployment_id = %id, "deployment approved");
        self.enqueue(id);
        Ok(record)
    }

    pub async fn reject(&self, id: Uuid) -> Result<DeploymentRecord, OrchestratorError> {
        let mut record = self.get(id).await?;
        self.check_transition(&record, DeploymentStatus::Rejected)?;

        record.status = DeploymentStatus::Rejected;
        record.completed_at = Some(Utc::now());
        persistence::deployments::upsert(&self.db, &record).await?;
        self.discard_source(id).await;
        info!(deployment_id = %id, "deployment rejected");
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeploymentRecord, OrchestratorError> {
        persistence::deployments::get(&self.db, id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    pub async fn list(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<DeploymentRecord>, OrchestratorError> {
        Ok(persistence::deployments::list(&self.db, owner).await?)
    }

    /// Live resource snapshot for a completed deployment's container.
    pub async fn stats(&self, id: Uuid) -> Result<ContainerResourceUsage, OrchestratorError> {
        let record = self.get(id).await?;
        let container_ref = record.container_ref.as_deref().ok_or_else(|| {
            OrchestratorError::InvalidInput(format!("deployment {id} has no running container"))
        })?;
        Ok(self.runtime.container_stats(container_ref).await?)
    }

    /// Tear a finished deployment down: container, port, workspace, record.
    /// Only terminal deployments can be deleted; a running pipeline is never
    /// yanked out from under the worker.
    pub async fn delete(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let record = self.get(id).await?;
        self.check_transition(&record, DeploymentStatus::Deleted)?;

        if let Some(container_ref) = record.container_ref.as_deref() {
            self.teardown_container(id, container_ref).await?;
        }
        if self.allocator.release(id).await.is_some() {
            telemetry::record_ports_in_use(self.allocator.in_use().await);
        }

        let workspace = self.workspace_path(id);
        if let Err(err) = tokio::fs::remove_dir_all(&workspace).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(deployment_id = %id, error = %err, "failed to remove workspace");
            }
        }

        self.discard_source(id).await;
        persistence::deployments::delete(&self.db, id).await?;
        info!(deployment_id = %id, "deployment deleted");
        Ok(())
    }

    /// Stop and remove a container, tolerating one that is already gone.
    async fn teardown_container(
        &self,
        id: Uuid,
        container_ref: &str,
    ) -> Result<(), OrchestratorError> {
        match self.runtime.stop_container(container_ref).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!(deployment_id = %id, "container already gone at stop");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        match self.runtime.remove_container(container_ref).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reconcile persisted records against the runtime after a restart.
    ///
    /// Completed deployments whose container is still running get their port
    /// re-registered so it is never handed out twice. Everything else that was
    /// mid-flight lost its source bytes with the old process and is marked
    /// failed.
    pub async fn reconcile(&self) -> Result<(), OrchestratorError> {
        for record in
            persistence::deployments::list_by_status(&self.db, DeploymentStatus::Completed).await?
        {
            self.reconcile_completed(record).await?;
        }

        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Queued,
            DeploymentStatus::Processing,
        ] {
            for mut record in persistence::deployments::list_by_status(&self.db, status).await? {
                warn!(deployment_id = %record.id, status = %status, "marking interrupted deployment failed");
                record.status = DeploymentStatus::Failed;
                record.error = Some("orchestrator restarted before processing finished".to_string());
                record.completed_at = Some(Utc::now());
                persistence::deployments::upsert(&self.db, &record).await?;
            }
        }

        telemetry::record_ports_in_use(self.allocator.in_use().await);
        Ok(())
    }

    async fn reconcile_completed(
        &self,
        mut record: DeploymentRecord,
    ) -> Result<(), OrchestratorError> {
        let alive = match record.container_ref.as_deref() {
            Some(container_ref) => match self.runtime.inspect_container(container_ref).await {
                Ok(details) => details.status == ContainerStatus::Running,
                Err(err) if err.is_not_found() => false,
                Err(err) => return Err(err.into()),
            },
            None => false,
        };

        if alive {
            if let Some(port) = record.port {
                if let Err(err) = self.allocator.adopt(record.id, port).await {
                    warn!(deployment_id = %record.id, error = %err, "could not re-register port");
                }
            }
            info!(deployment_id = %record.id, "adopted running deployment");
        } else {
            warn!(deployment_id = %record.id, "deployment container is gone, marking failed");
            record.status = DeploymentStatus::Failed;
            record.error = Some("container no longer running after restart".to_string());
            persistence::deployments::upsert(&self.db, &record).await?;
        }
        Ok(())
    }

    /// Stop and remove every container this orchestrator labeled. Used on
    /// shutdown when `cleanup_on_shutdown` is set.
    pub async fn cleanup_managed_containers(&self) {
        let containers = match self.runtime.list_managed_containers().await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "could not list managed containers for cleanup");
                return;
            }
        };
        for container in containers {
            if let Err(err) = self.runtime.stop_container(&container.id).await {
                if !err.is_not_found() {
                    warn!(container_id = %container.id, error = %err, "cleanup stop failed");
                    continue;
                }
            }
            if let Err(err) = self.runtime.remove_container(&container.id).await {
                if !err.is_not_found() {
                    warn!(container_id = %container.id, error = %err, "cleanup remove failed");
                }
            }
        }
    }

    /// Drop an unconsumed source. A staged upload archive would otherwise
    /// sit in the upload dir forever, so it is deleted here.
    async fn discard_source(&self, id: Uuid) {
        if let Some(DeploymentSource::Upload { archive_path }) =
            self.sources.lock().await.remove(&id)
        {
            if let Err(err) = tokio::fs::remove_file(&archive_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(deployment_id = %id, error = %err, "failed to remove staged archive");
                }
            }
        }
    }

    /// Pull the pending source for a queued deployment. Consuming it means
    /// the caller owns processing; a second call returns `None`.
    pub async fn take_source(&self, id: Uuid) -> Option<DeploymentSource> {
        self.sources.lock().await.remove(&id)
    }

    pub fn to_view(&self, record: &DeploymentRecord) -> DeploymentView {
        let url = match (record.status, record.port, self.cfg.public_host.as_deref()) {
            (DeploymentStatus::Completed, Some(port), Some(host)) => {
                Some(format!("http://{host}:{port}"))
            }
            _ => None,
        };
        DeploymentView {
            id: record.id,
            owner: Some(record.owner.clone()),
            status: record.status,
            source_description: record.source_description.clone(),
            port: record.port,
            container_ref: record.container_ref.clone(),
            url,
            error: record.error.clone(),
            queued_at: record.queued_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }

    fn check_transition(
        &self,
        record: &DeploymentRecord,
        next: DeploymentStatus,
    ) -> Result<(), OrchestratorError> {
        if record.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::IllegalTransition {
                id: record.id,
                from: record.status,
                to: next,
            })
        }
    }

    fn enqueue(&self, id: Uuid) {
        if self.queue_tx.send(id).is_err() {
            warn!(deployment_id = %id, "pipeline worker is gone, deployment will not run");
            return;
        }
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        telemetry::record_queue_depth(depth);
    }

    /// Worker-side bookkeeping when an id is pulled off the queue.
    pub fn note_dequeued(&self) {
        let depth = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        telemetry::record_queue_depth(depth.saturating_sub(1));
    }
}
