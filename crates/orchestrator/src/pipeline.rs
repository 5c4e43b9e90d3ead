use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::api::DeploymentStatus;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::descriptor;
use crate::error::OrchestratorError;
use crate::persistence;
use crate::runtime::{container_name, ContainerSpec, PortBindingSpec, DEPLOYMENT_LABEL};
use crate::source;
use crate::state::Orchestrator;
use crate::telemetry;

/// What became of one queued deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed,
    /// The deployment disappeared (or was never queued) before the worker
    /// reached it.
    Skipped,
}

/// Single pipeline worker. Deployments are processed strictly in submission
/// order, one at a time; a failure only affects its own deployment. Each item
/// runs in its own task so a panic inside a step is contained and recorded as
/// a failure instead of killing the worker.
pub async fn worker_loop(
    state: Arc<Orchestrator>,
    mut queue_rx: mpsc::UnboundedReceiver<Uuid>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("pipeline worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let id = tokio::select! {
            _ = shutdown.changed() => continue,
            next = queue_rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        state.note_dequeued();

        let task_state = Arc::clone(&state);
        let joined = tokio::spawn(async move { process_deployment(task_state, id).await }).await;

        match joined {
            Ok(Ok(outcome)) => {
                if outcome != PipelineOutcome::Skipped {
                    telemetry::record_deployment_finished(match outcome {
                        PipelineOutcome::Completed => "completed",
                        _ => "failed",
                    });
                }
            }
            Ok(Err(err)) => {
                // Store-level failure while recording an outcome. Back off so
                // a persistent store problem does not spin the worker.
                error!(deployment_id = %id, error = %err.detail(), "pipeline bookkeeping failed");
                telemetry::record_deployment_finished("failed");
                backoff(state.cfg().worker_error_backoff_ms, &mut shutdown).await;
            }
            Err(join_err) => {
                error!(deployment_id = %id, error = %join_err, "deployment task aborted");
                if let Err(err) = record_aborted(&state, id, &join_err).await {
                    error!(deployment_id = %id, error = %err.detail(), "could not record aborted deployment");
                }
                telemetry::record_deployment_finished("failed");
                backoff(state.cfg().worker_error_backoff_ms, &mut shutdown).await;
            }
        }
    }
    info!("pipeline worker stopped");
}

async fn backoff(millis: u64, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
    }
}

/// Drive one deployment from `queued` to a terminal status. Step errors are
/// recorded on the deployment itself; only failures to persist that outcome
/// bubble out.
pub async fn process_deployment(
    state: Arc<Orchestrator>,
    id: Uuid,
) -> Result<PipelineOutcome, OrchestratorError> {
    let mut record = match persistence::deployments::get(state.db(), id).await? {
        Some(record) => record,
        None => {
            info!(deployment_id = %id, "deployment vanished before processing, skipping");
            return Ok(PipelineOutcome::Skipped);
        }
    };
    if record.status != DeploymentStatus::Queued {
        warn!(deployment_id = %id, status = %record.status, "not queued, skipping");
        return Ok(PipelineOutcome::Skipped);
    }

    record.status = DeploymentStatus::Processing;
    record.started_at = Some(Utc::now());
    persistence::deployments::upsert(state.db(), &record).await?;
    info!(deployment_id = %id, "processing deployment");

    let Some(deployment_source) = state.take_source(id).await else {
        return fail(&state, record, "deployment source is no longer available").await;
    };

    match run_steps(&state, &mut record, deployment_source).await {
        Ok(()) => {
            record.status = DeploymentStatus::Completed;
            record.completed_at = Some(Utc::now());
            persistence::deployments::upsert(state.db(), &record).await?;
            telemetry::record_ports_in_use(state.allocator().in_use().await);
            info!(
                deployment_id = %id,
                port = record.port,
                container_ref = record.container_ref.as_deref(),
                "deployment completed"
            );
            Ok(PipelineOutcome::Completed)
        }
        Err(err) => {
            // A half-finished deployment holds no resources: the port goes
            // back to the pool and a started container is torn down.
            if state.allocator().release(id).await.is_some() {
                record.port = None;
                telemetry::record_ports_in_use(state.allocator().in_use().await);
            }
            if let Some(container_ref) = record.container_ref.take() {
                discard_container(&state, &container_ref).await;
            }
            fail(&state, record, &err.detail()).await
        }
    }
}

async fn run_steps(
    state: &Orchestrator,
    record: &mut persistence::DeploymentRecord,
    deployment_source: source::DeploymentSource,
) -> Result<(), OrchestratorError> {
    let id = record.id;
    let workspace_root = std::path::PathBuf::from(&state.cfg().workspace_dir);

    let project_dir = step("acquire", async {
        Ok(source::acquire(id, &deployment_source, &workspace_root).await?)
    })
    .await?;

    let recipe = step("descriptor", async {
        let recipe = descriptor::infer(&project_dir, state.cfg().container_port)?;
        recipe.write_to(&project_dir)?;
        Ok(recipe)
    })
    .await?;
    info!(deployment_id = %id, family = recipe.family.as_str(), "build recipe inferred");

    let port = step("allocate_port", async {
        let bound = state.runtime().list_bound_host_ports().await?;
        Ok(state.allocator().allocate(id, &bound).await?)
    })
    .await?;
    record.port = Some(port);

    let image = step("build", async {
        Ok(state
            .runtime()
            .build_image(&project_dir, &container_name(id))
            .await?)
    })
    .await?;

    let container_ref = step("run", async {
        let spec = ContainerSpec {
            image,
            name: container_name(id),
            env: vec![(descriptor::PORT_ENV.to_string(), port.to_string())],
            port: PortBindingSpec {
                host_port: port,
                container_port: port,
            },
            labels: vec![(DEPLOYMENT_LABEL.to_string(), id.to_string())],
        };
        Ok(state.runtime().start_container(spec).await?)
    })
    .await?;
    record.container_ref = Some(container_ref);

    Ok(())
}

async fn step<T, F>(name: &'static str, fut: F) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    let started = Instant::now();
    let result = fut.await;
    telemetry::record_pipeline_step(
        name,
        if result.is_ok() { "ok" } else { "error" },
        started.elapsed(),
    );
    result
}

async fn fail(
    state: &Orchestrator,
    mut record: persistence::DeploymentRecord,
    detail: &str,
) -> Result<PipelineOutcome, OrchestratorError> {
    warn!(deployment_id = %record.id, error = detail, "deployment failed");
    record.status = DeploymentStatus::Failed;
    record.error = Some(detail.to_string());
    record.completed_at = Some(Utc::now());
    persistence::deployments::upsert(state.db(), &record).await?;
    Ok(PipelineOutcome::Failed)
}

/// Best-effort teardown of a container whose deployment failed after start.
async fn discard_container(state: &Orchestrator, container_ref: &str) {
    if let Err(err) = state.runtime().stop_container(container_ref).await {
        if !err.is_not_found() {
            warn!(container_ref, error = %err, "could not stop failed deployment container");
        }
    }
    if let Err(err) = state.runtime().remove_container(container_ref).await {
        if !err.is_not_found() {
            warn!(container_ref, error = %err, "could not remove failed deployment container");
        }
    }
}

async fn record_aborted(
    state: &Orchestrator,
    id: Uuid,
    join_err: &tokio::task::JoinError,
) -> Result<(), OrchestratorError> {
    if state.allocator().release(id).await.is_some() {
        telemetry::record_ports_in_use(state.allocator().in_use().await);
    }
    let Some(mut record) = persistence::deployments::get(state.db(), id).await? else {
        return Ok(());
    };
    if record.status != DeploymentStatus::Processing {
        return Ok(());
    }
    record.status = DeploymentStatus::Failed;
    record.error = Some(format!("deployment task aborted: {join_err}"));
    record.completed_at = Some(Utc::now());
    persistence::deployments::upsert(state.db(), &record).await?;
    Ok(())
}
