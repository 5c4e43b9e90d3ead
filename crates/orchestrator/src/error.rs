use common::api::DeploymentStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::allocator::PortAllocationError;
use crate::descriptor::DescriptorError;
use crate::runtime::ContainerRuntimeError;
use crate::source::AcquireError;

/// Top-level error for orchestrator operations. HTTP handlers map these onto
/// status codes; the pipeline stores their rendering into failed records.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("deployment {0} not found")]
    NotFound(Uuid),

    #[error("deployment {id}: cannot move from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    PortAllocation(#[from] PortAllocationError),

    #[error("failed to acquire deployment source")]
    Source(#[from] AcquireError),

    #[error("failed to infer build recipe")]
    Descriptor(#[from] DescriptorError),

    #[error("container runtime operation failed")]
    Runtime(#[from] ContainerRuntimeError),

    #[error("deployment store operation failed")]
    Store(#[from] sqlx::Error),
}

impl OrchestratorError {
    /// Stable machine-readable code, used in HTTP error bodies and metric
    /// labels.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::IllegalTransition { .. } => "illegal_transition",
            OrchestratorError::InvalidInput(_) => "invalid_input",
            OrchestratorError::PortAllocation(PortAllocationError::Exhausted { .. }) => {
                "port_range_exhausted"
            }
            OrchestratorError::PortAllocation(_) => "port_allocation",
            OrchestratorError::Source(_) => "source_acquisition",
            OrchestratorError::Descriptor(DescriptorError::UnsupportedProjectType(_)) => {
                "unsupported_project_type"
            }
            OrchestratorError::Descriptor(_) => "descriptor",
            OrchestratorError::Runtime(err) if err.is_not_found() => "container_missing",
            OrchestratorError::Runtime(_) => "runtime",
            OrchestratorError::Store(_) => "store",
        }
    }

    /// Human-readable rendering including the source chain, persisted into a
    /// failed deployment's record.
    pub fn detail(&self) -> String {
        use std::error::Error as _;
        let mut out = self.to_string();
        let mut cause = self.source();
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}
