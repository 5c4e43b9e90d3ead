//! Shared API DTOs used by the orchestrator and its HTTP clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Deployment lifecycle state (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Accepted and waiting in the FIFO queue.
    Queued,
    /// Waiting for a human approval decision before entering the queue.
    Pending,
    /// Approved, about to be enqueued. Transient bookkeeping state.
    Approved,
    /// Rejected by an approver. Terminal.
    Rejected,
    /// The worker is running the pipeline for this deployment.
    Processing,
    /// The container is built and running. Terminal until teardown.
    Completed,
    /// A pipeline step failed; `error` carries the message. Terminal until teardown.
    Failed,
    /// Torn down; the record is erased right after this is reached.
    Deleted,
}

impl DeploymentStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Approved => "approved",
            DeploymentStatus::Rejected => "rejected",
            DeploymentStatus::Processing => "processing",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Deleted => "deleted",
        }
    }

    /// Parses the canonical lowercase representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(DeploymentStatus::Queued),
            "pending" => Some(DeploymentStatus::Pending),
            "approved" => Some(DeploymentStatus::Approved),
            "rejected" => Some(DeploymentStatus::Rejected),
            "processing" => Some(DeploymentStatus::Processing),
            "completed" => Some(DeploymentStatus::Completed),
            "failed" => Some(DeploymentStatus::Failed),
            "deleted" => Some(DeploymentStatus::Deleted),
            _ => None,
        }
    }

    /// Whether the pipeline will take no further action on this deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Rejected
                | DeploymentStatus::Completed
                | DeploymentStatus::Failed
                | DeploymentStatus::Deleted
        )
    }

    /// Legal transitions of the deployment state machine. Everything not
    /// listed here is illegal, including re-applying the current state.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Queued)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Deleted)
                | (Failed, Deleted)
                | (Rejected, Deleted)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment as reported by status and list endpoints. Mirrors the
/// persisted record shape.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentView {
    /// Unique deployment id, assigned at submission.
    pub id: Uuid,
    /// Requester identity, usually an email address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Current lifecycle state.
    pub status: DeploymentStatus,
    /// Human-readable description of the submitted source.
    pub source_description: String,
    /// Host port serving the deployment, once allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Runtime container identifier, once the container is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    /// Public URL for the running deployment, when a public host is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Last failure message, present only in `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was accepted.
    pub queued_at: DateTime<Utc>,
    /// When the worker began processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the pipeline reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Body for repository submissions (uploads use multipart instead).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitRequest {
    /// Git repository URL to clone at default-branch HEAD.
    pub repository: String,
    /// Requester identity, usually an email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Response to a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitResponse {
    /// Assigned deployment id; poll the status endpoint with it.
    pub deployment_id: Uuid,
    /// Initial state: `queued`, or `pending` under the approval gate.
    pub status: DeploymentStatus,
}

/// List endpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse {
    /// Deployments matching the filter, newest first.
    pub deployments: Vec<DeploymentView>,
    /// Convenience count of `deployments`.
    pub count: usize,
}

/// Point-in-time container resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    /// CPU usage percentage across all cores.
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Total bytes received across container networks.
    pub network_rx_bytes: u64,
    /// Total bytes transmitted across container networks.
    pub network_tx_bytes: u64,
}

/// Error payload returned by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub error: String,
}
