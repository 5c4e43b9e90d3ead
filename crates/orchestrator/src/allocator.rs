use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PortAllocationError {
    #[error("no free host port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("port {port} is already assigned to deployment {holder}")]
    AlreadyAssigned { port: u16, holder: Uuid },
}

/// Hands out host ports from a fixed inclusive range and guarantees no two
/// live deployments ever hold the same port. All bookkeeping lives behind one
/// lock, so concurrent allocations serialize instead of racing.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    assigned: Mutex<HashMap<Uuid, u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Assign the lowest free port to `deployment_id`. `externally_bound` is
    /// the set of host ports the container runtime currently has bound; those
    /// are skipped even when this allocator never handed them out, so a port
    /// taken by an unrelated process on the runtime side is not reused.
    ///
    /// Calling again for an id that already holds a port returns that same
    /// port without consuming another one.
    pub async fn allocate(
        &self,
        deployment_id: Uuid,
        externally_bound: &HashSet<u16>,
    ) -> Result<u16, PortAllocationError> {
        let mut assigned = self.assigned.lock().await;
        if let Some(port) = assigned.get(&deployment_id) {
            return Ok(*port);
        }

        let taken: HashSet<u16> = assigned.values().copied().collect();
        let port = self
            .range
            .clone()
            .find(|p| !taken.contains(p) && !externally_bound.contains(p))
            .ok_or(PortAllocationError::Exhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;

        assigned.insert(deployment_id, port);
        Ok(port)
    }

    /// Return the deployment's port to the pool. Idempotent: releasing an id
    /// that holds nothing is a no-op.
    pub async fn release(&self, deployment_id: Uuid) -> Option<u16> {
        self.assigned.lock().await.remove(&deployment_id)
    }

    /// Re-register an assignment recovered from persisted state at startup.
    pub async fn adopt(&self, deployment_id: Uuid, port: u16) -> Result<(), PortAllocationError> {
        let mut assigned = self.assigned.lock().await;
        if let Some((holder, _)) = assigned
            .iter()
            .find(|(id, p)| **p == port && **id != deployment_id)
        {
            return Err(PortAllocationError::AlreadyAssigned {
                port,
                holder: *holder,
            });
        }
        assigned.insert(deployment_id, port);
        Ok(())
    }

    pub async fn port_of(&self, deployment_id: Uuid) -> Option<u16> {
        self.assigned.lock().await.get(&deployment_id).copied()
    }

    pub async fn in_use(&self) -> usize {
        self.assigned.lock().await.len()
    }
}
