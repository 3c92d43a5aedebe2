//! Distributed counting semaphore over leased slot rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::SemaphoreConfig;
use crate::jobs::store::{JobStoreError, SlotStore};
use crate::jobs::types::JobId;

/// A held slot. Hand it back through [`ConcurrencySemaphore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPermit {
    pub resource: String,
    pub slot: u32,
    pub holder: JobId,
    /// Unique per acquisition; a stale permit for a re-claimed job frees nothing.
    pub lease: Uuid,
}

/// Caps how many jobs hold `resource` at once, across all workers.
pub struct ConcurrencySemaphore {
    slots: Arc<dyn SlotStore>,
    resource: String,
    capacity: u32,
    max_wait: Duration,
    poll: Duration,
}

impl ConcurrencySemaphore {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        resource: impl Into<String>,
        capacity: u32,
        max_wait: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            slots,
            resource: resource.into(),
            capacity,
            max_wait,
            poll,
        }
    }

    pub fn from_config(slots: Arc<dyn SlotStore>, cfg: &SemaphoreConfig) -> Self {
        Self::new(
            slots,
            cfg.resource.clone(),
            cfg.capacity,
            Duration::from_millis(cfg.max_wait_ms),
            Duration::from_millis(cfg.poll_interval_ms),
        )
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Create the slot rows. Safe to call from every worker at startup.
    pub async fn ensure(&self) -> Result<(), JobStoreError> {
        self.slots.ensure_slots(&self.resource, self.capacity).await
    }

    /// Take a slot if one is free right now.
    pub async fn try_acquire(&self, holder: JobId) -> Result<Option<SlotPermit>, JobStoreError> {
        let lease = Uuid::now_v7();
        let slot = self
            .slots
            .try_acquire_slot(&self.resource, self.capacity, holder, lease, Utc::now())
            .await?;
        Ok(slot.map(|slot| SlotPermit {
            resource: self.resource.clone(),
            slot,
            holder,
            lease,
        }))
    }

    /// Wait up to `max_wait` for a slot. `None` on timeout or cancellation.
    ///
    /// Only the dispatch of `holder` waits; other jobs keep flowing.
    pub async fn acquire(
        &self,
        holder: JobId,
        cancel: &CancellationToken,
    ) -> Result<Option<SlotPermit>, JobStoreError> {
        let deadline = tokio::time::Instant::now() + self.max_wait;
        loop {
            if let Some(permit) = self.try_acquire(holder).await? {
                debug!(resource = %self.resource, slot = permit.slot, job_id = %holder, "slot acquired");
                return Ok(Some(permit));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.poll.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    pub async fn release(&self, permit: &SlotPermit) -> Result<bool, JobStoreError> {
        let released = self
            .slots
            .release_slot(&permit.resource, permit.slot, permit.lease)
            .await?;
        debug!(resource = %permit.resource, slot = permit.slot, released, "slot released");
        Ok(released)
    }

    pub async fn in_use(&self) -> Result<u32, JobStoreError> {
        self.slots.slots_in_use(&self.resource).await
    }
}
