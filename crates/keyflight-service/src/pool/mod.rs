//! A lazily populated pool of long-lived handles.
//!
//! Handles are keyed by a signature string and created at most once per signature. Once
//! created, a handle is kept for as long as the pool lives. Nothing is ever evicted, replaced or
//! health-checked.
//!
//! Signatures usually embed connection credentials, so the pool never logs them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::BoxError;

/// Sizing limits handed to every handle the pool creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Maximum number of open connections per handle. `0` means unlimited.
    pub max_open: u32,
    /// Maximum number of idle connections per handle.
    pub max_idle: u32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: 0,
            max_idle: 2,
        }
    }
}

/// An error creating a pooled handle.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create handle")]
    Create(#[source] BoxError),
}

type Slot<H> = Arc<OnceCell<Arc<H>>>;

/// A map of lazily created handles, keyed by signature.
///
/// Lookups of existing handles only take a shared lock. Creating a handle takes the exclusive
/// lock just long enough to reserve a slot for the signature; the creation itself runs outside
/// the map lock, so it never blocks callers of other signatures.
pub struct ResourcePool<H> {
    limits: PoolLimits,
    handles: RwLock<HashMap<String, Slot<H>>>,
}

impl<H> std::fmt::Debug for ResourcePool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("limits", &self.limits)
            .field("handles", &self.len())
            .finish()
    }
}

impl<H> ResourcePool<H> {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            handles: Default::default(),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// The number of handles that have been successfully created.
    pub fn len(&self) -> usize {
        self.handles
            .read()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the slot for `signature`, reserving one if none exists yet.
    fn slot(&self, signature: &str) -> Slot<H> {
        if let Some(slot) = self.handles.read().get(signature) {
            return Arc::clone(slot);
        }

        // Someone else may have reserved the slot between dropping the read lock and
        // acquiring the write lock, in which case `entry` hands us theirs.
        let mut handles = self.handles.write();
        Arc::clone(handles.entry(signature.to_owned()).or_default())
    }

    /// Returns the handle for `signature`, creating it with `create` if it does not exist yet.
    ///
    /// `create` receives the pool-wide [`PoolLimits`] and runs at most once per signature at a
    /// time. Concurrent callers for the same signature wait for it and share the created handle.
    ///
    /// # Errors
    ///
    /// A failed creation is returned to the caller whose `create` failed. Nothing is stored and
    /// the signature is dropped from the map, so the next caller (including one that was already
    /// waiting) attempts the creation again.
    pub async fn get_handle<F, Fut, E>(&self, signature: &str, create: F) -> Result<Arc<H>, PoolError>
    where
        F: FnOnce(PoolLimits) -> Fut,
        Fut: Future<Output = Result<H, E>>,
        E: Into<BoxError>,
    {
        let slot = self.slot(signature);
        if let Some(handle) = slot.get() {
            metric!(counter("pool.handle.hit") += 1);
            return Ok(Arc::clone(handle));
        }

        let limits = self.limits;
        let result = slot
            .get_or_try_init(|| async move {
                metric!(counter("pool.handle.create") += 1);
                tracing::debug!(
                    max_open = limits.max_open,
                    max_idle = limits.max_idle,
                    "Creating pooled handle"
                );
                match create(limits).await {
                    Ok(handle) => Ok(Arc::new(handle)),
                    Err(err) => {
                        let err = PoolError::Create(err.into());
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            "Failed to create pooled handle"
                        );
                        Err(err)
                    }
                }
            })
            .await;

        match result {
            Ok(handle) => Ok(Arc::clone(handle)),
            Err(err) => {
                self.release(signature, &slot);
                Err(err)
            }
        }
    }

    /// Drops the reserved `slot` of a failed creation.
    ///
    /// The slot stays while other callers hold it: they retry the creation in the same slot and
    /// the last one to fail removes it. New callers only obtain slots under the map lock, so the
    /// holder count cannot grow while it is being checked.
    fn release(&self, signature: &str, slot: &Slot<H>) {
        let mut handles = self.handles.write();
        if let Some(current) = handles.get(signature) {
            // one reference held by the map, one by the caller
            let unused = Arc::strong_count(current) == 2;
            if Arc::ptr_eq(current, slot) && unused && !current.initialized() {
                handles.remove(signature);
            }
        }
    }

    #[cfg(test)]
    fn reserved_slots(&self) -> usize {
        self.handles.read().len()
    }
}
