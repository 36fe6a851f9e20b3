//! Pluggable backend-selection policy for work that starts from scratch
//! (room creation). The orchestrator hands the policy the connected subset
//! of the pool, sorted by instance id.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::BackendSession;

pub trait SelectInstance: Send + Sync {
    /// Pick one instance from the pool; `None` when the pool is empty.
    fn select(&self, pool: &[Arc<BackendSession>]) -> Option<Arc<BackendSession>>;
}

/// Default policy: rotate through the pool.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectInstance for RoundRobin {
    fn select(&self, pool: &[Arc<BackendSession>]) -> Option<Arc<BackendSession>> {
        if pool.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool.get(index).cloned()
    }
}
