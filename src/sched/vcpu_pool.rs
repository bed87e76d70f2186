//! Reuse pool for relinquished VCPUs.
//!
//! A bounded LIFO: the most recently parked VCPU is handed out first, which
//! keeps its backing thread warm. A full pool rejects the check-in and the
//! VCPU is terminated instead.

use std::sync::Arc;

use super::mtx::Mtx;
use super::vcpu::{Vcpu, VcpuState};

pub(crate) const VCPU_POOL_CAPACITY: usize = 32;

struct PoolInner {
    stack: Vec<Arc<Vcpu>>,
    capacity: usize,
}

pub(crate) struct VcpuPool {
    inner: Mtx<PoolInner>,
}

impl VcpuPool {
    pub(crate) fn new() -> VcpuPool {
        VcpuPool {
            inner: Mtx::new(PoolInner {
                stack: Vec::new(),
                capacity: VCPU_POOL_CAPACITY,
            }),
        }
    }

    /// Pops a cached VCPU, skipping any that got killed while parked.
    pub(crate) fn checkout(&self) -> Option<Arc<Vcpu>> {
        let mut g = self.inner.lock();
        while let Some(vp) = g.stack.pop() {
            if vp.state() != VcpuState::Terminating {
                return Some(vp);
            }
        }
        None
    }

    /// Caches `vp` for reuse. `false` tells the caller to terminate the VCPU
    /// instead.
    pub(crate) fn checkin(&self, vp: Arc<Vcpu>) -> bool {
        let mut g = self.inner.lock();
        if g.stack.len() < g.capacity {
            g.stack.push(vp);
            true
        } else {
            false
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().stack.len()
    }
}
