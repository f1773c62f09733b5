//! Memory placement policy for audio buffers.
//!
//! Two budgets model the device's memory map:
//!
//! | Pool | Backing | Used for |
//! |------|---------|----------|
//! | bus-capable | internal SRAM reachable by the I2S DMA engine | capture frames, transport staging |
//! | auxiliary | large external PSRAM | decode scratch, read-ahead, recordings |
//!
//! A buffer's [`MemoryTier`] is fixed when it is allocated. There is no
//! setter: moving a buffer into a DMA role means allocating a new one.
//!
//! `BusCapable` requests that cannot be met from the bus pool fall back to
//! the auxiliary pool with a degraded-mode warning. `Auxiliary` requests
//! prefer the auxiliary pool and borrow from the bus pool only when it is
//! exhausted. [`OutOfMemory`] is returned only when both pools (or the
//! process heap) are exhausted.

use std::ops::{Deref, DerefMut};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::OutOfMemory;

/// Placement requirement attached to every audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryTier {
    /// Must be reachable by the transport's DMA engine.
    BusCapable,
    /// Decode scratch, file buffering and other CPU-only data.
    Auxiliary,
}

/// Which pool actually backs a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    BusPool,
    AuxiliaryPool,
    /// A `BusCapable` request served from the auxiliary pool.
    Degraded,
}

#[derive(Debug)]
struct PoolState {
    name: &'static str,
    capacity: usize,
    used: AtomicUsize,
}

impl PoolState {
    fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.capacity {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Returns reserved bytes to their pool when dropped.
#[derive(Debug)]
struct PoolLease {
    pool: Arc<PoolState>,
    bytes: usize,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release(self.bytes);
    }
}

/// A heap buffer tagged with its memory tier.
///
/// Dereferences to a slice; the length is fixed at allocation.
#[derive(Debug)]
pub struct AudioBuffer<T> {
    data: Vec<T>,
    tier: MemoryTier,
    placement: Placement,
    _lease: Option<PoolLease>,
}

impl<T> AudioBuffer<T> {
    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// `false` when a `BusCapable` buffer landed outside the bus pool.
    pub fn is_dma_safe(&self) -> bool {
        match self.tier {
            MemoryTier::BusCapable => self.placement == Placement::BusPool,
            MemoryTier::Auxiliary => true,
        }
    }
}

impl<T: Clone> AudioBuffer<T> {
    /// Wrap caller-owned samples without pool accounting.
    ///
    /// Used for data that already lives in ordinary memory (e.g. PCM handed
    /// over by the orchestration layer); always tagged `Auxiliary`.
    pub fn unpooled(data: Vec<T>) -> Self {
        Self {
            data,
            tier: MemoryTier::Auxiliary,
            placement: Placement::AuxiliaryPool,
            _lease: None,
        }
    }
}

impl<T> Deref for AudioBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for AudioBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Point-in-time pool usage, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub bus_used: usize,
    pub bus_capacity: usize,
    pub auxiliary_used: usize,
    pub auxiliary_capacity: usize,
    pub degraded_allocations: usize,
}

/// Allocator front-end implementing the placement policy.
///
/// Cheap to clone; clones share the same budgets.
#[derive(Debug, Clone)]
pub struct MemoryPlacement {
    bus: Arc<PoolState>,
    aux: Arc<PoolState>,
    degraded: Arc<AtomicUsize>,
}

impl MemoryPlacement {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            bus: PoolState::new("bus-capable", config.bus_pool_bytes),
            aux: PoolState::new("auxiliary", config.auxiliary_pool_bytes),
            degraded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate `len` default-initialised elements in the requested tier.
    ///
    /// # Errors
    /// [`OutOfMemory`] when neither pool (nor the process heap) can hold the
    /// buffer. Callers abort the current operation and keep running.
    pub fn allocate<T: Clone + Default>(
        &self,
        len: usize,
        tier: MemoryTier,
    ) -> Result<AudioBuffer<T>, OutOfMemory> {
        let bytes = len.saturating_mul(std::mem::size_of::<T>());
        let oom = OutOfMemory {
            requested: bytes,
            tier,
        };

        let (pool, placement) = match tier {
            MemoryTier::BusCapable => {
                if self.bus.try_reserve(bytes) {
                    (Arc::clone(&self.bus), Placement::BusPool)
                } else if self.aux.try_reserve(bytes) {
                    let count = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        bytes,
                        degraded_allocations = count,
                        "bus-capable pool exhausted; buffer placed in auxiliary memory (DMA safety not guaranteed)"
                    );
                    (Arc::clone(&self.aux), Placement::Degraded)
                } else {
                    return Err(oom);
                }
            }
            MemoryTier::Auxiliary => {
                if self.aux.try_reserve(bytes) {
                    (Arc::clone(&self.aux), Placement::AuxiliaryPool)
                } else if self.bus.try_reserve(bytes) {
                    debug!(bytes, "auxiliary pool exhausted; borrowing bus-capable memory");
                    (Arc::clone(&self.bus), Placement::BusPool)
                } else {
                    return Err(oom);
                }
            }
        };
        let lease = PoolLease { pool, bytes };

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            warn!(
                pool = lease.pool.name,
                bytes, "heap allocation failed after pool reservation"
            );
            return Err(oom);
        }
        data.resize(len, T::default());

        Ok(AudioBuffer {
            data,
            tier,
            placement,
            _lease: Some(lease),
        })
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            bus_used: self.bus.used.load(Ordering::Relaxed),
            bus_capacity: self.bus.capacity,
            auxiliary_used: self.aux.used.load(Ordering::Relaxed),
            auxiliary_capacity: self.aux.capacity,
            degraded_allocations: self.degraded.load(Ordering::Relaxed),
        }
    }
}
