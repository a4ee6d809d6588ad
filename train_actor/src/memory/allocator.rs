use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{ActorErr, Result};

/// Tag of the memory backing the live model's weights.
pub const MODEL_TAG: &str = "model";
/// Tag of the memory backing the optimizer's state.
pub const OPTIMIZER_TAG: &str = "optimizer";

/// A set of memory category labels.
pub type OffloadTags = BTreeSet<String>;

/// Builds an `OffloadTags` set out of string literals.
pub fn tags<const N: usize>(names: [&str; N]) -> OffloadTags {
    names.into_iter().map(str::to_string).collect()
}

#[derive(Debug, Default)]
struct Pool {
    bytes: usize,
    resident: bool,
}

/// Process-wide accounting of tagged device memory.
///
/// Allocations are grouped under tags so whole categories can be put to sleep
/// and woken up together. Transitions are serialized through `exclusive`.
#[derive(Debug)]
pub struct DeviceAllocator {
    capacity: usize,
    pools: Mutex<BTreeMap<String, Pool>>,
    transition: Mutex<()>,
}

impl DeviceAllocator {
    /// Creates a new `DeviceAllocator`.
    ///
    /// # Arguments
    /// * `capacity` - The amount of device bytes available to the process.
    ///
    /// # Returns
    /// A new `DeviceAllocator` without any allocation.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: Mutex::new(BTreeMap::new()),
            transition: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The amount of device bytes currently resident.
    pub fn used(&self) -> usize {
        resident_bytes(&self.pools.lock())
    }

    /// Accounts `bytes` more device memory under `tag`.
    ///
    /// # Returns
    /// `OutOfDeviceMemory` if the allocation doesn't fit.
    pub fn reserve(&self, tag: &str, bytes: usize) -> Result<()> {
        let mut pools = self.pools.lock();
        let available = self.capacity.saturating_sub(resident_bytes(&pools));
        let pool = pools.entry(tag.to_string()).or_insert(Pool {
            bytes: 0,
            resident: true,
        });

        if pool.resident && bytes > available {
            return Err(ActorErr::OutOfDeviceMemory {
                tag: tag.to_string(),
                requested: bytes,
                available,
            });
        }

        pool.bytes += bytes;
        Ok(())
    }

    /// Whether the memory under `tag` is on the device, unknown tags have nothing to evict.
    pub fn is_resident(&self, tag: &str) -> bool {
        self.pools.lock().get(tag).is_none_or(|pool| pool.resident)
    }

    /// The tags currently asleep.
    pub fn offloaded(&self) -> OffloadTags {
        self.pools
            .lock()
            .iter()
            .filter(|(_, pool)| !pool.resident)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Puts the memory under `tags` to sleep.
    ///
    /// # Returns
    /// The amount of bytes freed.
    pub fn sleep(&self, tags: &OffloadTags) -> usize {
        let mut pools = self.pools.lock();
        let mut freed = 0;

        for tag in tags {
            let pool = pools.entry(tag.clone()).or_default();
            if pool.resident {
                pool.resident = false;
                freed += pool.bytes;
            }
        }

        debug!("device memory asleep: freed={freed} used={}", resident_bytes(&pools));
        freed
    }

    /// Brings the memory under `tags` back to the device.
    ///
    /// # Returns
    /// The amount of bytes reacquired or `OutOfDeviceMemory` if they don't fit,
    /// in which case nothing is woken up.
    pub fn wake_up(&self, tags: &OffloadTags) -> Result<usize> {
        let mut pools = self.pools.lock();
        let available = self.capacity.saturating_sub(resident_bytes(&pools));

        let requested: usize = tags
            .iter()
            .filter_map(|tag| pools.get(tag))
            .filter(|pool| !pool.resident)
            .map(|pool| pool.bytes)
            .sum();

        if requested > available {
            let tag = tags.iter().cloned().collect::<Vec<_>>().join(",");
            return Err(ActorErr::OutOfDeviceMemory {
                tag,
                requested,
                available,
            });
        }

        for tag in tags {
            if let Some(pool) = pools.get_mut(tag) {
                pool.resident = true;
            }
        }

        debug!("device memory awake: acquired={requested} used={}", resident_bytes(&pools));
        Ok(requested)
    }

    /// Serializes memory transitions across the process.
    pub fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.transition.lock()
    }
}

fn resident_bytes(pools: &BTreeMap<String, Pool>) -> usize {
    pools
        .values()
        .filter(|pool| pool.resident)
        .map(|pool| pool.bytes)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_frees_and_wake_up_reacquires() {
        let allocator = DeviceAllocator::new(100);
        allocator.reserve(MODEL_TAG, 60).unwrap();
        allocator.reserve(OPTIMIZER_TAG, 30).unwrap();
        assert_eq!(allocator.used(), 90);

        assert_eq!(allocator.sleep(&tags([MODEL_TAG])), 60);
        assert_eq!(allocator.used(), 30);
        assert!(!allocator.is_resident(MODEL_TAG));
        assert_eq!(allocator.offloaded(), tags([MODEL_TAG]));

        assert_eq!(allocator.sleep(&tags([MODEL_TAG])), 0);
        assert_eq!(allocator.wake_up(&tags([MODEL_TAG])).unwrap(), 60);
        assert_eq!(allocator.used(), 90);
    }

    #[test]
    fn refuses_over_capacity() {
        let allocator = DeviceAllocator::new(100);
        allocator.reserve(MODEL_TAG, 60).unwrap();
        allocator.sleep(&tags([MODEL_TAG]));
        allocator.reserve("kv_cache", 50).unwrap();

        let err = allocator.wake_up(&tags([MODEL_TAG])).unwrap_err();
        assert!(matches!(err, ActorErr::OutOfDeviceMemory { requested: 60, available: 50, .. }));
        assert!(!allocator.is_resident(MODEL_TAG));
    }
}
