use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Barrier, time};

use crate::error::{ActorErr, Result};

#[derive(Debug, Default)]
struct ReduceSlot {
    round: u64,
    acc: Vec<f32>,
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slots: [Mutex<ReduceSlot>; 2],
}

/// One rank's handle to the group of data-parallel training processes.
///
/// Every collective must be entered by all ranks in the same order. Reductions
/// alternate between two accumulation buffers so a fast rank starting round
/// `n + 1` never clobbers round `n` before every rank read it.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    round: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl ProcessGroup {
    /// Creates the handles of every rank of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks.
    /// * `timeout` - How long a rank waits for the others on every collective.
    ///
    /// # Returns
    /// One `ProcessGroup` per rank, indexed by rank.
    pub fn new_group(world_size: usize, timeout: Duration) -> Vec<Self> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Default::default(),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                timeout,
                round: Arc::new(AtomicU64::new(0)),
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A group made of a single rank, every collective returns immediately.
    pub fn single() -> Self {
        let mut group = Self::new_group(1, Duration::MAX);
        group.swap_remove(0)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Waits until every rank reached this point.
    ///
    /// # Returns
    /// Whether this rank was elected leader, or `CollectiveTimeout`.
    pub async fn barrier(&self, op: &'static str) -> Result<bool> {
        if self.world_size == 1 {
            return Ok(true);
        }

        match time::timeout(self.timeout, self.shared.barrier.wait()).await {
            Ok(res) => Ok(res.is_leader()),
            Err(_) => Err(ActorErr::CollectiveTimeout {
                op,
                rank: self.rank,
            }),
        }
    }

    /// Replaces `buf` with the element-wise sum of every rank's `buf`.
    ///
    /// # Arguments
    /// * `buf` - This rank's contribution, of the same length on every rank.
    ///
    /// # Returns
    /// `CollectiveTimeout` if any rank fails to contribute in time.
    pub async fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        let round = self.round.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = &self.shared.slots[(round % 2) as usize];

        {
            let mut slot = slot.lock();
            if slot.round != round {
                slot.round = round;
                slot.acc.clear();
                slot.acc.resize(buf.len(), 0.);
            }

            slot.acc.iter_mut().zip(buf.iter()).for_each(|(a, g)| *a += g);
        }

        self.barrier("all_reduce").await?;
        buf.copy_from_slice(&slot.lock().acc);
        Ok(())
    }
}
