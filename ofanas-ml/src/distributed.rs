//! Collective-communication seam for metric reduction across replicas.
//!
//! The transport itself (MPI/NCCL) is external; the scheduler only needs a
//! synchronous all-reduce and to know whether it is the coordinating
//! replica.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::MlError;

/// Synchronous collective operations over the replicas of one run.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum across every replica. Blocks until all replicas have
    /// contributed; afterwards every replica holds the same values.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), MlError>;

    /// Sum across replicas, then divide by the world size.
    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), MlError> {
        self.all_reduce_sum(values)?;
        let world = self.world_size() as f64;
        for v in values.iter_mut() {
            *v /= world;
        }
        Ok(())
    }

    /// The coordinating replica: the only one that writes checkpoints and
    /// validation logs.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// A run with a single replica.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), MlError> {
        Ok(())
    }
}

struct Shared {
    slots: Mutex<Vec<Option<Vec<f64>>>>,
    barrier: Barrier,
}

/// In-process replicas, one per thread, for simulation and tests.
///
/// Contributions are summed in rank order, so the reduced values are
/// bit-identical on every replica.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create handles for `world_size` replicas; hand one to each thread.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), MlError> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| MlError::collective("reduction state poisoned"))?;
            slots[self.rank] = Some(values.to_vec());
        }
        self.shared.barrier.wait();

        let reduced = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| MlError::collective("reduction state poisoned"))?;
            let mut sum = vec![0.0; values.len()];
            let mut mismatch = None;
            for (rank, slot) in slots.iter().enumerate() {
                match slot {
                    Some(contribution) if contribution.len() == values.len() => {
                        for (acc, v) in sum.iter_mut().zip(contribution) {
                            *acc += v;
                        }
                    }
                    _ => mismatch = Some(rank),
                }
            }
            match mismatch {
                None => Ok(sum),
                Some(rank) => Err(MlError::collective(format!(
                    "replica {rank} contributed a different number of values"
                ))),
            }
        };
        // Every replica must finish reading before any slot is overwritten.
        self.shared.barrier.wait();

        values.copy_from_slice(&reduced?);
        Ok(())
    }
}
