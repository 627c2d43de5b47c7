use std::collections::VecDeque;
use std::sync::mpsc;

use cardscan_core::model::WorkerState;
use tracing::debug;

use crate::engine::SlotId;
use crate::worker::{Job, WorkerHandle};

#[derive(Debug)]
struct Slot {
    state: WorkerState,
    generation: u64,
    worker: Option<WorkerHandle>,
    replacement_pending: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolCounts {
    pub idle: usize,
    pub busy: usize,
    pub failed: usize,
    pub stopped: usize,
}

/// A worker taken out of the idle rotation for one task.
pub(crate) struct Lease {
    pub slot: SlotId,
    pub generation: u64,
    pub jobs: mpsc::Sender<Job>,
}

/// Registry of worker slots. Fixed size; a slot's worker is swapped, never the
/// slot itself.
///
/// Every transition checks the caller's generation, so a stale release or
/// quarantine for a worker that has already been replaced does nothing.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    slots: Vec<Slot>,
    idle: VecDeque<SlotId>,
}

impl WorkerPool {
    /// Builds the pool from freshly loaded workers, all idle.
    pub fn new(workers: Vec<WorkerHandle>) -> Self {
        let mut slots = Vec::with_capacity(workers.len());
        let mut idle = VecDeque::with_capacity(workers.len());
        for (i, worker) in workers.into_iter().enumerate() {
            debug_assert_eq!(worker.slot(), SlotId(i));
            idle.push_back(worker.slot());
            slots.push(Slot {
                state: WorkerState::Idle,
                generation: worker.generation(),
                worker: Some(worker),
                replacement_pending: false,
            });
        }
        Self { slots, idle }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn state(&self, slot: SlotId) -> Option<WorkerState> {
        self.slots.get(slot.0).map(|s| s.state)
    }

    /// Non-blocking: takes the longest-idle worker and marks it busy.
    pub fn acquire_idle(&mut self) -> Option<Lease> {
        while let Some(id) = self.idle.pop_front() {
            let slot = &mut self.slots[id.0];
            let Some(worker) = slot.worker.as_ref() else {
                continue;
            };
            if slot.state != WorkerState::Idle {
                continue;
            }
            slot.state = WorkerState::Busy;
            return Some(Lease {
                slot: id,
                generation: slot.generation,
                jobs: worker.sender(),
            });
        }
        None
    }

    /// Busy -> Idle.
    pub fn release(&mut self, id: SlotId, generation: u64) -> bool {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return false;
        };
        if slot.generation != generation || slot.state != WorkerState::Busy {
            return false;
        }
        slot.state = WorkerState::Idle;
        self.idle.push_back(id);
        true
    }

    /// Busy -> Failed. Detaches the worker and returns the generation its
    /// replacement must carry.
    pub fn quarantine(&mut self, id: SlotId, generation: u64) -> Option<u64> {
        let slot = self.slots.get_mut(id.0)?;
        if slot.generation != generation || slot.state != WorkerState::Busy {
            return None;
        }
        slot.state = WorkerState::Failed;
        slot.generation += 1;
        slot.replacement_pending = true;
        if let Some(worker) = slot.worker.take() {
            worker.retire();
        }
        debug!(slot = %id, next_generation = slot.generation, "worker quarantined");
        Some(slot.generation)
    }

    /// Failed -> Idle with a freshly loaded worker. Hands the worker back if
    /// the slot no longer expects it (for example after shutdown).
    pub fn install(&mut self, worker: WorkerHandle) -> Result<(), WorkerHandle> {
        let id = worker.slot();
        let Some(slot) = self.slots.get_mut(id.0) else {
            return Err(worker);
        };
        if slot.state != WorkerState::Failed || slot.generation != worker.generation() {
            return Err(worker);
        }
        slot.state = WorkerState::Idle;
        slot.worker = Some(worker);
        slot.replacement_pending = false;
        self.idle.push_back(id);
        Ok(())
    }

    /// Replacement attempts for `id` ran out; the slot stays failed.
    pub fn abandon_replacement(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.replacement_pending = false;
        }
    }

    /// Every slot is failed and nothing is coming to replace them.
    pub fn is_exhausted(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.state == WorkerState::Failed && !s.replacement_pending)
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in &self.slots {
            match slot.state {
                WorkerState::Idle => counts.idle += 1,
                WorkerState::Busy => counts.busy += 1,
                WorkerState::Failed => counts.failed += 1,
                WorkerState::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    /// Marks every slot stopped and hands back the live workers for joining.
    pub fn shutdown(&mut self) -> Vec<WorkerHandle> {
        self.idle.clear();
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                slot.state = WorkerState::Stopped;
                slot.replacement_pending = false;
                slot.worker.take()
            })
            .collect()
    }
}
