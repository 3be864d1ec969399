//! Worker table: engines by index with their ready flags.

use std::sync::Arc;

use crate::engine::Engine;
use crate::error::invariant_violation;

struct WorkerSlot {
    engine: Arc<dyn Engine>,
    ready: bool,
}

/// Owned by the scheduler. Index `i` is the worker label jobs record.
#[derive(Default)]
pub(crate) struct WorkerTable {
    slots: Vec<WorkerSlot>,
}

impl WorkerTable {
    pub(crate) fn new(engines: Vec<Arc<dyn Engine>>) -> Self {
        let mut table = Self::default();
        for engine in engines {
            table.push(engine);
        }
        table
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Claim the lowest-indexed ready worker.
    pub(crate) fn claim_free(&mut self) -> Option<(usize, Arc<dyn Engine>)> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.ready)?;
        slot.ready = false;
        Some((index, Arc::clone(&slot.engine)))
    }

    /// Mark a worker ready again.
    pub(crate) fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::debug!(worker = index, "Ready notification for a removed worker");
            return;
        };
        if slot.ready {
            invariant_violation(format!("worker {index} released while already ready"));
        }
        slot.ready = true;
    }

    /// Append a fresh, ready worker.
    pub(crate) fn push(&mut self, engine: Arc<dyn Engine>) {
        self.slots.push(WorkerSlot {
            engine,
            ready: true,
        });
    }

    /// Remove the highest-indexed worker if the table is above `target`
    /// and that worker is idle.
    pub(crate) fn pop_if_ready(&mut self, target: usize) -> Option<Arc<dyn Engine>> {
        if self.slots.len() <= target || !self.slots.last()?.ready {
            return None;
        }
        self.slots.pop().map(|slot| slot.engine)
    }

    pub(crate) fn ready(&self) -> Vec<bool> {
        self.slots.iter().map(|slot| slot.ready).collect()
    }

    pub(crate) fn engines(&self) -> Vec<Arc<dyn Engine>> {
        self.slots.iter().map(|slot| Arc::clone(&slot.engine)).collect()
    }

    /// Remove every worker, highest index first.
    pub(crate) fn drain(&mut self) -> Vec<Arc<dyn Engine>> {
        self.slots.drain(..).rev().map(|slot| slot.engine).collect()
    }
}
