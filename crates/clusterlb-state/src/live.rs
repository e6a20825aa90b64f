//! Per-node live-status blocks.
//!
//! Hot counters updated by the dispatch path (elections, bytes moved,
//! busy count) and the computed load figures live outside the node
//! record so they can be bumped with single atomic operations, without
//! the node table lock. A block is addressed by a [`StatsHandle`]; the
//! handle goes stale as soon as the node slot is released and reused.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::slots::SlotId;

/// `(slot id, generation)` reference to a node's live-status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatsHandle {
    pub id: SlotId,
    pub generation: u64,
}

/// Live counters of one node.
#[derive(Debug, Default)]
pub struct LiveStatus {
    generation: AtomicU64,
    /// Times this worker won a routing decision.
    pub elected: AtomicU64,
    /// Bytes read from the backend.
    pub read: AtomicU64,
    /// Bytes sent to the backend.
    pub transferred: AtomicU64,
    /// Requests currently in flight.
    pub busy: AtomicU64,
    /// Weight. `0` is hot standby, negative is broken.
    pub lbfactor: AtomicI32,
    pub lbstatus: AtomicI64,
    in_error: AtomicBool,
    error_since_ms: AtomicU64,
}

impl LiveStatus {
    pub fn lbfactor(&self) -> i32 {
        self.lbfactor.load(Ordering::Relaxed)
    }

    pub fn set_lbfactor(&self, value: i32) {
        self.lbfactor.store(value, Ordering::Relaxed);
    }

    pub fn lbstatus(&self) -> i64 {
        self.lbstatus.load(Ordering::Relaxed)
    }

    pub fn elected(&self) -> u64 {
        self.elected.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> u64 {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    /// Whether the worker may take requests right now.
    pub fn is_usable(&self) -> bool {
        !self.in_error()
    }

    /// Put the worker in error. The error timestamp is only taken on
    /// the transition so retries are measured from the first failure.
    pub fn mark_error(&self, now_ms: u64) {
        if !self.in_error.swap(true, Ordering::AcqRel) {
            self.error_since_ms.store(now_ms, Ordering::Release);
        }
    }

    pub fn clear_error(&self) {
        self.in_error.store(false, Ordering::Release);
    }

    /// Lift the error state once `retry_ms` has elapsed since it was
    /// raised. Returns whether the worker is usable afterwards.
    pub fn try_retry(&self, now_ms: u64, retry_ms: u64) -> bool {
        if !self.in_error() {
            return true;
        }
        let since = self.error_since_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(since) >= retry_ms {
            self.clear_error();
            return true;
        }
        false
    }

    fn reset(&self, generation: u64) {
        self.elected.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.transferred.store(0, Ordering::Relaxed);
        self.busy.store(0, Ordering::Relaxed);
        self.lbfactor.store(1, Ordering::Relaxed);
        self.lbstatus.store(0, Ordering::Relaxed);
        self.in_error.store(false, Ordering::Relaxed);
        self.error_since_ms.store(0, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Release);
    }
}

/// One live-status block per node slot.
#[derive(Debug)]
pub struct LiveStatusTable {
    blocks: Vec<LiveStatus>,
}

impl LiveStatusTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: (0..capacity).map(|_| LiveStatus::default()).collect(),
        }
    }

    /// Bind the block of `handle.id` to `handle.generation` and zero it.
    pub fn reset(&self, handle: StatsHandle) {
        if let Some(block) = self.blocks.get(handle.id as usize) {
            block.reset(handle.generation);
        }
    }

    /// The block for `handle`, or `None` if the slot has moved on to
    /// another node since the handle was taken.
    pub fn get(&self, handle: StatsHandle) -> Option<&LiveStatus> {
        self.blocks
            .get(handle.id as usize)
            .filter(|b| b.generation.load(Ordering::Acquire) == handle.generation)
    }

    /// Detach the block of a released slot so outstanding handles stop
    /// resolving.
    pub fn invalidate(&self, id: SlotId) {
        if let Some(block) = self.blocks.get(id as usize) {
            block.generation.store(0, Ordering::Release);
        }
    }
}
