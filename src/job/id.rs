//! Job identifiers and the generators that hand them out.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide unique, monotonically increasing job identifier.
///
/// `0` is reserved for "no job" and is what a default-constructed job carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// The reserved "no job" identifier.
    pub const NONE: JobId = JobId(0);

    /// Take the next identifier from the process-wide generator.
    pub fn next() -> Self {
        GLOBAL_IDS.next_id()
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of job identifiers. Injected into the pool so tests can control the sequence.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Atomic counter handing out increasing identifiers, never `0`.
#[derive(Debug)]
pub struct AtomicIdGenerator {
    next: AtomicU64,
}

impl AtomicIdGenerator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start the sequence at `first` (clamped to 1).
    pub const fn starting_at(first: u64) -> Self {
        let first = if first == 0 { 1 } else { first };
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for AtomicIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for AtomicIdGenerator {
    fn next_id(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The process-wide sequence behind [`JobId::next`], as an injectable generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIds;

impl IdGenerator for ProcessIds {
    fn next_id(&self) -> JobId {
        GLOBAL_IDS.next_id()
    }
}

/// Backs [`JobId::next`]; shared by every pool that was not given its own generator.
pub(crate) static GLOBAL_IDS: AtomicIdGenerator = AtomicIdGenerator::new();
