//! Recycling identifier pool.
//!
//! Hands out small integer identifiers from a monotonically increasing
//! counter, preferring identifiers that were released earlier. An identifier
//! is never handed out twice while it is still held.

use std::collections::BTreeSet;

/// Identifier of a tracked background task.
pub type TaskId = u64;

/// Identifier of a live client connection.
pub type ConnectionId = u64;

/// Free-list backed counter for task and connection identifiers.
#[derive(Debug)]
pub struct IdPool {
    next: u64,
    free: BTreeSet<u64>,
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdPool {
    /// Create a pool whose first identifier is 1.
    pub fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    /// Take an identifier. Released identifiers are reused lowest first.
    pub fn acquire(&mut self) -> u64 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Return an identifier to the pool.
    ///
    /// Releasing an identifier that was never issued, or releasing one twice,
    /// is ignored.
    pub fn release(&mut self, id: u64) {
        if id == 0 || id >= self.next {
            return;
        }
        self.free.insert(id);
    }

    /// Number of identifiers currently held.
    pub fn live_count(&self) -> usize {
        (self.next - 1) as usize - self.free.len()
    }
}
