//! Table of asynchronous operations awaiting their completion event.

use std::collections::BTreeMap;

use crate::common::{MachineId, PowerState};

/// Status of the last operation issued for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    /// No operation was ever issued.
    Idle,
    /// Issued, completion not yet observed.
    Pending,
    /// Completion observed.
    Confirmed,
}

/// Why a migration was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationReason {
    Consolidation,
    Rebalance,
    MemoryPressure,
    SlaRescue,
}

/// An outstanding migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationOp {
    pub source: MachineId,
    pub target: MachineId,
    pub reason: MigrationReason,
}

/// An outstanding machine power state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChangeOp {
    pub from: PowerState,
    pub to: PowerState,
}

/// Pending-operation table keyed by entity id.
///
/// Entries move `Pending -> Confirmed` only through [`PendingOps::confirm`], which the controller calls from the
/// matching completion event. A confirmed entry may be reused by a new operation.
#[derive(Clone, Debug)]
pub struct PendingOps<K: Ord + Copy, Op: Clone> {
    entries: BTreeMap<K, (OpStatus, Op)>,
}

impl<K: Ord + Copy, Op: Clone> Default for PendingOps<K, Op> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Copy, Op: Clone> PendingOps<K, Op> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending operation. Fails with the outstanding operation if there is one.
    pub fn begin(&mut self, key: K, op: Op) -> Result<(), Op> {
        if let Some((OpStatus::Pending, current)) = self.entries.get(&key) {
            return Err(current.clone());
        }
        self.entries.insert(key, (OpStatus::Pending, op));
        Ok(())
    }

    /// Registers a new pending operation, superseding the outstanding one if there is one.
    /// Returns the superseded operation.
    pub fn supersede(&mut self, key: K, op: Op) -> Option<Op> {
        match self.entries.insert(key, (OpStatus::Pending, op)) {
            Some((OpStatus::Pending, prev)) => Some(prev),
            _ => None,
        }
    }

    /// Marks the pending operation as completed and returns it.
    /// Returns `None` if nothing was pending for the key.
    pub fn confirm(&mut self, key: K) -> Option<Op> {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.0 == OpStatus::Pending => {
                entry.0 = OpStatus::Confirmed;
                Some(entry.1.clone())
            }
            _ => None,
        }
    }

    pub fn status(&self, key: K) -> OpStatus {
        self.entries.get(&key).map(|(status, _)| *status).unwrap_or(OpStatus::Idle)
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.status(key) == OpStatus::Pending
    }

    /// Returns the outstanding operation for the key.
    pub fn get_pending(&self, key: K) -> Option<&Op> {
        match self.entries.get(&key) {
            Some((OpStatus::Pending, op)) => Some(op),
            _ => None,
        }
    }

    /// Iterates over outstanding operations in key order.
    pub fn pending(&self) -> impl Iterator<Item = (K, &Op)> {
        self.entries
            .iter()
            .filter(|(_, (status, _))| *status == OpStatus::Pending)
            .map(|(key, (_, op))| (*key, op))
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let mut ops = PendingOps::<u32, &str>::new();
        assert_eq!(ops.status(1), OpStatus::Idle);
        assert_eq!(ops.begin(1, "first"), Ok(()));
        assert_eq!(ops.begin(1, "second"), Err("first"));
        assert!(ops.is_pending(1));

        assert_eq!(ops.confirm(1), Some("first"));
        assert_eq!(ops.confirm(1), None);
        assert_eq!(ops.status(1), OpStatus::Confirmed);
        assert_eq!(ops.confirm(2), None);

        assert_eq!(ops.begin(1, "third"), Ok(()));
        assert_eq!(ops.pending().collect::<Vec<_>>(), vec![(1, &"third")]);
    }
}
