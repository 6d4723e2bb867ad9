//! Call tags for completion correlation.
//!
//! Every operation the driver hands to the transport carries a `CallTag`.
//! The transport returns it untouched with each completion, and the driver
//! uses it to find the call's state again.

use crate::runtime::call::CallState;
use slab::Slab;
use std::fmt;

/// Opaque handle to one call's state in the `CallTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTag(usize);

impl CallTag {
    /// Raw slab index, for logging.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Table of live call states with O(1) lookup by tag.
///
/// Slots are reused once a call has been released, so a tag is only
/// meaningful until both of its terminal completions have fired.
pub struct CallTable {
    calls: Slab<CallState>,
}

impl CallTable {
    /// Create an empty table with room for `capacity` calls before growing.
    pub fn new(capacity: usize) -> Self {
        Self {
            calls: Slab::with_capacity(capacity),
        }
    }

    /// Store fresh state for a new accept slot.
    pub fn insert(&mut self, state: CallState) -> CallTag {
        CallTag(self.calls.insert(state))
    }

    pub fn get(&self, tag: CallTag) -> Option<&CallState> {
        self.calls.get(tag.0)
    }

    pub fn get_mut(&mut self, tag: CallTag) -> Option<&mut CallState> {
        self.calls.get_mut(tag.0)
    }

    /// Release a call's state.
    ///
    /// Returns `None` if the tag is invalid or already released.
    pub fn remove(&mut self, tag: CallTag) -> Option<CallState> {
        self.calls.try_remove(tag.0)
    }

    /// Number of live calls, including armed accept slots.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::call::CallPhase;

    #[test]
    fn test_call_table() {
        let mut table = CallTable::new(16);

        let t1 = table.insert(CallState::new());
        let t2 = table.insert(CallState::new());
        assert_eq!(table.len(), 2);

        table.get_mut(t2).unwrap().start_reading();
        assert_eq!(table.get(t1).unwrap().phase, CallPhase::Armed);
        assert_eq!(table.get(t2).unwrap().phase, CallPhase::Reading);

        assert!(table.remove(t1).is_some());
        assert!(table.get(t1).is_none());
        assert!(table.remove(t1).is_none());
        assert_eq!(table.len(), 1);

        // Slab reuses slots
        let t3 = table.insert(CallState::new());
        assert_eq!(t3, t1);
    }

    #[test]
    fn test_tag_display() {
        let mut table = CallTable::new(1);
        let tag = table.insert(CallState::new());
        assert_eq!(tag.to_string(), format!("tag#{}", tag.index()));
    }
}
