//! Per-call state for the lifecycle driver.
//!
//! Each call tracks which operation it is waiting on, how many terminal
//! completions are still outstanding, and how far byte validation has got.

/// Terminal completions every call must observe before it is released:
/// finish-accepted and finished.
const TERMINAL_COMPLETIONS: u8 = 2;

/// Which operation a call is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Accept slot requested; no call exists yet.
    Armed,
    /// A read is outstanding.
    Reading,
    /// An echo write is outstanding; no other write may be issued.
    Writing,
    /// Status has been issued; only terminal completions remain.
    Finishing,
}

/// Bookkeeping for one accepted call.
#[derive(Debug)]
pub struct CallState {
    /// Current lifecycle phase.
    pub phase: CallPhase,
    pending_ops: u8,
    bytes_read: u64,
}

impl CallState {
    /// Create state for a freshly armed accept slot.
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Armed,
            pending_ops: TERMINAL_COMPLETIONS,
            bytes_read: 0,
        }
    }

    /// Bytes validated so far on this call.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Mutable access to the validation counter.
    pub fn bytes_read_mut(&mut self) -> &mut u64 {
        &mut self.bytes_read
    }

    /// Terminal completions still outstanding.
    pub fn pending_ops(&self) -> u8 {
        self.pending_ops
    }

    /// Record one terminal completion.
    ///
    /// Returns `true` when this was the last one and the call may be
    /// destroyed.
    pub fn release(&mut self) -> bool {
        debug_assert!(self.pending_ops > 0, "call released too many times");
        self.pending_ops = self.pending_ops.saturating_sub(1);
        self.pending_ops == 0
    }

    /// Transition to waiting for a read.
    pub fn start_reading(&mut self) {
        self.phase = CallPhase::Reading;
    }

    /// Transition to waiting for an echo write to be accepted.
    pub fn start_writing(&mut self) {
        self.phase = CallPhase::Writing;
    }

    /// Status issued; only terminal completions remain.
    pub fn finish(&mut self) {
        self.phase = CallPhase::Finishing;
    }
}

impl Default for CallState {
    fn default() -> Self {
        Self::new()
    }
}
