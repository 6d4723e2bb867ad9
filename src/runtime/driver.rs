//! Call lifecycle driver.
//!
//! A single dispatch loop pulls completions from the transport and moves
//! each call through accept → read → echo write → status → teardown:
//!
//! ```text
//! Armed --call-new--> Reading --read(data)--> Writing --write-accepted--> Reading
//!                        |
//!                        +--read(end)--> Finishing --finish-accepted + finished--> destroyed
//! ```
//!
//! Every call starts with two outstanding terminal completions
//! (finish-accepted and finished). They may arrive in either order; whichever
//! one brings the count to zero destroys the call and frees its state.
//!
//! Anything unexpected (a rejected operation, a failed echo write, a byte
//! that breaks the workload pattern, an event out of sequence) is a broken
//! invariant. `dispatch` reports it as a `DriverError` and `run` aborts.

use crate::runtime::call::{CallPhase, CallState};
use crate::runtime::token::{CallTable, CallTag};
use crate::runtime::transport::{
    CallError, CallEvent, CallId, Event, OpResult, Status, Transport, WriteFlags,
};
use crate::runtime::validator::{self, Mismatch};
use std::fmt;
use std::io;
use tracing::{debug, error, trace};

/// Initial capacity of the call table.
const INITIAL_CALLS: usize = 64;

/// Fatal conditions detected while driving calls.
#[derive(Debug)]
pub enum DriverError {
    /// Waiting on the completion queue failed.
    Queue(io::Error),
    /// The transport refused to start an operation.
    Transport {
        op: &'static str,
        call: Option<CallId>,
        error: CallError,
    },
    /// An echo write completed unsuccessfully.
    WriteRejected { call: CallId },
    /// Inbound bytes broke the echo workload pattern.
    Validation { call: CallId, mismatch: Mismatch },
    /// An event carried a tag with no live call state.
    UnknownTag { tag: CallTag, event: &'static str },
    /// An event arrived that the call's current phase does not allow.
    UnexpectedEvent {
        event: &'static str,
        phase: Option<CallPhase>,
    },
}

impl DriverError {
    fn transport(op: &'static str, call: CallId, error: CallError) -> Self {
        DriverError::Transport {
            op,
            call: Some(call),
            error,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Queue(e) => write!(f, "completion queue failed: {e}"),
            DriverError::Transport {
                op,
                call: Some(call),
                error,
            } => write!(f, "{op} on {call} rejected: {error}"),
            DriverError::Transport {
                op,
                call: None,
                error,
            } => write!(f, "{op} rejected: {error}"),
            DriverError::WriteRejected { call } => write!(f, "echo write on {call} failed"),
            DriverError::Validation { call, mismatch } => {
                write!(f, "invalid payload on {call}: {mismatch}")
            }
            DriverError::UnknownTag { tag, event } => {
                write!(f, "{event} event for unknown {tag}")
            }
            DriverError::UnexpectedEvent {
                event,
                phase: Some(phase),
            } => write!(f, "unexpected {event} event while {phase:?}"),
            DriverError::UnexpectedEvent { event, phase: None } => {
                write!(f, "unexpected {event} event")
            }
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Queue(e) => Some(e),
            DriverError::Transport { error, .. } => Some(error),
            DriverError::Validation { mismatch, .. } => Some(mismatch),
            _ => None,
        }
    }
}

/// Drives every call on one transport from a single thread.
pub struct Driver<T: Transport> {
    transport: T,
    calls: CallTable,
}

impl<T: Transport> Driver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            calls: CallTable::new(INITIAL_CALLS),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Live call states, including armed accept slots.
    pub fn calls(&self) -> &CallTable {
        &self.calls
    }

    /// Arm one accept slot with fresh call state.
    pub fn request_call(&mut self) -> Result<CallTag, DriverError> {
        let tag = self.calls.insert(CallState::new());
        if let Err(error) = self.transport.request_call(tag) {
            self.calls.remove(tag);
            return Err(DriverError::Transport {
                op: "request_call",
                call: None,
                error,
            });
        }
        trace!(tag = tag.index(), "Armed accept slot");
        Ok(tag)
    }

    /// Prime one accept slot and dispatch completions forever.
    ///
    /// Never returns: any fatal condition is logged and the process aborts.
    pub fn run(mut self) -> ! {
        if let Err(e) = self.request_call() {
            fatal(e);
        }

        loop {
            let event = match self.transport.next_event() {
                Ok(event) => event,
                Err(e) => fatal(DriverError::Queue(e)),
            };
            if let Err(e) = self.dispatch(event) {
                fatal(e);
            }
        }
    }

    /// Handle one completion, then return it to the transport.
    pub fn dispatch(&mut self, event: Event) -> Result<(), DriverError> {
        let result = match &event {
            Event::Call { call, tag, kind } => {
                trace!(call = call.0, tag = tag.index(), event = kind.name(), "Dispatch");
                self.on_call_event(*call, *tag, kind)
            }
            Event::QueueShutdown => Err(DriverError::UnexpectedEvent {
                event: "queue-shutdown",
                phase: None,
            }),
        };
        self.transport.finish_event(event);
        result
    }

    fn on_call_event(
        &mut self,
        call: CallId,
        tag: CallTag,
        kind: &CallEvent,
    ) -> Result<(), DriverError> {
        let state = self.calls.get_mut(tag).ok_or(DriverError::UnknownTag {
            tag,
            event: kind.name(),
        })?;

        match kind {
            CallEvent::CallNew => {
                expect_phase(kind, state, CallPhase::Armed)?;
                self.transport
                    .accept_call(call, tag, WriteFlags::BUFFER_HINT)
                    .map_err(|e| DriverError::transport("accept_call", call, e))?;
                state.start_reading();
                debug!(call = call.0, tag = tag.index(), "Accepted call");

                self.request_call()?;
                self.transport
                    .start_read(call, tag)
                    .map_err(|e| DriverError::transport("start_read", call, e))
            }
            CallEvent::WriteAccepted(result) => {
                expect_phase(kind, state, CallPhase::Writing)?;
                if *result != OpResult::Ok {
                    return Err(DriverError::WriteRejected { call });
                }
                self.transport
                    .start_read(call, tag)
                    .map_err(|e| DriverError::transport("start_read", call, e))?;
                state.start_reading();
                Ok(())
            }
            CallEvent::Read(Some(message)) => {
                expect_phase(kind, state, CallPhase::Reading)?;
                validator::validate(state.bytes_read_mut(), message.chunks())
                    .map_err(|mismatch| DriverError::Validation { call, mismatch })?;
                trace!(
                    call = call.0,
                    bytes = message.len(),
                    total = state.bytes_read(),
                    "Echoing message"
                );
                self.transport
                    .start_write(call, message.clone(), tag, WriteFlags::BUFFER_HINT)
                    .map_err(|e| DriverError::transport("start_write", call, e))?;
                state.start_writing();
                Ok(())
            }
            CallEvent::Read(None) => {
                expect_phase(kind, state, CallPhase::Reading)?;
                self.transport
                    .start_write_status(call, Status::ok(), tag)
                    .map_err(|e| DriverError::transport("start_write_status", call, e))?;
                state.finish();
                debug!(
                    call = call.0,
                    bytes = state.bytes_read(),
                    "Client done sending, status written"
                );
                Ok(())
            }
            CallEvent::FinishAccepted(_) | CallEvent::Finished(_) => {
                if state.phase == CallPhase::Armed {
                    return Err(unexpected(kind, state));
                }
                if let CallEvent::Finished(status) = kind {
                    if !status.is_ok() {
                        debug!(call = call.0, status = ?status, "Call closed abnormally");
                    }
                }
                if state.release() {
                    self.transport.destroy_call(call);
                    let bytes = self.calls.remove(tag).map_or(0, |s| s.bytes_read());
                    debug!(call = call.0, tag = tag.index(), bytes, "Call destroyed");
                }
                Ok(())
            }
        }
    }
}

fn expect_phase(kind: &CallEvent, state: &CallState, phase: CallPhase) -> Result<(), DriverError> {
    if state.phase == phase {
        Ok(())
    } else {
        Err(unexpected(kind, state))
    }
}

fn unexpected(kind: &CallEvent, state: &CallState) -> DriverError {
    DriverError::UnexpectedEvent {
        event: kind.name(),
        phase: Some(state.phase),
    }
}

fn fatal(error: DriverError) -> ! {
    error!(error = %error, "Fatal call lifecycle error");
    std::process::abort()
}
