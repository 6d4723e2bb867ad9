//! Boundary between the lifecycle driver and the call transport.
//!
//! The transport owns connections, framing and the completion queue. The
//! driver only sees calls through `CallId` handles and learns about progress
//! exclusively through `Event`s returned by `next_event`.

use crate::runtime::token::CallTag;
use bytes::Bytes;
use std::fmt;
use std::io;

/// Transport-assigned handle for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub usize);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Hints attached to accepted calls and writes.
///
/// Hints are advisory. A transport may ignore them without changing which
/// completions it reports; the mio transport flushes every write eagerly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// The transport may buffer the write instead of flushing it eagerly.
    pub buffer_hint: bool,
}

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags { buffer_hint: false };
    pub const BUFFER_HINT: WriteFlags = WriteFlags { buffer_hint: true };
}

/// One inbound or outbound message, held as a sequence of byte chunks.
///
/// Cloning is cheap: chunks are reference counted, so the driver can hand
/// the transport the same message it validated. Transports copy the bytes
/// into their own output buffers as they see fit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    chunks: Vec<Bytes>,
}

impl Message {
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self { chunks }
    }

    /// Iterate over the message's chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.chunks.iter().map(|c| c.as_ref())
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Self {
            chunks: vec![bytes],
        }
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Bytes::from(data).into()
    }
}

/// Final status codes a call can be closed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    ResourceExhausted,
    Internal,
}

impl StatusCode {
    /// Numeric code as written on the wire.
    pub fn as_u32(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::InvalidArgument => 3,
            StatusCode::ResourceExhausted => 8,
            StatusCode::Internal => 13,
        }
    }
}

/// Status sent by the server to close a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub details: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            details: None,
        }
    }

    pub fn new(code: StatusCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: Some(details.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Outcome of an asynchronous write or status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    Error,
}

/// Per-call completion kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// An armed accept slot was matched with a new call.
    CallNew,
    /// The previous `start_write` completed.
    WriteAccepted(OpResult),
    /// A read completed. `None` means the client finished sending.
    Read(Option<Message>),
    /// The status write completed.
    FinishAccepted(OpResult),
    /// The call is fully closed.
    Finished(Status),
}

impl CallEvent {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::CallNew => "call-new",
            CallEvent::WriteAccepted(_) => "write-accepted",
            CallEvent::Read(Some(_)) => "read",
            CallEvent::Read(None) => "read-end",
            CallEvent::FinishAccepted(_) => "finish-accepted",
            CallEvent::Finished(_) => "finished",
        }
    }
}

/// An entry popped from the completion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Completion for one call, carrying the tag the operation was issued with.
    Call {
        call: CallId,
        tag: CallTag,
        kind: CallEvent,
    },
    /// The queue was shut down; no further events follow.
    QueueShutdown,
}

/// Reasons the transport refuses to start an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// No such call.
    UnknownCall(CallId),
    /// The call has not been accepted yet.
    NotAccepted,
    /// `accept_call` was already issued for this call.
    AlreadyAccepted,
    /// A read or write of the same kind is still pending.
    TooManyOperations,
    /// Status was already written; no more operations are allowed.
    AlreadyFinished,
    /// The server is not started or has been shut down.
    NotServing,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::UnknownCall(call) => write!(f, "unknown call {call}"),
            CallError::NotAccepted => write!(f, "call not accepted"),
            CallError::AlreadyAccepted => write!(f, "call already accepted"),
            CallError::TooManyOperations => write!(f, "too many pending operations"),
            CallError::AlreadyFinished => write!(f, "call already finished"),
            CallError::NotServing => write!(f, "server is not serving"),
        }
    }
}

impl std::error::Error for CallError {}

/// Completion-queue call transport.
///
/// Every `start_*` method only enqueues the operation; its outcome arrives
/// later as an `Event` tagged with the same `CallTag`.
pub trait Transport {
    /// Arm one accept slot. The next new call is reported with `tag`.
    fn request_call(&mut self, tag: CallTag) -> Result<(), CallError>;

    /// Accept a call reported by `CallEvent::CallNew`.
    fn accept_call(&mut self, call: CallId, tag: CallTag, flags: WriteFlags)
        -> Result<(), CallError>;

    /// Read the next inbound message.
    fn start_read(&mut self, call: CallId, tag: CallTag) -> Result<(), CallError>;

    /// Write one message. At most one write may be pending per call.
    fn start_write(
        &mut self,
        call: CallId,
        message: Message,
        tag: CallTag,
        flags: WriteFlags,
    ) -> Result<(), CallError>;

    /// Write the final status, closing the server side of the call.
    fn start_write_status(
        &mut self,
        call: CallId,
        status: Status,
        tag: CallTag,
    ) -> Result<(), CallError>;

    /// Release the call. No events for it may be delivered afterwards.
    fn destroy_call(&mut self, call: CallId);

    /// Block until the next completion is available.
    fn next_event(&mut self) -> io::Result<Event>;

    /// Hand an event back once the driver has finished with it.
    fn finish_event(&mut self, event: Event) {
        drop(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_chunks() {
        let message = Message::from_chunks(vec![
            Bytes::from_static(b"ab"),
            Bytes::new(),
            Bytes::from_static(b"cde"),
        ]);
        assert_eq!(message.len(), 5);
        assert!(!message.is_empty());
        let joined: Vec<u8> = message.chunks().flatten().copied().collect();
        assert_eq!(joined, b"abcde");
    }

    #[test]
    fn test_status() {
        assert!(Status::ok().is_ok());
        let status = Status::new(StatusCode::Cancelled, "peer reset");
        assert!(!status.is_ok());
        assert_eq!(status.code.as_u32(), 1);
        assert_eq!(status.details.as_deref(), Some("peer reset"));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(CallEvent::Read(None).name(), "read-end");
        assert_eq!(CallEvent::Read(Some(Message::default())).name(), "read");
        assert_eq!(CallEvent::Finished(Status::ok()).name(), "finished");
    }
}
