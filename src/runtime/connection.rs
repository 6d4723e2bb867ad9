//! Per-connection call state for the loopback transport.
//!
//! A `Connection` turns raw inbound bytes and flushed outbound bytes into
//! call completions. It does no I/O itself: the event loop feeds it what the
//! socket produced and drains what it wants written, then asks it which
//! pending operations have completed.

use crate::protocols::echo::parser::{self, Command, ParseResult};
use crate::runtime::token::CallTag;
use crate::runtime::transport::{CallError, CallEvent, Message, OpResult, Status, StatusCode};
use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

/// Initial capacity of the inbound and outbound buffers.
const BUFFER_SIZE: usize = 16 * 1024;

/// Write operation awaiting its bytes being flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingWrite {
    Message,
    Status,
}

/// Call state for a single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Tag given at accept time; completions are reported with it.
    tag: Option<CallTag>,
    read_pending: bool,
    write_pending: Option<PendingWrite>,
    /// Bytes received but not yet returned as messages.
    inbound: BytesMut,
    /// Bytes queued for the socket.
    outbound: BytesMut,
    /// No further messages will be returned.
    input_closed: bool,
    /// Peer half-closed its side.
    peer_eof: bool,
    /// Status has been queued; no further operations allowed.
    status: Option<Status>,
    /// The connection failed; pending and future operations fail.
    broken: Option<Status>,
    finished: bool,
    max_message_size: usize,
}

impl Connection {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            tag: None,
            read_pending: false,
            write_pending: None,
            inbound: BytesMut::with_capacity(BUFFER_SIZE),
            outbound: BytesMut::with_capacity(BUFFER_SIZE),
            input_closed: false,
            peer_eof: false,
            status: None,
            broken: None,
            finished: false,
            max_message_size,
        }
    }

    /// Tag the call was accepted with, if any.
    pub fn tag(&self) -> Option<CallTag> {
        self.tag
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    pub fn accept(&mut self, tag: CallTag) -> Result<(), CallError> {
        if self.tag.is_some() {
            return Err(CallError::AlreadyAccepted);
        }
        self.tag = Some(tag);
        Ok(())
    }

    pub fn start_read(&mut self) -> Result<(), CallError> {
        self.check_open()?;
        if self.read_pending {
            return Err(CallError::TooManyOperations);
        }
        self.read_pending = true;
        Ok(())
    }

    pub fn start_write(&mut self, message: &Message) -> Result<(), CallError> {
        self.check_writable()?;
        if self.broken.is_none() {
            parser::encode_message_header(message.len(), &mut self.outbound);
            for chunk in message.chunks() {
                self.outbound.put_slice(chunk);
            }
        }
        self.write_pending = Some(PendingWrite::Message);
        Ok(())
    }

    pub fn start_write_status(&mut self, status: Status) -> Result<(), CallError> {
        self.check_writable()?;
        if self.broken.is_none() {
            parser::encode_status(&status, &mut self.outbound);
        }
        self.status = Some(status);
        self.write_pending = Some(PendingWrite::Status);
        Ok(())
    }

    fn check_open(&self) -> Result<(), CallError> {
        if self.tag.is_none() {
            return Err(CallError::NotAccepted);
        }
        if self.status.is_some() {
            return Err(CallError::AlreadyFinished);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), CallError> {
        self.check_open()?;
        if self.write_pending.is_some() {
            return Err(CallError::TooManyOperations);
        }
        Ok(())
    }

    /// Whether more socket input may be buffered.
    ///
    /// Input stops once a whole maximum-size frame could already be waiting,
    /// and resumes as reads take messages off the buffer.
    pub fn wants_input(&self) -> bool {
        self.inbound.len() < self.max_message_size + parser::MAX_HEADER_LEN + 2
    }

    /// Buffer for bytes read from the socket.
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Bytes waiting to be written to the socket.
    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    /// Mark `n` outbound bytes as written.
    pub fn consume_outbound(&mut self, n: usize) {
        self.outbound.advance(n);
    }

    /// The peer will send nothing more.
    pub fn peer_closed(&mut self) {
        self.peer_eof = true;
    }

    /// The connection failed. Queued output is dropped and every pending
    /// or later operation fails.
    pub fn fail(&mut self, status: Status) {
        if self.broken.is_none() {
            self.outbound.clear();
            self.broken = Some(status);
        }
    }

    /// Status fully flushed: the write side can be shut down.
    pub fn status_flushed(&self) -> bool {
        self.status.is_some() && self.broken.is_none() && self.outbound.is_empty()
    }

    /// Append every completion that is now ready, in completion order.
    ///
    /// Nothing completes before the call is accepted.
    pub fn poll_completions(&mut self, out: &mut Vec<CallEvent>) {
        if self.tag.is_none() {
            return;
        }

        if self.read_pending {
            if let Some(read) = self.try_read() {
                self.read_pending = false;
                out.push(CallEvent::Read(read));
            }
        }

        if self.write_pending.is_some() && (self.outbound.is_empty() || self.broken.is_some()) {
            let result = if self.broken.is_some() {
                OpResult::Error
            } else {
                OpResult::Ok
            };
            match self.write_pending.take() {
                Some(PendingWrite::Message) => out.push(CallEvent::WriteAccepted(result)),
                Some(PendingWrite::Status) => out.push(CallEvent::FinishAccepted(result)),
                None => {}
            }
        }

        if !self.finished {
            let closed = match (&self.broken, &self.status) {
                (Some(reason), _) => Some(reason.clone()),
                (None, Some(status)) if self.status_flushed() => Some(status.clone()),
                _ => None,
            };
            if let Some(status) = closed {
                self.finished = true;
                out.push(CallEvent::Finished(status));
            }
        }
    }

    /// Next read result, or `None` if the read cannot complete yet.
    fn try_read(&mut self) -> Option<Option<Message>> {
        if self.input_closed || self.broken.is_some() {
            self.input_closed = true;
            return Some(None);
        }

        match parser::parse(&self.inbound) {
            ParseResult::Complete(Command::Message { length, header_len }) => {
                if length > self.max_message_size {
                    warn!(length, max = self.max_message_size, "Message too large");
                    self.fail(Status::new(StatusCode::ResourceExhausted, "message too large"));
                    self.input_closed = true;
                    return Some(None);
                }
                if self.inbound.len() < header_len + length {
                    return self.end_of_input_if_eof();
                }
                self.inbound.advance(header_len);
                let payload = self.inbound.split_to(length).freeze();
                Some(Some(Message::from(payload)))
            }
            ParseResult::Complete(Command::Quit) => {
                self.inbound.clear();
                self.input_closed = true;
                Some(None)
            }
            ParseResult::Incomplete => self.end_of_input_if_eof(),
            ParseResult::InvalidLength => {
                warn!("Invalid message header");
                self.fail(Status::new(StatusCode::InvalidArgument, "invalid message header"));
                self.input_closed = true;
                Some(None)
            }
        }
    }

    fn end_of_input_if_eof(&mut self) -> Option<Option<Message>> {
        if !self.peer_eof {
            return None;
        }
        if !self.inbound.is_empty() {
            self.fail(Status::new(StatusCode::Cancelled, "client closed mid-message"));
        }
        self.input_closed = true;
        Some(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::call::CallState;
    use crate::runtime::token::CallTable;

    fn accepted() -> Connection {
        let mut table = CallTable::new(1);
        let mut conn = Connection::new(1024);
        conn.accept(table.insert(CallState::new())).unwrap();
        conn
    }

    fn completions(conn: &mut Connection) -> Vec<CallEvent> {
        let mut out = Vec::new();
        conn.poll_completions(&mut out);
        out
    }

    fn drain(conn: &mut Connection) -> Vec<u8> {
        let data = conn.outbound().to_vec();
        conn.consume_outbound(data.len());
        data
    }

    #[test]
    fn test_operations_require_accept() {
        let mut conn = Connection::new(1024);
        assert_eq!(conn.start_read(), Err(CallError::NotAccepted));
        assert_eq!(
            conn.start_write(&Message::default()),
            Err(CallError::NotAccepted)
        );
        conn.inbound_mut().extend_from_slice(b"1\r\nx");
        assert!(completions(&mut conn).is_empty());
    }

    #[test]
    fn test_accept_twice() {
        let mut conn = accepted();
        let tag = conn.tag().unwrap();
        assert_eq!(conn.accept(tag), Err(CallError::AlreadyAccepted));
    }

    #[test]
    fn test_read_waits_for_whole_message() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        assert_eq!(conn.start_read(), Err(CallError::TooManyOperations));

        conn.inbound_mut().extend_from_slice(b"4\r\nab");
        assert!(completions(&mut conn).is_empty());

        conn.inbound_mut().extend_from_slice(b"cd3\r\n");
        let events = completions(&mut conn);
        assert_eq!(
            events,
            vec![CallEvent::Read(Some(Message::from(b"abcd".to_vec())))]
        );

        // The next frame's header stays buffered for the next read.
        conn.start_read().unwrap();
        conn.inbound_mut().extend_from_slice(b"xyz");
        assert_eq!(
            completions(&mut conn),
            vec![CallEvent::Read(Some(Message::from(b"xyz".to_vec())))]
        );
    }

    #[test]
    fn test_quit_ends_input() {
        let mut conn = accepted();
        conn.inbound_mut().extend_from_slice(b"QUIT\r\n");
        conn.start_read().unwrap();
        assert_eq!(completions(&mut conn), vec![CallEvent::Read(None)]);
        assert!(!conn.is_broken());
    }

    #[test]
    fn test_clean_eof_ends_input() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        conn.peer_closed();
        assert_eq!(completions(&mut conn), vec![CallEvent::Read(None)]);
        assert!(!conn.is_broken());
    }

    #[test]
    fn test_eof_mid_message_cancels_call() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        conn.inbound_mut().extend_from_slice(b"10\r\n12345");
        conn.peer_closed();

        let events = completions(&mut conn);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], CallEvent::Read(None));
        assert!(matches!(
            &events[1],
            CallEvent::Finished(status) if status.code == StatusCode::Cancelled
        ));
    }

    #[test]
    fn test_invalid_header_breaks_call() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        conn.inbound_mut().extend_from_slice(b"nope\r\n");

        let events = completions(&mut conn);
        assert_eq!(events[0], CallEvent::Read(None));
        assert!(matches!(
            &events[1],
            CallEvent::Finished(status) if status.code == StatusCode::InvalidArgument
        ));

        // Status write still completes, but as a failure.
        conn.start_write_status(Status::ok()).unwrap();
        assert!(conn.outbound().is_empty());
        assert_eq!(
            completions(&mut conn),
            vec![CallEvent::FinishAccepted(OpResult::Error)]
        );
    }

    #[test]
    fn test_oversized_message_breaks_call() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        conn.inbound_mut().extend_from_slice(b"2048\r\n");

        let events = completions(&mut conn);
        assert_eq!(events[0], CallEvent::Read(None));
        assert!(matches!(
            &events[1],
            CallEvent::Finished(status) if status.code == StatusCode::ResourceExhausted
        ));
    }

    #[test]
    fn test_input_limited_to_one_full_frame() {
        let mut conn = accepted();
        let mut framed = b"1000\r\n".to_vec();
        framed.extend_from_slice(&[0u8; 1000]);

        let mut frames = 0;
        while conn.wants_input() {
            conn.inbound_mut().extend_from_slice(&framed);
            frames += 1;
        }
        assert_eq!(frames, 2);

        conn.start_read().unwrap();
        assert!(matches!(
            completions(&mut conn).as_slice(),
            [CallEvent::Read(Some(message))] if message.len() == 1000
        ));
        assert!(conn.wants_input());
    }

    #[test]
    fn test_write_accepted_after_flush() {
        let mut conn = accepted();
        conn.start_write(&Message::from(b"hey".to_vec())).unwrap();
        assert_eq!(
            conn.start_write(&Message::default()),
            Err(CallError::TooManyOperations)
        );
        assert!(completions(&mut conn).is_empty());

        conn.consume_outbound(3);
        assert!(completions(&mut conn).is_empty());

        assert_eq!(drain(&mut conn), b"hey");
        assert_eq!(
            completions(&mut conn),
            vec![CallEvent::WriteAccepted(OpResult::Ok)]
        );
    }

    #[test]
    fn test_status_completes_call() {
        let mut conn = accepted();
        conn.start_write_status(Status::ok()).unwrap();
        assert_eq!(conn.start_read(), Err(CallError::AlreadyFinished));
        assert!(!conn.status_flushed());

        assert_eq!(drain(&mut conn), b"OK\r\n");
        assert!(conn.status_flushed());
        assert_eq!(
            completions(&mut conn),
            vec![
                CallEvent::FinishAccepted(OpResult::Ok),
                CallEvent::Finished(Status::ok())
            ]
        );
        assert!(completions(&mut conn).is_empty());
    }

    #[test]
    fn test_failure_completes_pending_operations_once() {
        let mut conn = accepted();
        conn.start_read().unwrap();
        conn.start_write(&Message::from(b"abc".to_vec())).unwrap();
        conn.fail(Status::new(StatusCode::Cancelled, "reset"));
        assert!(conn.outbound().is_empty());

        let events = completions(&mut conn);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], CallEvent::Read(None));
        assert_eq!(events[1], CallEvent::WriteAccepted(OpResult::Error));
        assert!(matches!(&events[2], CallEvent::Finished(s) if s.code == StatusCode::Cancelled));

        assert!(completions(&mut conn).is_empty());
    }
}
