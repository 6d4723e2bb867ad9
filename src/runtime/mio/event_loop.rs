//! mio-backed completion queue and call server.
//!
//! Readiness-based model underneath, completion-based model on top: poll
//! tells us when sockets are ready, we perform non-blocking reads and writes,
//! and each `Connection` reports which call operations those bytes completed.
//! Completions wait in a FIFO until `next_event` hands them to the driver.
//! Uses epoll on Linux, kqueue on macOS.

use crate::runtime::connection::Connection;
use crate::runtime::token::CallTag;
use crate::runtime::transport::{
    CallError, CallEvent, CallId, Event, Message, Status, StatusCode, Transport, WriteFlags,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Size of each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Readiness events fetched per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Queue of finished operations, fed by polling sockets.
pub struct CompletionQueue {
    poll: Poll,
    events: Events,
    ready: VecDeque<Event>,
}

impl CompletionQueue {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: VecDeque::new(),
        })
    }

    fn push(&mut self, event: Event) {
        self.ready.push_back(event);
    }

    fn pop(&mut self) -> Option<Event> {
        self.ready.pop_front()
    }
}

/// Socket and call state for one client.
struct MioConnection {
    stream: TcpStream,
    call: Connection,
    /// Write side (or both sides, once broken) already shut down.
    shut_down: bool,
    /// Socket reads stopped with input possibly left in the kernel buffer.
    input_paused: bool,
}

/// Server options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

/// TCP call server that reports call progress through a `CompletionQueue`.
pub struct Server {
    queue: CompletionQueue,
    listener: Option<TcpListener>,
    connections: Slab<MioConnection>,
    /// Accept slots waiting for a client, oldest first.
    armed: VecDeque<CallTag>,
    /// Clients waiting for an accept slot, oldest first.
    backlog: VecDeque<usize>,
    serving: bool,
    config: ServerConfig,
}

impl Server {
    pub fn new(queue: CompletionQueue, config: ServerConfig) -> Self {
        Self {
            queue,
            listener: None,
            connections: Slab::new(),
            armed: VecDeque::new(),
            backlog: VecDeque::new(),
            serving: false,
            config,
        }
    }

    /// Bind the listening socket and return the address actually bound,
    /// which differs from `addr` when an ephemeral port was requested.
    pub fn bind(&mut self, addr: &str) -> io::Result<SocketAddr> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
        })?;
        let listener = TcpListener::from_std(create_listener(addr)?);
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Start accepting clients.
    pub fn start(&mut self) -> io::Result<()> {
        let listener = self.listener.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "server is not bound")
        })?;
        self.queue
            .poll
            .registry()
            .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.serving = true;
        Ok(())
    }

    /// Stop accepting clients and post `QueueShutdown`.
    ///
    /// Calls already in progress keep their connections until destroyed.
    pub fn shutdown(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.queue.poll.registry().deregister(&mut listener);
        }
        if self.serving {
            self.serving = false;
            self.armed.clear();
            self.queue.push(Event::QueueShutdown);
            info!("Server shut down");
        }
    }

    /// Live client connections, accepted or waiting for a slot.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn connection(&mut self, call: CallId) -> Result<&mut MioConnection, CallError> {
        self.connections
            .get_mut(call.0)
            .ok_or(CallError::UnknownCall(call))
    }

    /// Wait until at least one socket is ready, or `timeout` passes, and
    /// process what is ready.
    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.queue.poll.poll(&mut self.queue.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let ready: Vec<(Token, bool, bool)> = self
            .queue
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections()?,
                Token(conn_id) => self.handle_connection_event(conn_id, readable, writable),
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            let listener = match self.listener.as_ref() {
                Some(listener) => listener,
                None => return Ok(()),
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let conn_id = self.connections.insert(MioConnection {
                        stream,
                        call: Connection::new(self.config.max_message_size),
                        shut_down: false,
                        input_paused: false,
                    });

                    // Re-borrow after insert
                    let conn = &mut self.connections[conn_id];
                    self.queue.poll.registry().register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE | Interest::WRITABLE,
                    )?;

                    debug!(conn_id, peer = %peer_addr, "Accepted connection");

                    match self.armed.pop_front() {
                        Some(tag) => self.post_call_new(conn_id, tag),
                        None => self.backlog.push_back(conn_id),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    // Readiness is edge-triggered: clients still queued
                    // would otherwise wait for the next new connection.
                    self.rearm_listener()?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Re-register the listener so pending clients are reported again on
    /// the next poll.
    fn rearm_listener(&mut self) -> io::Result<()> {
        if let Some(listener) = self.listener.as_mut() {
            self.queue
                .poll
                .registry()
                .reregister(listener, LISTENER_TOKEN, Interest::READABLE)?;
        }
        Ok(())
    }

    fn post_call_new(&mut self, conn_id: usize, tag: CallTag) {
        self.queue.push(Event::Call {
            call: CallId(conn_id),
            tag,
            kind: CallEvent::CallNew,
        });
    }

    fn handle_connection_event(&mut self, conn_id: usize, readable: bool, writable: bool) {
        if !self.connections.contains(conn_id) {
            return;
        }
        if readable {
            self.handle_readable(conn_id);
        }
        if writable || readable {
            self.progress(conn_id);
        }
    }

    /// Drain the socket into the call's inbound buffer, stopping early once
    /// the call has enough input buffered.
    fn handle_readable(&mut self, conn_id: usize) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if !conn.call.wants_input() {
                conn.input_paused = true;
                break;
            }
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(conn_id, "Client finished sending");
                    conn.call.peer_closed();
                    break;
                }
                Ok(n) => conn.call.inbound_mut().extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Read error");
                    conn.call
                        .fail(Status::new(StatusCode::Cancelled, e.to_string()));
                    break;
                }
            }
        }
    }

    /// Flush queued output as far as the socket allows.
    fn flush(&mut self, conn_id: usize) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        while !conn.call.outbound().is_empty() {
            match conn.stream.write(conn.call.outbound()) {
                Ok(0) => {
                    conn.call.fail(Status::new(StatusCode::Cancelled, "write returned 0"));
                    break;
                }
                Ok(n) => conn.call.consume_outbound(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Write error");
                    conn.call
                        .fail(Status::new(StatusCode::Cancelled, e.to_string()));
                    break;
                }
            }
        }

        if conn.shut_down {
            return;
        }
        let how = if conn.call.is_broken() {
            Some(Shutdown::Both)
        } else if conn.call.status_flushed() {
            Some(Shutdown::Write)
        } else {
            None
        };
        if let Some(how) = how {
            conn.shut_down = true;
            if let Err(e) = conn.stream.shutdown(how) {
                debug!(conn_id, error = %e, "Shutdown failed");
            }
        }
    }

    /// Flush, then post every completion the connection now has ready.
    fn progress(&mut self, conn_id: usize) {
        self.flush(conn_id);
        self.resume_input(conn_id);

        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };
        let tag = match conn.call.tag() {
            Some(tag) => tag,
            None => return,
        };

        let mut completed = Vec::new();
        conn.call.poll_completions(&mut completed);
        for kind in completed {
            self.queue.push(Event::Call {
                call: CallId(conn_id),
                tag,
                kind,
            });
        }
    }

    /// Read input left in the socket while reads were paused. No new
    /// readiness event arrives for it.
    fn resume_input(&mut self, conn_id: usize) {
        match self.connections.get_mut(conn_id) {
            Some(conn) if conn.input_paused && conn.call.wants_input() => {
                conn.input_paused = false;
            }
            _ => return,
        }
        self.handle_readable(conn_id);
    }
}

impl Transport for Server {
    fn request_call(&mut self, tag: CallTag) -> Result<(), CallError> {
        if !self.serving {
            return Err(CallError::NotServing);
        }
        match self.backlog.pop_front() {
            Some(conn_id) => self.post_call_new(conn_id, tag),
            None => self.armed.push_back(tag),
        }
        Ok(())
    }

    /// The buffer hint is accepted but writes are always flushed eagerly.
    fn accept_call(
        &mut self,
        call: CallId,
        tag: CallTag,
        _flags: WriteFlags,
    ) -> Result<(), CallError> {
        self.connection(call)?.call.accept(tag)?;
        self.progress(call.0);
        Ok(())
    }

    fn start_read(&mut self, call: CallId, _tag: CallTag) -> Result<(), CallError> {
        self.connection(call)?.call.start_read()?;
        self.progress(call.0);
        Ok(())
    }

    fn start_write(
        &mut self,
        call: CallId,
        message: Message,
        _tag: CallTag,
        _flags: WriteFlags,
    ) -> Result<(), CallError> {
        self.connection(call)?.call.start_write(&message)?;
        self.progress(call.0);
        Ok(())
    }

    fn start_write_status(
        &mut self,
        call: CallId,
        status: Status,
        _tag: CallTag,
    ) -> Result<(), CallError> {
        self.connection(call)?.call.start_write_status(status)?;
        self.progress(call.0);
        Ok(())
    }

    fn destroy_call(&mut self, call: CallId) {
        if let Some(mut conn) = self.connections.try_remove(call.0) {
            let _ = self.queue.poll.registry().deregister(&mut conn.stream);
            debug!(conn_id = call.0, "Connection closed");
        } else {
            warn!(conn_id = call.0, "Destroy for unknown call");
        }
    }

    fn next_event(&mut self) -> io::Result<Event> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Ok(event);
            }
            self.poll_once(None)?;
        }
    }
}

/// Create a non-blocking TCP listener.
///
/// An IPv6 wildcard bind also accepts IPv4 clients.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
