//! mio-based call transport.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS),
//! presented to the driver as a completion queue.

mod event_loop;

pub use event_loop::{CompletionQueue, Server, ServerConfig};
