//! Call runtime.
//!
//! - `driver`: single-threaded call lifecycle state machine
//! - `transport`: the completion-queue interface the driver is written against
//! - `mio`: TCP implementation of that interface
//!
//! Shared pieces:
//! - `CallTable` / `CallTag`: per-call state and completion correlation
//! - `validator`: echo workload byte check
//! - `Connection`: per-connection framing and completion bookkeeping

pub mod call;
mod connection;
pub mod driver;
pub mod mio;
pub mod token;
pub mod transport;
pub mod validator;

pub use call::{CallPhase, CallState};
pub use driver::{Driver, DriverError};
pub use token::{CallTable, CallTag};

use crate::config::Config;
use self::mio::{CompletionQueue, Server, ServerConfig};
use std::io;
use tracing::info;

/// Create the queue and server, bind, start, and drive calls forever.
///
/// Returns only if startup fails.
pub fn run(config: Config) -> io::Result<()> {
    let queue = CompletionQueue::new()?;
    let mut server = Server::new(
        queue,
        ServerConfig {
            max_message_size: config.max_message_size,
        },
    );

    let addr = server.bind(&config.listen)?;
    info!(addr = %addr, "Creating server");

    server.start()?;

    Driver::new(server).run()
}
