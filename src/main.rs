//! echo-call-server: a completion-queue echo server
//!
//! Accepts calls, echoes every message back, and aborts on the first byte
//! that breaks the echo workload pattern.
//!
//! Usage: `echo-call-server [ADDR]`. Without an address the server binds an
//! ephemeral port on the wildcard address and logs it.

use echo_call_server::config::Config;
use echo_call_server::runtime;
use std::io::IsTerminal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Colors only when stderr is a terminal and NO_COLOR is unset
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        max_message_size = config.max_message_size,
        "Starting echo-call-server"
    );

    runtime::run(config)?;
    Ok(())
}
