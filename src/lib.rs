//! echo-call-server: an echo server driven by a completion-queue call
//! lifecycle.
//!
//! Every accepted call is read message by message; each message is checked
//! against the echo workload pattern (byte `n` of the call equals
//! `n mod 256`) and written straight back. When the client finishes sending,
//! the server closes the call with an OK status.

pub mod config;
pub mod protocols;
pub mod runtime;
