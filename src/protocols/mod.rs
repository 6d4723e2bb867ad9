//! Wire protocols spoken by the loopback transport.
//!
//! - `echo`: length-prefixed call framing with a closing status line

pub mod echo;
