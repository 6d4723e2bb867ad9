//! Echo call wire format.
//!
//! Each TCP connection carries exactly one call. The client streams
//! length-prefixed messages and the server echoes every one back, then
//! closes the call with a status line:
//!
//! ```text
//! Client:  <length>\r\n<data of exactly length bytes>   (repeated)
//!          QUIT\r\n  or half-close                       (end of input)
//! Server:  <length>\r\n<data of exactly length bytes>   (one per message)
//!          OK\r\n  or  ERROR <code> <details>\r\n        (status)
//!
//! Example:
//! Client:  3\r\n<00 01 02>2\r\n<03 04>QUIT\r\n
//! Server:  3\r\n<00 01 02>2\r\n<03 04>OK\r\n
//! ```

pub mod parser;
