//! Echo call framing.

use crate::runtime::transport::Status;
use bytes::{BufMut, BytesMut};

/// Longest accepted length line, excluding `\r\n`.
pub const MAX_HEADER_LEN: usize = 20;

/// Parsed inbound frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// One message follows (header consumed, data follows).
    Message {
        /// Length of the message payload.
        length: usize,
        /// Bytes consumed by the header (length + \r\n).
        header_len: usize,
    },
    /// Client is done sending.
    Quit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed header.
    Complete(Command),
    /// Need more data for header.
    Incomplete,
    /// Invalid length format.
    InvalidLength,
}

/// Parse a frame header from the input buffer.
///
/// For `Message` headers the caller must wait until `header_len + length`
/// bytes are buffered before taking the payload.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN + 1 => return ParseResult::InvalidLength,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];

    if line.eq_ignore_ascii_case(b"QUIT") {
        return ParseResult::Complete(Command::Quit);
    }

    if line.is_empty() || line.len() > MAX_HEADER_LEN || !line.iter().all(u8::is_ascii_digit) {
        return ParseResult::InvalidLength;
    }

    let length: usize = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };

    ParseResult::Complete(Command::Message {
        length,
        header_len: line_end + 2,
    })
}

/// Append a message header for a payload of `length` bytes.
pub fn encode_message_header(length: usize, output: &mut BytesMut) {
    output.put_slice(format!("{length}\r\n").as_bytes());
}

/// Append the status line that closes a call.
///
/// `OK\r\n` on success, `ERROR <code> <details>\r\n` otherwise.
pub fn encode_status(status: &Status, output: &mut BytesMut) {
    if status.is_ok() {
        output.put_slice(b"OK\r\n");
        return;
    }
    let details = status
        .details
        .as_deref()
        .unwrap_or("")
        .replace(['\r', '\n'], " ");
    output.put_slice(format!("ERROR {} {}\r\n", status.code.as_u32(), details).as_bytes());
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::StatusCode;

    #[test]
    fn test_parse_message() {
        match parse(b"100\r\n") {
            ParseResult::Complete(Command::Message { length, header_len }) => {
                assert_eq!(length, 100);
                assert_eq!(header_len, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_zero_length() {
        assert!(matches!(
            parse(b"0\r\n"),
            ParseResult::Complete(Command::Message {
                length: 0,
                header_len: 3
            })
        ));
    }

    #[test]
    fn test_parse_quit() {
        match parse(b"quit\r\n") {
            ParseResult::Complete(Command::Quit) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        match parse(b"100") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_length() {
        for input in [&b"abc\r\n"[..], b"-1\r\n", b"+5\r\n", b"\r\n"] {
            assert!(
                matches!(parse(input), ParseResult::InvalidLength),
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_overlong_header() {
        assert!(matches!(
            parse(b"1234567890123456789012345"),
            ParseResult::InvalidLength
        ));
        assert!(matches!(
            parse(b"99999999999999999999999\r\n"),
            ParseResult::InvalidLength
        ));
    }

    #[test]
    fn test_message_header() {
        let mut buf = BytesMut::new();
        encode_message_header(12345, &mut buf);
        assert_eq!(&buf[..], b"12345\r\n");
    }

    #[test]
    fn test_status_lines() {
        let mut buf = BytesMut::new();
        encode_status(&Status::ok(), &mut buf);
        assert_eq!(&buf[..], b"OK\r\n");

        buf.clear();
        encode_status(
            &Status::new(StatusCode::InvalidArgument, "bad\r\nframe"),
            &mut buf,
        );
        assert_eq!(&buf[..], b"ERROR 3 bad  frame\r\n");
    }
}
