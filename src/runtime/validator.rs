//! Echo workload validation.
//!
//! The paired client sends a stream where byte `n` of the call (counted from
//! the first byte of the first message) equals `n mod 256`. Every inbound
//! message is checked against that law before it is echoed.

use std::fmt;

/// First byte that broke the echo workload pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Offset from the start of the call.
    pub offset: u64,
    pub expected: u8,
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "byte {} of call is {:#04x}, expected {:#04x}",
            self.offset, self.actual, self.expected
        )
    }
}

impl std::error::Error for Mismatch {}

/// Expected value of the byte at call offset `n`.
#[inline]
pub fn expected_byte(offset: u64) -> u8 {
    (offset % 256) as u8
}

/// Validate one message's chunks, advancing `bytes_read` past every byte
/// that matched.
///
/// On mismatch `bytes_read` is left at the offending offset.
pub fn validate<'a, I>(bytes_read: &mut u64, chunks: I) -> Result<(), Mismatch>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    for chunk in chunks {
        for &actual in chunk {
            let expected = expected_byte(*bytes_read);
            if actual != expected {
                return Err(Mismatch {
                    offset: *bytes_read,
                    expected,
                    actual,
                });
            }
            *bytes_read += 1;
        }
    }
    Ok(())
}
