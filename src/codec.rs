//! Fixed-width hexadecimal fields as printed by the console

use thiserror::Error;

/// Errors parsing a fixed-width hex field
#[derive(Clone, PartialEq, Debug, Error)]
pub enum ParseError {
    /// Field is not exactly the expected number of characters
    #[error("expected {expected} hex characters, found {found}")]
    InvalidLength { expected: usize, found: usize },

    /// Requested width cannot be represented in a u32
    #[error("unsupported field width {0}")]
    InvalidWidth(usize),

    /// Field contains a non-hex character
    #[error("invalid hex digit: {0}")]
    InvalidDigit(hex::FromHexError),
}

/// Parse exactly `width` hex characters (most significant nibble first) into a u32.
///
/// Accepts `&str` or raw console bytes. Both upper and lower case digits are
/// accepted, prefixes (`0x`, `+`) and whitespace are not. `width` must be
/// between 1 and 8.
pub fn parse_fixed_hex<T: AsRef<[u8]>>(text: T, width: usize) -> Result<u32, ParseError> {
    let text = text.as_ref();

    if width == 0 || width > 8 {
        return Err(ParseError::InvalidWidth(width));
    }

    if text.len() != width {
        return Err(ParseError::InvalidLength {
            expected: width,
            found: text.len(),
        });
    }

    // Left-pad with zero nibbles to a full word so any width decodes by byte
    let mut digits = [b'0'; 8];
    digits[8 - width..].copy_from_slice(text);

    let mut buff = [0u8; 4];
    hex::decode_to_slice(&digits, &mut buff).map_err(ParseError::InvalidDigit)?;

    Ok(u32::from_be_bytes(buff))
}
