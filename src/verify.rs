//! Classification and verification of console response lines

use core::fmt;

use crate::codec::{parse_fixed_hex, ParseError};
use crate::protocol::{
    CHUNK_SIZE, DEFAULT_PROMPT, DUMP_PREFIX, DWORD_OFFSETS, FIELD_WIDTH, RECORD_LEN, WRITE_PREFIX,
};

/// Image bytes covered by one write/verify cycle
pub type Chunk = [u8; CHUNK_SIZE];

/// Dword `index` of a chunk as the device prints it in a `md.l` dump
pub fn chunk_dword(chunk: &Chunk, index: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&chunk[index * 4..index * 4 + 4]);
    u32::from_le_bytes(word)
}

/// Record field that failed verification
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Field {
    Address,
    Dword(usize),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Field::Address => write!(f, "address"),
            Field::Dword(i) => write!(f, "dword {}", i),
        }
    }
}

/// Disagreement between a data record and the expected state
#[derive(Clone, PartialEq, Debug)]
pub struct Mismatch {
    pub field: Field,
    pub expected: u32,
    /// `None` when the field could not be parsed
    pub found: Option<u32>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.found {
            Some(v) => write!(
                f,
                "incorrect {}, expected 0x{:08X}, got 0x{:08X}",
                self.field, self.expected, v
            ),
            None => write!(
                f,
                "unparseable {}, expected 0x{:08X}",
                self.field, self.expected
            ),
        }
    }
}

/// Line that cannot be a data record
#[derive(Clone, PartialEq, Debug)]
pub enum Malformed {
    /// Not an echo and not `RECORD_LEN` characters long
    Length(usize),
    /// Address field is not hex
    Address(ParseError),
}

/// Result of classifying one response line
#[derive(Clone, PartialEq, Debug)]
pub enum Response {
    /// Empty line, command echo or prompt
    Ignore,
    /// Record matched, carrying the advanced cursor
    Verified(u32),
    Mismatch(Mismatch),
    Malformed(Malformed),
}

impl Response {
    /// Whether this outcome must abort the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Response::Mismatch(_) | Response::Malformed(_))
    }
}

/// Classifies lines against the expected cursor and chunk contents
#[derive(Clone, Debug)]
pub struct Verifier<'a> {
    /// Device prompt, lines starting with it are echoes
    pub prompt: &'a str,
    /// Only check the record address, not the data
    pub address_only: bool,
}

impl<'a> Default for Verifier<'a> {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT,
            address_only: false,
        }
    }
}

impl<'a> Verifier<'a> {
    pub fn is_echo(&self, line: &str) -> bool {
        line.starts_with(WRITE_PREFIX)
            || line.starts_with(DUMP_PREFIX)
            || (!self.prompt.is_empty() && line.starts_with(self.prompt))
    }

    /// Classify a response line given the address cursor and the chunk just written
    pub fn classify(&self, line: &str, cursor: u32, expected: &Chunk) -> Response {
        if line.is_empty() || self.is_echo(line) {
            return Response::Ignore;
        }

        // Lines are assembled one char per received byte
        let len = line.chars().count();
        if len != RECORD_LEN {
            return Response::Malformed(Malformed::Length(len));
        }

        let bytes = line.as_bytes();

        let address = match parse_fixed_hex(&bytes[..FIELD_WIDTH], FIELD_WIDTH) {
            Ok(a) => a,
            Err(e) => return Response::Malformed(Malformed::Address(e)),
        };
        if address != cursor {
            return Response::Mismatch(Mismatch {
                field: Field::Address,
                expected: cursor,
                found: Some(address),
            });
        }

        if !self.address_only {
            for (i, offset) in DWORD_OFFSETS.iter().enumerate() {
                let expected = chunk_dword(expected, i);
                let found = parse_fixed_hex(&bytes[*offset..*offset + FIELD_WIDTH], FIELD_WIDTH).ok();

                if found != Some(expected) {
                    return Response::Mismatch(Mismatch {
                        field: Field::Dword(i),
                        expected,
                        found,
                    });
                }
            }
        }

        Response::Verified(cursor.wrapping_add(CHUNK_SIZE as u32))
    }
}

/// Classify with the default prompt and full data verification
pub fn classify(line: &str, cursor: u32, expected: &Chunk) -> Response {
    Verifier::default().classify(line, cursor, expected)
}
