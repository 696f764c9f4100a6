//! U-Boot console commands and data-record layout

use core::fmt;

/// Console line terminator, appended on transmission
pub const LINE_FEED: &str = "\r";

/// RAM address images are staged at on the reference device
pub const FLASH_ADDRESS: u32 = 0x0108_0000;

/// Erase/program granularity of the reference device
pub const BLOCK_SIZE: usize = 2048;

/// Bytes written and verified per cycle
pub const CHUNK_SIZE: usize = 16;

/// Bytes written per `mw.q` command
pub const QUAD_SIZE: usize = 8;

/// Dwords requested per `md.l` dump
pub const DUMP_WORDS: u32 = 4;

/// Length of a `md.l` data record: `aaaaaaaa: dddddddd dddddddd dddddddd dddddddd    <16 ascii>`
pub const RECORD_LEN: usize = 65;

/// Width of hex fields in a data record
pub const FIELD_WIDTH: usize = 8;

/// Character offsets of the dword fields in a data record
pub const DWORD_OFFSETS: [usize; 4] = [10, 19, 28, 37];

/// Echoed command prefixes, never parsed as data
pub const WRITE_PREFIX: &str = "mw.q";
pub const DUMP_PREFIX: &str = "md.l";

/// Prompt printed by the reference device
pub const DEFAULT_PROMPT: &str = "axg_s420_v1_gva#";

/// Partition images are committed to
pub const DEFAULT_PARTITION: &str = "system";

/// Console commands, rendered via `Display` without terminator
#[derive(Debug, PartialEq, Clone)]
pub enum Command<'a> {
    /// Write one 64-bit word to memory
    WriteQuad { address: u32, value: u64 },

    /// Dump `count` 32-bit words starting at an address
    Dump { address: u32, count: u32 },

    /// Erase a NAND partition
    Erase { partition: &'a str },

    /// Write `size` bytes from RAM at `address` to a NAND partition
    WriteStorage {
        address: u32,
        partition: &'a str,
        size: u32,
    },

    /// Reset the device
    Reboot,
}

impl<'a> Command<'a> {
    /// Quad-word write of 8 image bytes, packed in the little-endian order the device stores
    pub fn write_quad(address: u32, bytes: [u8; QUAD_SIZE]) -> Self {
        Command::WriteQuad {
            address,
            value: u64::from_le_bytes(bytes),
        }
    }
}

impl<'a> fmt::Display for Command<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::WriteQuad { address, value } => write!(f, "mw.q {:X} {:016X}", address, value),
            Command::Dump { address, count } => write!(f, "md.l {:X} {:X}", address, count),
            Command::Erase { partition } => write!(f, "nand erase.part {}", partition),
            Command::WriteStorage {
                address,
                partition,
                size,
            } => write!(f, "nand write {:X} {} {:X}", address, partition, size),
            Command::Reboot => write!(f, "reboot"),
        }
    }
}
