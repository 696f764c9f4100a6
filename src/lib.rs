//! U-Boot RAM loader.
//!
//! Stages a firmware image in device RAM over the U-Boot console using
//! `mw.q` writes, verifies every 16 bytes by reading them back with `md.l`,
//! then optionally commits the verified image to NAND.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod codec;
pub mod lines;
pub mod protocol;
pub mod verify;

pub use codec::{parse_fixed_hex, ParseError};
pub use lines::LineAssembler;
pub use protocol::Command;
pub use verify::{classify, Chunk, Field, Malformed, Mismatch, Response, Verifier};

use protocol::{CHUNK_SIZE, DUMP_WORDS, LINE_FEED, QUAD_SIZE};

/// Receive buffer size for a single transport read
pub const RX_BUFF_LEN: usize = 256;

/// Serial transport, any embedded-hal byte reader/writer sharing an error type
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Session state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Writing { chunk: usize },
    AwaitingVerify { chunk: usize, retries: u32 },
    /// Every chunk of a `len` byte image was written and verified
    Completed { len: usize },
    Aborted,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("invalid image size {size} (must be a non-zero multiple of {block_size})")]
    InvalidImageSize { size: usize, block_size: usize },

    #[error("invalid block size {0} (must be a non-zero multiple of 16)")]
    InvalidBlockSize(usize),

    #[error("image of {size} bytes at 0x{base:08X} exceeds the 32-bit address space")]
    AddressOverflow { base: u32, size: usize },

    #[error("invalid result line at 0x{address:08X} ({len} characters): {line:?}")]
    InvalidLine { address: u32, len: usize, line: String },

    #[error("failed to parse address at 0x{address:08X}: {source} => {line:?}")]
    Parse {
        address: u32,
        source: ParseError,
        line: String,
    },

    #[error("{mismatch} at 0x{address:08X} => {line:?}")]
    Mismatch {
        address: u32,
        mismatch: Mismatch,
        line: String,
    },

    #[error("response timeout, expected address 0x{expected:08X}, got 0x{cursor:08X}")]
    ResponseTimeout { expected: u32, cursor: u32 },

    #[error("no verified image to commit")]
    NotVerified,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Transport mode
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Mode {
    /// Send commands and verify responses
    Live,
    /// Log commands only, nothing is sent or verified
    DryRun,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Live
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Mode::Live),
            "dry-run" | "dry" => Ok(Mode::DryRun),
            _ => Err(format!("unknown mode '{}' (expected live or dry-run)", s)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Parse a u32 with optional `0x` prefix, hex assumed
pub fn parse_address(s: &str) -> Result<u32, core::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Transport mode (live or dry-run)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "live"))]
    pub mode: Mode,

    /// Log every command sent to the console
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub echo: bool,

    /// RAM address to stage the image at
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x1080000", parse(try_from_str = parse_address)))]
    pub base_address: u32,

    /// Storage block size, images must be a multiple of this
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2048"))]
    pub block_size: usize,

    /// Only verify record addresses, not data
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub address_only: bool,

    /// Timeout to wait for each verify response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub response_timeout_ms: u32,

    /// Consecutive response timeouts before aborting
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub retries: u32,

    /// Period to poll for console output
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Quiet period marking completion of a NAND command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub settle_timeout_ms: u32,

    /// Consecutive quiet periods before a NAND command is considered complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub settle_retries: u32,

    /// Device prompt, echoed before commands
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "axg_s420_v1_gva#"))]
    pub prompt: String,

    /// NAND partition to commit the image to
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "system"))]
    pub partition: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Live,
            echo: false,
            base_address: protocol::FLASH_ADDRESS,
            block_size: protocol::BLOCK_SIZE,
            address_only: false,
            response_timeout_ms: 10,
            retries: 10,
            poll_delay_ms: 1,
            settle_timeout_ms: 1000,
            settle_retries: 10,
            prompt: protocol::DEFAULT_PROMPT.to_string(),
            partition: protocol::DEFAULT_PARTITION.to_string(),
        }
    }
}

impl Options {
    /// Check an image of `size` bytes fits the configured block size and address space
    pub fn check_image<E>(&self, size: usize) -> Result<(), Error<E>> {
        let block_size = self.block_size;

        if block_size == 0 || block_size % CHUNK_SIZE != 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        if size == 0 || size % block_size != 0 {
            return Err(Error::InvalidImageSize { size, block_size });
        }

        let end = self.base_address as u64 + size as u64;
        if end > u32::MAX as u64 {
            return Err(Error::AddressOverflow {
                base: self.base_address,
                size,
            });
        }

        Ok(())
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    cursor: u32,
    lines: LineAssembler,
    rx: [u8; RX_BUFF_LEN],
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let cursor = options.base_address;
        Self {
            state: State::Idle,
            options,
            port,
            delay,
            cursor,
            lines: LineAssembler::new(),
            rx: [0u8; RX_BUFF_LEN],
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Next address expected to be confirmed by the device
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Release the transport and delay
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Check an image can be written with the current options
    pub fn check_image(&self, image: &[u8]) -> Result<(), Error<E>> {
        self.options.check_image(image.len())
    }

    /// Write an image to RAM, verifying each chunk before sending the next.
    ///
    /// `progress` is called with `(bytes_done, total)` before each chunk and
    /// once on completion.
    pub fn write_image<F>(&mut self, image: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        self.check_image(image)?;

        self.cursor = self.options.base_address;
        self.lines.clear();

        info!(
            "Writing {} bytes to RAM at 0x{:08X} ({} chunks)",
            image.len(),
            self.cursor,
            image.len() / CHUNK_SIZE
        );

        for (index, data) in image.chunks_exact(CHUNK_SIZE).enumerate() {
            progress(index * CHUNK_SIZE, image.len());

            let mut chunk = [0u8; CHUNK_SIZE];
            chunk.copy_from_slice(data);

            if let Err(e) = self.write_chunk(index, &chunk) {
                self.state = State::Aborted;
                return Err(e);
            }
        }

        progress(image.len(), image.len());

        self.state = State::Completed { len: image.len() };
        info!("Image written and verified");

        Ok(())
    }

    fn write_chunk(&mut self, index: usize, chunk: &Chunk) -> Result<(), Error<E>> {
        let address = self.options.base_address + (index * CHUNK_SIZE) as u32;

        self.state = State::Writing { chunk: index };
        trace!("Chunk {} at 0x{:08X}: {}", index, address, hex::encode(chunk));

        for (i, quad) in chunk.chunks_exact(QUAD_SIZE).enumerate() {
            let mut bytes = [0u8; QUAD_SIZE];
            bytes.copy_from_slice(quad);

            let address = address + (i * QUAD_SIZE) as u32;
            self.send(&Command::write_quad(address, bytes))?;
        }

        self.send(&Command::Dump {
            address,
            count: DUMP_WORDS,
        })?;

        if self.options.mode == Mode::DryRun {
            self.cursor = address + CHUNK_SIZE as u32;
            return Ok(());
        }

        self.await_verify(index, address, chunk)
    }

    /// Read responses until the cursor passes this chunk or the retry budget runs out
    fn await_verify(&mut self, index: usize, address: u32, chunk: &Chunk) -> Result<(), Error<E>> {
        let expected = address + CHUNK_SIZE as u32;
        let mut retries = self.options.retries;

        while retries > 0 && self.cursor != expected {
            self.state = State::AwaitingVerify {
                chunk: index,
                retries,
            };

            let n = self.receive(self.options.response_timeout_ms)?;
            if n == 0 {
                retries -= 1;
                continue;
            }
            retries = self.options.retries;

            let verifier = Verifier {
                prompt: &self.options.prompt,
                address_only: self.options.address_only,
            };

            let mut cursor = self.cursor;
            for line in self.lines.feed(&self.rx[..n]) {
                cursor = check_line::<E>(&verifier, &line, cursor, chunk)?;
            }
            self.cursor = cursor;
        }

        // Out of retries, the record may still be waiting for its terminator.
        // Otherwise leave partial output (usually the prompt) for the next chunk.
        if self.cursor != expected {
            if let Some(line) = self.lines.finish() {
                let verifier = Verifier {
                    prompt: &self.options.prompt,
                    address_only: self.options.address_only,
                };
                self.cursor = check_line::<E>(&verifier, &line, self.cursor, chunk)?;
            }
        }

        if self.cursor != expected {
            error!(
                "Invalid reference flash address after read. Expected (0x{:08X}), got (0x{:08X})",
                expected, self.cursor
            );
            return Err(Error::ResponseTimeout {
                expected,
                cursor: self.cursor,
            });
        }

        Ok(())
    }

    /// Erase the target partition and write the verified image to it
    pub fn commit(&mut self) -> Result<(), Error<E>> {
        let len = match self.state {
            State::Completed { len } => len,
            _ => return Err(Error::NotVerified),
        };

        info!("Erasing {} partition", self.options.partition);
        let partition = self.options.partition.clone();
        self.send(&Command::Erase {
            partition: &partition,
        })?;
        self.wait_idle()?;

        info!("Writing to {} partition", self.options.partition);
        self.send(&Command::WriteStorage {
            address: self.options.base_address,
            partition: &partition,
            size: len as u32,
        })?;
        self.wait_idle()?;

        Ok(())
    }

    /// Reset the device
    pub fn reboot(&mut self) -> Result<(), Error<E>> {
        info!("Rebooting");
        self.send(&Command::Reboot)
    }

    /// Commit the verified image, then optionally reboot
    pub fn commit_and_reboot(&mut self, reboot: bool) -> Result<(), Error<E>> {
        self.commit()?;

        if reboot {
            self.reboot()?;
        }

        Ok(())
    }

    /// Wait until the console has been quiet for `settle_retries` consecutive timeouts
    fn wait_idle(&mut self) -> Result<(), Error<E>> {
        if self.options.mode == Mode::DryRun {
            return Ok(());
        }

        let mut retries = self.options.settle_retries;
        self.lines.clear();

        while retries > 0 {
            let n = self.receive(self.options.settle_timeout_ms)?;
            if n == 0 {
                retries -= 1;
                continue;
            }
            retries = self.options.settle_retries;

            for line in self.lines.feed(&self.rx[..n]) {
                if !line.is_empty() {
                    debug!("< {}", line);
                }
            }
        }

        if let Some(line) = self.lines.finish() {
            debug!("< {}", line);
        }

        Ok(())
    }

    /// Send a command followed by the console terminator
    fn send(&mut self, command: &Command) -> Result<(), Error<E>> {
        if self.options.echo || self.options.mode == Mode::DryRun {
            info!("> {}", command);
        } else {
            debug!("> {}", command);
        }

        if self.options.mode == Mode::DryRun {
            return Ok(());
        }

        let text = command.to_string();
        for b in text.bytes().chain(LINE_FEED.bytes()) {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Read whatever the port has into `rx`, waiting up to `timeout_ms` for the first byte.
    ///
    /// Returns the number of bytes received, 0 on timeout.
    fn receive(&mut self, timeout_ms: u32) -> Result<usize, Error<E>> {
        let mut n = 0;
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Ok(v) => {
                    self.rx[n] = v;
                    n += 1;
                    if n == self.rx.len() {
                        return Ok(n);
                    }
                    continue;
                }
                Err(nb::Error::WouldBlock) if n > 0 => return Ok(n),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            };

            if t >= timeout_ms {
                return Ok(0);
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t = t.saturating_add(self.options.poll_delay_ms.max(1));
        }
    }
}

/// Apply one response line to the cursor, converting fatal outcomes into errors
fn check_line<E>(
    verifier: &Verifier,
    line: &str,
    cursor: u32,
    chunk: &Chunk,
) -> Result<u32, Error<E>> {
    match verifier.classify(line, cursor, chunk) {
        Response::Ignore => {
            trace!("< {}", line);
            Ok(cursor)
        }
        Response::Verified(next) => {
            debug!("Verified 0x{:08X}", cursor);
            Ok(next)
        }
        Response::Mismatch(mismatch) => {
            error!("{} => ({})", mismatch, line);
            Err(Error::Mismatch {
                address: cursor,
                mismatch,
                line: line.to_string(),
            })
        }
        Response::Malformed(Malformed::Length(len)) => {
            error!("Invalid result line => ({}) => ({})", line, len);
            Err(Error::InvalidLine {
                address: cursor,
                len,
                line: line.to_string(),
            })
        }
        Response::Malformed(Malformed::Address(source)) => {
            error!("Failed to parse flash address => ({})", line);
            Err(Error::Parse {
                address: cursor,
                source,
                line: line.to_string(),
            })
        }
    }
}
