use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use uboot_ram_loader::{Error, Field, Mode, Options, Programmer, State};

const BASE: u32 = 0x0108_0000;
const PROMPT: &str = "axg_s420_v1_gva# ";

/// Simulated U-Boot console with byte-addressed RAM
#[derive(Default)]
struct Console {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    memory: HashMap<u32, u8>,
    commands: Vec<String>,
    /// Byte address read back with a flipped bit
    corrupt: Option<u32>,
    /// Drop the last character of every data record
    truncate_records: bool,
    /// Send data records without terminator or prompt
    unterminated_records: bool,
    /// Release NAND output one line per interval instead of all at once
    pace_ms: Option<u64>,
    scheduled: VecDeque<(u64, String)>,
    /// Commands with the time they were received
    sent_at: Vec<(u64, String)>,
    now: Rc<Cell<u64>>,
    /// Never respond
    silent: bool,
    /// Report no data on every nth read
    stall_every: Option<usize>,
    reads: usize,
}

impl Console {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, s: &str) {
        self.rx.extend(s.bytes());
    }

    /// Queue console output, paced against the clock if configured
    fn emit(&mut self, lines: Vec<String>) {
        match self.pace_ms {
            Some(pace) => {
                let now = self.now.get();
                for (i, l) in lines.into_iter().enumerate() {
                    self.scheduled.push_back((now + pace * (i as u64 + 1), l));
                }
            }
            None => {
                for l in lines {
                    self.push(&l);
                }
            }
        }
    }

    fn peek(&self, address: u32) -> u8 {
        let v = self.memory.get(&address).cloned().unwrap_or(0);
        match self.corrupt {
            Some(a) if a == address => v ^ 0x01,
            _ => v,
        }
    }

    fn execute(&mut self, cmd: &str) {
        self.push(cmd);
        self.push("\r\n");

        let args: Vec<&str> = cmd.split_whitespace().collect();
        match args.as_slice() {
            ["mw.q", address, value] => {
                let address = u32::from_str_radix(address, 16).unwrap();
                let value = u64::from_str_radix(value, 16).unwrap();
                for (i, b) in value.to_le_bytes().iter().enumerate() {
                    self.memory.insert(address + i as u32, *b);
                }
            }
            ["md.l", address, "4"] => {
                let address = u32::from_str_radix(address, 16).unwrap();
                let bytes: Vec<u8> = (0..16).map(|i| self.peek(address + i)).collect();
                let words: Vec<u32> = bytes
                    .chunks(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect();
                let ascii: String = bytes
                    .iter()
                    .map(|b| if (0x20..0x7f).contains(b) { *b as char } else { '.' })
                    .collect();

                let mut record = format!(
                    "{:08x}: {:08x} {:08x} {:08x} {:08x}    {}",
                    address, words[0], words[1], words[2], words[3], ascii
                );
                if self.truncate_records {
                    record.pop();
                }
                self.push(&record);
                if self.unterminated_records {
                    return;
                }
                self.push("\r\n");
            }
            ["nand", "erase.part", part] => {
                let lines = vec![
                    format!("NAND erase.part: device 0 offset 0x0, size 0x800 ({})\r\n", part),
                    "Erasing at 0x0 -- 100% complete.\r\n".to_string(),
                    "OK\r\n".to_string(),
                    PROMPT.to_string(),
                ];
                self.emit(lines);
                return;
            }
            ["nand", "write", _, _, size] => {
                let lines = vec![
                    format!("NAND write: device 0 offset 0x0, size 0x{}\r\n", size),
                    format!(" {} bytes written: OK\r\n", size),
                    PROMPT.to_string(),
                ];
                self.emit(lines);
                return;
            }
            ["reboot"] => {
                self.push("resetting ...\r\n");
                return;
            }
            _ => self.push("Unknown command - try 'help'\r\n"),
        }

        self.push(PROMPT);
    }

    fn count(&self, prefix: &str) -> usize {
        self.commands.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl Read<u8> for Console {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.reads += 1;

        let now = self.now.get();
        while self.scheduled.front().map_or(false, |(at, _)| *at <= now) {
            if let Some((_, l)) = self.scheduled.pop_front() {
                self.rx.extend(l.bytes());
            }
        }

        if let Some(n) = self.stall_every {
            if self.reads % n == 0 {
                return Err(nb::Error::WouldBlock);
            }
        }

        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Console {
    type Error = ErrorKind;

    fn write(&mut self, b: u8) -> nb::Result<(), Self::Error> {
        if b != b'\r' {
            self.line.push(b);
            return Ok(());
        }

        let cmd = String::from_utf8(std::mem::take(&mut self.line)).unwrap();
        self.commands.push(cmd.clone());
        self.sent_at.push((self.now.get(), cmd.clone()));
        if !self.silent {
            self.execute(&cmd);
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

/// Advances a time shared with the console instead of sleeping
struct Clock {
    now: Rc<Cell<u64>>,
}

impl Clock {
    fn elapsed(&self) -> u64 {
        self.now.get()
    }
}

impl DelayMs<u32> for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.now.set(self.now.get() + ms as u64);
    }
}

fn options() -> Options {
    Options {
        settle_timeout_ms: 5,
        settle_retries: 3,
        ..Options::default()
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

fn programmer(console: Console, options: Options) -> Programmer<Console, Clock, ErrorKind> {
    let clock = Clock {
        now: console.now.clone(),
    };
    Programmer::new(console, clock, options)
}

#[test]
fn writes_and_verifies_every_chunk() {
    let mut console = Console::new();
    console.stall_every = Some(7);

    let mut p = programmer(console, options());
    let data = image(2048);
    let mut progress = vec![];

    p.write_image(&data, |done, total| progress.push((done, total)))
        .unwrap();

    assert_eq!(p.cursor(), BASE + 2048);
    assert_eq!(p.state(), State::Completed { len: 2048 });

    assert_eq!(progress.len(), 129);
    assert_eq!(progress[0], (0, 2048));
    assert_eq!(progress[1], (16, 2048));
    assert_eq!(progress[128], (2048, 2048));

    let (console, _) = p.into_inner();
    assert_eq!(console.count("md.l"), 128);
    assert_eq!(console.count("mw.q"), 256);
    assert_eq!(console.commands[0], format!("mw.q 1080000 {:016X}", u64::from_le_bytes([0, 7, 14, 21, 28, 35, 42, 49])));
    assert_eq!(console.commands[1], format!("mw.q 1080008 {:016X}", u64::from_le_bytes([56, 63, 70, 77, 84, 91, 98, 105])));
    assert_eq!(console.commands[2], "md.l 1080000 4");
    assert_eq!(console.commands[383], "md.l 10807F0 4");

    for (i, b) in data.iter().enumerate() {
        assert_eq!(console.memory[&(BASE + i as u32)], *b);
    }
}

#[test]
fn mismatch_aborts_before_next_chunk() {
    let mut console = Console::new();
    console.corrupt = Some(BASE + 0x105);

    let mut p = programmer(console, options());

    match p.write_image(&image(2048), |_, _| ()) {
        Err(Error::Mismatch {
            address, mismatch, ..
        }) => {
            assert_eq!(address, BASE + 0x100);
            assert_eq!(mismatch.field, Field::Dword(1));
            assert_eq!(mismatch.found, Some(mismatch.expected ^ 0x100));
        }
        r => panic!("unexpected result {:?}", r),
    }

    assert_eq!(p.state(), State::Aborted);
    assert_eq!(p.cursor(), BASE + 0x100);

    let (console, _) = p.into_inner();
    assert_eq!(console.commands.last().unwrap(), "md.l 1080100 4");
    assert_eq!(console.count("md.l"), 17);
}

#[test]
fn address_only_ignores_data() {
    let mut console = Console::new();
    console.corrupt = Some(BASE + 0x105);

    let mut o = options();
    o.address_only = true;
    let mut p = programmer(console, o);

    p.write_image(&image(2048), |_, _| ()).unwrap();
    assert_eq!(p.cursor(), BASE + 2048);
}

#[test]
fn silent_device_times_out() {
    let mut console = Console::new();
    console.silent = true;

    let mut p = programmer(console, options());

    assert_eq!(
        p.write_image(&image(2048), |_, _| ()),
        Err(Error::ResponseTimeout {
            expected: BASE + 16,
            cursor: BASE,
        })
    );
    assert_eq!(p.state(), State::Aborted);

    // 10 attempts of 10ms each, nothing past the first chunk
    let (console, clock) = p.into_inner();
    assert_eq!(clock.elapsed(), 100);
    assert_eq!(console.commands.len(), 3);
}

#[test]
fn truncated_record_is_fatal() {
    let mut console = Console::new();
    console.truncate_records = true;

    let mut p = programmer(console, options());

    match p.write_image(&image(2048), |_, _| ()) {
        Err(Error::InvalidLine { address, len, .. }) => {
            assert_eq!(address, BASE);
            assert_eq!(len, 64);
        }
        r => panic!("unexpected result {:?}", r),
    }

    let (console, _) = p.into_inner();
    assert_eq!(console.commands.len(), 3);
}

#[test]
fn rejects_invalid_images() {
    for len in &[0, 16, 2047, 2048 + 16] {
        let mut p = programmer(Console::new(), options());

        match p.write_image(&image(*len), |_, _| ()) {
            Err(Error::InvalidImageSize { size, block_size }) => {
                assert_eq!(size, *len);
                assert_eq!(block_size, 2048);
            }
            r => panic!("unexpected result {:?} for {} bytes", r, len),
        }

        assert_eq!(p.state(), State::Idle);
        assert!(p.into_inner().0.commands.is_empty());
    }

    let mut o = options();
    o.base_address = 0xFFFF_F800;
    let mut p = programmer(Console::new(), o);
    assert_eq!(
        p.write_image(&image(2048), |_, _| ()),
        Err(Error::AddressOverflow {
            base: 0xFFFF_F800,
            size: 2048
        })
    );
}

#[test]
fn commit_requires_verified_image() {
    let mut p = programmer(Console::new(), options());

    assert_eq!(p.commit(), Err(Error::NotVerified));
    assert!(p.into_inner().0.commands.is_empty());
}

#[test]
fn commits_and_reboots() {
    let mut p = programmer(Console::new(), options());

    p.write_image(&image(4096), |_, _| ()).unwrap();
    p.commit_and_reboot(true).unwrap();

    let (console, clock) = p.into_inner();
    let n = console.commands.len();
    assert_eq!(
        &console.commands[n - 3..],
        &[
            "nand erase.part system".to_string(),
            "nand write 1080000 system 1000".to_string(),
            "reboot".to_string(),
        ]
    );

    // Each NAND command waits out three quiet periods
    assert!(clock.elapsed() >= 2 * 3 * 5);
}

#[test]
fn custom_partition_and_base() {
    let mut o = options();
    o.base_address = 0x0200_0000;
    o.partition = "boot".to_string();
    let mut p = programmer(Console::new(), o);

    p.write_image(&image(2048), |_, _| ()).unwrap();
    p.commit().unwrap();

    let (console, _) = p.into_inner();
    assert!(console.commands[0].starts_with("mw.q 2000000 "));
    assert_eq!(console.count("reboot"), 0);
    assert_eq!(
        &console.commands[console.commands.len() - 2..],
        &[
            "nand erase.part boot".to_string(),
            "nand write 2000000 boot 800".to_string(),
        ]
    );
}

#[test]
fn dry_run_sends_nothing() {
    let mut o = options();
    o.mode = Mode::DryRun;
    let mut p = programmer(Console::new(), o);

    p.write_image(&image(2048), |_, _| ()).unwrap();
    p.commit_and_reboot(true).unwrap();

    assert_eq!(p.cursor(), BASE + 2048);
    assert_eq!(p.state(), State::Completed { len: 2048 });

    let (console, clock) = p.into_inner();
    assert!(console.commands.is_empty());
    assert_eq!(console.reads, 0);
    assert_eq!(clock.elapsed(), 0);
}

#[test]
fn large_poll_settings_do_not_overflow() {
    let mut console = Console::new();
    console.silent = true;

    let o = Options {
        poll_delay_ms: 3_000_000_000,
        response_timeout_ms: 4_000_000_000,
        retries: 1,
        block_size: 16,
        ..options()
    };
    let mut p = programmer(console, o);

    assert_eq!(
        p.write_image(&[0u8; 16], |_, _| ()),
        Err(Error::ResponseTimeout {
            expected: BASE + 16,
            cursor: BASE,
        })
    );

    // Two polls, the second saturates past the timeout
    let (_, clock) = p.into_inner();
    assert_eq!(clock.elapsed(), 6_000_000_000);
}

#[test]
fn unterminated_record_verifies_once_retries_run_out() {
    let mut console = Console::new();
    console.unterminated_records = true;

    let o = Options {
        block_size: 16,
        ..options()
    };
    let mut p = programmer(console, o);

    p.write_image(&image(32), |_, _| ()).unwrap();

    assert_eq!(p.cursor(), BASE + 32);
    assert_eq!(p.state(), State::Completed { len: 32 });

    // Each chunk waits out its full retry budget first
    let (console, clock) = p.into_inner();
    assert_eq!(clock.elapsed(), 2 * 100);
    assert_eq!(console.count("md.l"), 2);
}

#[test]
fn unterminated_short_record_is_fatal() {
    let mut console = Console::new();
    console.unterminated_records = true;
    console.truncate_records = true;

    let o = Options {
        block_size: 16,
        ..options()
    };
    let mut p = programmer(console, o);

    match p.write_image(&image(32), |_, _| ()) {
        Err(Error::InvalidLine { address, len, .. }) => {
            assert_eq!(address, BASE);
            assert_eq!(len, 64);
        }
        r => panic!("unexpected result {:?}", r),
    }

    let (console, clock) = p.into_inner();
    assert_eq!(clock.elapsed(), 100);
    assert_eq!(console.count("md.l"), 1);
}

#[test]
fn settle_waits_for_quiet_after_last_output() {
    let o = options();
    let quiet = (o.settle_timeout_ms * o.settle_retries) as u64;
    let pace = (o.settle_timeout_ms * (o.settle_retries - 1)) as u64;

    // Gaps shorter than the quiet period, any reset failure ends the wait early
    let mut console = Console::new();
    console.pace_ms = Some(pace);
    let mut p = programmer(console, o);

    p.write_image(&image(2048), |_, _| ()).unwrap();
    p.commit_and_reboot(true).unwrap();

    let (console, _) = p.into_inner();
    let sent = |prefix: &str| {
        console
            .sent_at
            .iter()
            .find(|(_, c)| c.starts_with(prefix))
            .map(|(t, _)| *t)
            .unwrap()
    };

    let erase = sent("nand erase.part");
    let write = sent("nand write");
    let reboot = sent("reboot");

    // Erase prints four lines, write three, the last one `pace` apart each
    assert!(write >= erase + 4 * pace + quiet, "write at {} after erase at {}", write, erase);
    assert!(write <= erase + 4 * pace + quiet + 5);
    assert!(reboot >= write + 3 * pace + quiet, "reboot at {} after write at {}", reboot, write);
    assert!(reboot <= write + 3 * pace + quiet + 5);
}
