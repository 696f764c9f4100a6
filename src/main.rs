#[macro_use]
extern crate log;

use std::io::{self, ErrorKind as IoErrorKind, Write as _};
use std::path::PathBuf;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use embedded_hal::serial;
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::Delay;

use uboot_ram_loader::{Mode, Options, Programmer, SerialPort};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Firmware image to load
    #[structopt(parse(from_os_str))]
    image: PathBuf,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Answer yes to all prompts
    #[structopt(long, short)]
    yes: bool,

    /// Stop once the image is verified in RAM
    #[structopt(long)]
    no_commit: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Port used for dry runs, never receives and discards writes
struct NullPort;

impl serial::Read<u8> for NullPort {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        Err(nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for NullPort {
    type Error = IoErrorKind;

    fn write(&mut self, _word: u8) -> nb::Result<(), Self::Error> {
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(&o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: &Args) -> anyhow::Result<()> {
    let image = std::fs::read(&o.image)
        .with_context(|| format!("Failed to open image {}", o.image.display()))?;

    o.options
        .check_image::<IoErrorKind>(image.len())
        .map_err(|e| anyhow!("{}", e))?;

    info!(
        "Loaded {} ({})",
        o.image.display(),
        bytefmt::format(image.len() as u64)
    );

    match o.options.mode {
        Mode::Live => {
            info!("Connecting to serial port");

            let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
                .with_context(|| format!("Error connecting to serial port {}", o.port))?;

            session(&mut p, &image, o)
        }
        Mode::DryRun => {
            let mut p = Programmer::new(NullPort, Delay {}, o.options.clone());
            session(&mut p, &image, o)
        }
    }
}

fn session<P>(
    p: &mut Programmer<P, Delay, IoErrorKind>,
    image: &[u8],
    o: &Args,
) -> anyhow::Result<()>
where
    P: SerialPort<IoErrorKind>,
{
    info!("Writing image to RAM");

    let bar = ProgressBar::new(image.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar().template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})"),
    );

    let res = p.write_image(image, |done, _total| bar.set_position(done as u64));
    bar.finish();
    res.map_err(|e| anyhow!("Error writing image: {}", e))?;

    info!("Done");

    let question = format!("Write {} partition to NAND", o.options.partition);
    if o.no_commit || !confirm(&question, o.yes)? {
        return Ok(());
    }

    p.commit()
        .map_err(|e| anyhow!("Error writing partition: {}", e))?;

    if confirm("Reboot", o.yes)? {
        p.reboot().map_err(|e| anyhow!("Error rebooting: {}", e))?;
    }

    Ok(())
}

/// Ask a yes/no question on stdin, `no` on EOF
fn confirm(msg: &str, yes: bool) -> anyhow::Result<bool> {
    if yes {
        return Ok(true);
    }

    let mut answer = String::new();
    loop {
        print!("\n{} (y/n)? ", msg);
        io::stdout().flush()?;

        answer.clear();
        if io::stdin().read_line(&mut answer)? == 0 {
            return Ok(false);
        }

        match answer.trim() {
            "y" | "Y" => return Ok(true),
            "n" | "N" => return Ok(false),
            _ => (),
        }
    }
}
