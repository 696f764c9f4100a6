use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer};

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        path: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(path.as_ref())?;

        // Apply settings, 8N1 with XON/XOFF so the console can throttle writes
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowSoftware);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return immediately, timeouts are polled by the programmer
        port.0.set_timeout(Duration::from_millis(0))?;

        debug!("Opened {} at {} baud", path.as_ref().display(), baud);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
