
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

/// Timeout for a single read on the underlying tty, responses are polled
/// and timed out by the programmer.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(kind) => kind,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(io_kind)?;
        settings.set_baud_rate(BaudRate::from_speed(baud as usize)).map_err(io_kind)?;
        self.0.write_settings(&settings).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: u32,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, boot mode runs 8N1 without flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud as usize))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(READ_TIMEOUT)?;

        // Return instance
        Ok(Self::new(port, Delay {}, baud, options))
    }
}
