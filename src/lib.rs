//! Renesas Boot Mode Serial Bootloader.
//!
//! Reads the user boot area and user area flash contents through the ROM
//! boot-mode bootloader.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;
use protocol::*;

pub mod session;
pub use session::{BaseClock, BlockSink, Image, Session, SessionError, State};

#[cfg(test)]
mod mock;

pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    /// Reconfigure the line to a new baud rate
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E>;

    /// Discard any pending received bytes
    fn reset_input_buffer(&mut self) -> Result<(), E> {
        loop {
            match Read::read(self) {
                Ok(_) => (),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
    }

    /// Drain pending transmit bytes
    fn reset_output_buffer(&mut self) -> Result<(), E> {
        block!(Write::flush(self))
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("response timeout ({received} of {expected} bytes received)")]
    Timeout { expected: usize, received: usize },

    /// The device rejected the request or lost synchronisation
    #[error("unexpected response 0x{actual:02x} (expected 0x{expected:02x}, trailing {trailing:02x?})")]
    UnexpectedResponse { expected: u8, actual: u8, trailing: Vec<u8> },

    #[error("invalid checksum 0x{actual:02x} (expected 0x{expected:02x})")]
    Checksum { expected: u8, actual: u8 },

    /// Response payload too short for the command layout
    #[error("malformed payload for response 0x{id:02x}: {data:02x?}")]
    MalformedPayload { id: u8, data: Vec<u8> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("payload of {len} bytes does not fit a request frame")]
    Encoding { len: usize },

    #[error("unsupported response size field width {len}")]
    SizeField { len: usize },

    #[error("invalid state {actual} (expected {expected})")]
    InvalidState { expected: State, actual: State },

    /// Dumped data does not match the sum reported by the device
    #[error("{area} checksum mismatch: device 0x{expected:08x}, read 0x{actual:08x}")]
    DumpChecksum { area: MemoryArea, expected: u32, actual: u32 },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Key code submitted during the key-code check
#[derive(Clone, PartialEq, Debug)]
pub struct KeyCode(pub Vec<u8>);

impl Default for KeyCode {
    fn default() -> Self {
        Self(vec![0u8; KEY_CODE_LEN])
    }
}

impl FromStr for KeyCode {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(KeyCode)
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="200"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Baud rate to switch to after negotiation (defaults to the connection baud rate)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub bitrate: Option<u32>,

    /// Memory read block size
    #[cfg_attr(feature = "structopt", structopt(long, default_value="64"))]
    pub block_size: u32,

    /// Key code (hex) for the key-code check
    #[cfg_attr(feature = "structopt", structopt(long, default_value="00000000000000000000000000000000"))]
    pub key_code: KeyCode,

    /// Do not compare dumped areas against the device checksums
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_verify: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 200,
            poll_delay_ms: 1,
            bitrate: None,
            block_size: DEFAULT_BLOCK_SIZE,
            key_code: KeyCode::default(),
            no_verify: false,
        }
    }
}

/// Upper bound on buffer reservations sized from device supplied lengths
const MAX_PREALLOC: usize = 0x1000;

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    baud: u32,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32> + DelayUs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance on a port opened at `baud`
    pub fn new(port: P, delay: D, baud: u32, options: Options) -> Self {
        Self{options, port, delay, baud, _err: PhantomData}
    }

    /// Fetch the programmer options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Fetch the current line baud rate
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Synchronise with the bootloader
    pub fn handshake(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting port buffers");

        self.port.reset_input_buffer()?;
        self.port.reset_output_buffer()?;

        debug!("Sending synchronisation preamble");

        self.write_bytes(&[SYNC_NULL; SYNC_NULL_COUNT])?;
        self.get_response(SYNC_NULL, ResponseKind::ACK)?;

        self.send_request(SYNC, &[])?;
        self.get_response(SYNC_ACK, ResponseKind::ACK)?;

        debug!("Bootloader synchronised");

        Ok(())
    }

    /// Fetch the device codes supported by the bootloader
    pub fn device_inquiry(&mut self) -> Result<Vec<DeviceCode>, Error<E>> {
        let data = self.command(Command::DeviceInquiry, &[], ResponseKind::DATA)?;
        let devices = parse_devices(&data).ok_or_else(|| malformed(Command::DeviceInquiry, &data))?;

        debug!("Devices: {:?}", devices);

        Ok(devices)
    }

    pub fn device_select(&mut self, device: &DeviceCode) -> Result<(), Error<E>> {
        debug!("Selecting device {}", device);
        self.command(Command::DeviceSelect, &device.0, ResponseKind::ACK)?;
        Ok(())
    }

    /// Fetch the supported clock modes
    pub fn clock_inquiry(&mut self) -> Result<Vec<u8>, Error<E>> {
        let data = self.command(Command::ClockInquiry, &[], ResponseKind::DATA)?;
        let clocks = parse_clock_modes(&data);

        debug!("Clock modes: {:?}", clocks);

        Ok(clocks)
    }

    pub fn clock_select(&mut self, clock: u8) -> Result<(), Error<E>> {
        debug!("Selecting clock mode {}", clock);
        self.command(Command::ClockSelect, &[clock], ResponseKind::ACK)?;
        Ok(())
    }

    /// Fetch the user boot area address ranges
    pub fn user_boot_area_inquiry(&mut self) -> Result<Vec<MemoryRange>, Error<E>> {
        self.area_inquiry(Command::UserBootAreaInquiry)
    }

    /// Fetch the user area address ranges
    pub fn user_area_inquiry(&mut self) -> Result<Vec<MemoryRange>, Error<E>> {
        self.area_inquiry(Command::UserAreaInquiry)
    }

    fn area_inquiry(&mut self, command: Command) -> Result<Vec<MemoryRange>, Error<E>> {
        let data = self.command(command, &[], ResponseKind::DATA)?;
        let ranges = parse_ranges(&data).ok_or_else(|| malformed(command, &data))?;

        debug!("{:?} ranges: {:x?}", command, ranges);

        Ok(ranges)
    }

    /// Fetch the multiplication ratios available per clock type
    pub fn multiplication_ratio_inquiry(&mut self) -> Result<Vec<Vec<u8>>, Error<E>> {
        let data = self.command(Command::MultiplicationRatioInquiry, &[], ResponseKind::DATA)?;
        let ratios = parse_ratios(&data).ok_or_else(|| malformed(Command::MultiplicationRatioInquiry, &data))?;

        debug!("Multiplication ratios: {:?}", ratios);

        Ok(ratios)
    }

    /// Fetch the operating frequency range per clock type
    pub fn operating_frequency_inquiry(&mut self) -> Result<Vec<FrequencyRange>, Error<E>> {
        let data = self.command(Command::OperatingFrequencyInquiry, &[], ResponseKind::DATA)?;
        let freqs = parse_frequencies(&data).ok_or_else(|| malformed(Command::OperatingFrequencyInquiry, &data))?;

        debug!("Operating frequencies: {:?}", freqs);

        Ok(freqs)
    }

    /// Switch to a new baud rate.
    ///
    /// The line is reconfigured one bit time after the device acknowledges,
    /// and the new rate confirmed with an ACK exchange.
    pub fn bitrate_select(&mut self, baud: u32, base: Frequency, ratios: &[u8]) -> Result<(), Error<E>> {
        let rate = baud / 100;
        if rate > u16::MAX as u32 {
            return Err(Error::Configuration(format!("baud rate {} out of range", baud)));
        }

        debug!("Selecting bit rate {} (base clock {}, ratios {:?})", baud, base, ratios);

        let data = bitrate_payload(rate as u16, base, ratios);
        self.command(Command::BitrateSelect, &data, ResponseKind::ACK)?;

        let current = self.baud.max(1);
        let bit_time_us = (1_000_000 + current - 1) / current;
        self.delay.delay_us(bit_time_us);

        self.port.set_baud_rate(baud)?;
        self.baud = baud;

        self.send_request(ACK, &[])?;
        self.get_response(ACK, ResponseKind::ACK)?;

        debug!("Bit rate confirmed");

        Ok(())
    }

    /// Enter key-code determination and submit the key code
    pub fn keycode_check(&mut self, key: &[u8]) -> Result<(), Error<E>> {
        self.command(Command::KeyCodeDetermination, &[], ResponseKind::ACK)?;

        debug!("Submitting key code");
        self.command(Command::KeyCodeCheck, key, ResponseKind::ACK)?;

        Ok(())
    }

    /// Fetch the boot program status and error codes
    pub fn status_inquiry(&mut self) -> Result<StatusReport, Error<E>> {
        let data = self.command(Command::StatusInquiry, &[], ResponseKind::STATUS)?;
        let status = parse_status(&data).ok_or_else(|| malformed(Command::StatusInquiry, &data))?;

        debug!("Status: {:?}", status);

        Ok(status)
    }

    /// Fetch the device computed sum of the user boot area
    pub fn user_boot_area_checksum_inquiry(&mut self) -> Result<u32, Error<E>> {
        self.area_checksum_inquiry(Command::UserBootAreaChecksum)
    }

    /// Fetch the device computed sum of the user area
    pub fn user_area_checksum_inquiry(&mut self) -> Result<u32, Error<E>> {
        self.area_checksum_inquiry(Command::UserAreaChecksum)
    }

    fn area_checksum_inquiry(&mut self, command: Command) -> Result<u32, Error<E>> {
        let data = self.command(command, &[], ResponseKind::DATA)?;
        let sum = parse_area_checksum(&data).ok_or_else(|| malformed(command, &data))?;

        debug!("{:?}: 0x{:08x}", command, sum);

        Ok(sum)
    }

    /// Read memory in `[start, end)` in blocks of `block_size`, passing each
    /// block and the number of bytes read so far to `on_block`.
    pub fn read_memory<F>(&mut self, area: MemoryArea, start: u32, end: u64, block_size: u32, mut on_block: F)
    -> Result<Vec<u8>, Error<E>>
    where
        F: FnMut(&[u8], usize),
    {
        if block_size == 0 {
            return Err(Error::Configuration("zero block size".to_string()));
        }

        debug!("Reading {} 0x{:08x}..0x{:08x} in 0x{:x} byte blocks", area, start, end, block_size);

        let len = end.saturating_sub(start as u64).min(MAX_PREALLOC as u64);
        let mut data = Vec::with_capacity(len as usize);
        let mut addr = start as u64;

        while addr < end {
            let req = read_memory_payload(area, addr as u32, block_size);
            let block = self.command(Command::ReadMemory, &req, ResponseKind::MEMORY)?;

            data.extend_from_slice(&block);
            on_block(&block, data.len());

            addr += block_size as u64;
        }

        Ok(data)
    }

    /// Send a command and await its response
    fn command(&mut self, command: Command, data: &[u8], kind: ResponseKind) -> Result<Vec<u8>, Error<E>> {
        self.send_request(command as u8, data)?;
        self.get_response(command.response(), kind)
    }

    fn send_request(&mut self, id: u8, data: &[u8]) -> Result<(), Error<E>> {
        let req = encode_request(id, data).ok_or(Error::Encoding{ len: data.len() })?;

        trace!("TX ---> {}", hex::encode(&req));

        self.write_bytes(&req)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Read and validate a response frame, returning its payload
    fn get_response(&mut self, id: u8, kind: ResponseKind) -> Result<Vec<u8>, Error<E>> {
        let actual = self.read_exact(1)?[0];

        if actual != id {
            let trailing = self.read_available()?;
            debug!("Received unexpected response: {:02x} {}", actual, hex::encode(&trailing));

            return Err(Error::UnexpectedResponse{ expected: id, actual, trailing });
        }

        if kind.no_data {
            trace!("RX <--- {:02x}", actual);
            return Ok(vec![]);
        }

        let size = self.read_exact(kind.size_len)?;
        let len = decode_size(&size).ok_or(Error::SizeField{ len: kind.size_len })?;
        let data = self.read_exact(len)?;

        let mut res = Vec::with_capacity(1 + size.len() + data.len());
        res.push(actual);
        res.extend_from_slice(&size);
        res.extend_from_slice(&data);

        trace!("RX <--- {}", hex::encode(&res));

        if kind.no_checksum {
            return Ok(data);
        }

        let expected = checksum(&res);
        let actual = self.read_exact(1)?[0];
        if expected != actual {
            debug!("Received invalid checksum: {:02x} (expected {:02x})", actual, expected);
            return Err(Error::Checksum{ expected, actual });
        }

        Ok(data)
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        // Lengths come from the device, grow as bytes actually arrive
        let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));

        while data.len() < len {
            match self.await_byte()? {
                Some(b) => data.push(b),
                None => {
                    error!("Receive timeout");
                    return Err(Error::Timeout{ expected: len, received: data.len() })
                },
            }
        }

        Ok(data)
    }

    /// Collect whatever has already arrived without waiting
    fn read_available(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut data = vec![];

        loop {
            match self.port.read() {
                Ok(b) => data.push(b),
                Err(nb::Error::WouldBlock) => return Ok(data),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    fn await_byte(&mut self) -> Result<Option<u8>, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            if t >= self.options.response_timeout_ms {
                return Ok(None)
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);
        }
    }
}

fn malformed<E>(command: Command, data: &[u8]) -> Error<E> {
    Error::MalformedPayload{ id: command.response(), data: data.to_vec() }
}
