//! Boot-mode session sequencing.
//!
//! A [`Session`] walks the bootloader through the fixed command order
//! required before memory can be read, deriving the clock parameters for
//! the bit rate switch from the inquiry results along the way. Any failure
//! is terminal.

use core::fmt;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};

use crate::protocol::*;
use crate::{Error, Programmer, SerialPort};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Handshake,
    DeviceSelect,
    ClockSelect,
    RatioDiscovery,
    BitrateSwitch,
    AreaDiscovery,
    KeyUnlock,
    ChecksumDiscovery,
    MemoryDump(MemoryArea),
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Handshake => write!(f, "handshake"),
            State::DeviceSelect => write!(f, "device select"),
            State::ClockSelect => write!(f, "clock select"),
            State::RatioDiscovery => write!(f, "ratio discovery"),
            State::BitrateSwitch => write!(f, "bit rate switch"),
            State::AreaDiscovery => write!(f, "area discovery"),
            State::KeyUnlock => write!(f, "key unlock"),
            State::ChecksumDiscovery => write!(f, "checksum discovery"),
            State::MemoryDump(area) => write!(f, "{} dump", area),
            State::Done => write!(f, "done"),
            State::Failed => write!(f, "failed"),
        }
    }
}

/// Error raised by a session step
#[derive(Clone, PartialEq, Debug)]
pub struct SessionError<E> {
    pub step: State,
    pub error: Error<E>,
}

impl<E: fmt::Debug> fmt::Display for SessionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

impl<E: fmt::Debug + 'static> std::error::Error for SessionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Clock parameters for the bit rate switch
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BaseClock {
    /// First multiplication ratio of each clock type
    pub ratios: [u8; 2],
    /// Input frequency shared by both clock types
    pub frequency: Frequency,
}

/// Derive the shared input clock from the first ratio and the maximum
/// operating frequency of the first two clock types.
///
/// Both clock types must imply exactly the same input frequency.
pub fn derive_base_clock<E>(ratios: &[Vec<u8>], freqs: &[FrequencyRange]) -> Result<BaseClock, Error<E>> {
    if ratios.len() < 2 || freqs.len() < 2 {
        return Err(Error::Configuration(format!(
            "expected two clock types ({} ratio sets, {} frequency ranges)", ratios.len(), freqs.len()
        )));
    }

    let mut r = [0u8; 2];
    for (i, set) in ratios.iter().take(2).enumerate() {
        r[i] = match set.first() {
            Some(v) if *v > 0 => *v,
            _ => return Err(Error::Configuration(format!("no usable ratio for clock type {}", i))),
        };
    }

    let max = [freqs[0].max.0 as u32, freqs[1].max.0 as u32];

    // max0 / r0 == max1 / r1, compared without rounding
    if max[0] * r[1] as u32 != max[1] * r[0] as u32 {
        return Err(Error::Configuration("inconsistent base clock".to_string()));
    }

    Ok(BaseClock{ ratios: r, frequency: Frequency((max[0] / r[0] as u32) as u16) })
}

/// Contents of a dumped memory area
#[derive(Clone, PartialEq, Debug)]
pub struct Image {
    pub area: MemoryArea,
    pub range: MemoryRange,
    pub data: Vec<u8>,
}

/// Receives each memory block as it is read: area, block, bytes read so
/// far and total bytes in the area.
pub type BlockSink = Box<dyn FnMut(MemoryArea, &[u8], usize, u64)>;

pub struct Session<P, D, E> {
    programmer: Programmer<P, D, E>,
    state: State,

    device: Option<DeviceCode>,
    clock: Option<u8>,
    base_clock: Option<BaseClock>,
    user_boot_area: Option<MemoryRange>,
    user_area: Option<MemoryRange>,
    user_boot_checksum: Option<u32>,
    user_checksum: Option<u32>,

    sink: Option<BlockSink>,
}

impl <P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32> + DelayUs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(programmer: Programmer<P, D, E>) -> Self {
        Self {
            programmer,
            state: State::Handshake,
            device: None,
            clock: None,
            base_clock: None,
            user_boot_area: None,
            user_area: None,
            user_boot_checksum: None,
            user_checksum: None,
            sink: None,
        }
    }

    /// Register a sink for memory blocks as they arrive, so a dump that
    /// fails part way still delivers the bytes read before the failure
    pub fn on_block(&mut self, sink: BlockSink) {
        self.sink = Some(sink);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn device(&self) -> Option<DeviceCode> {
        self.device
    }

    pub fn clock(&self) -> Option<u8> {
        self.clock
    }

    pub fn base_clock(&self) -> Option<BaseClock> {
        self.base_clock
    }

    pub fn baud(&self) -> u32 {
        self.programmer.baud()
    }

    pub fn user_boot_area(&self) -> Option<MemoryRange> {
        self.user_boot_area
    }

    pub fn user_area(&self) -> Option<MemoryRange> {
        self.user_area
    }

    /// Query the boot program status, allowed once synchronised
    pub fn status(&mut self) -> Result<StatusReport, SessionError<E>> {
        let step = self.state;

        if let State::Handshake | State::Done | State::Failed = step {
            return Err(SessionError{ step, error: Error::InvalidState{ expected: State::DeviceSelect, actual: step } });
        }

        self.programmer.status_inquiry().map_err(|error| self.fail(step, error))
    }

    /// Run every remaining step, returning the dumped images in order
    pub fn run(&mut self) -> Result<Vec<Image>, SessionError<E>> {
        let mut images = vec![];

        while self.state != State::Done {
            if let Some(i) = self.step()? {
                images.push(i);
            }
        }

        Ok(images)
    }

    /// Execute the next step, returning an image when a dump completes
    pub fn step(&mut self) -> Result<Option<Image>, SessionError<E>> {
        let step = self.state;
        info!("Session step: {}", step);

        let res = match step {
            State::Handshake => self.handshake().map(|_| None),
            State::DeviceSelect => self.select_device().map(|_| None),
            State::ClockSelect => self.select_clock().map(|_| None),
            State::RatioDiscovery => self.discover_ratios().map(|_| None),
            State::BitrateSwitch => self.switch_bitrate().map(|_| None),
            State::AreaDiscovery => self.discover_areas().map(|_| None),
            State::KeyUnlock => self.unlock().map(|_| None),
            State::ChecksumDiscovery => self.discover_checksums().map(|_| None),
            State::MemoryDump(area) => self.dump(area).map(Some),
            // Finished and failed sessions keep their state
            State::Done | State::Failed => {
                return Err(SessionError{ step, error: Error::InvalidState{ expected: State::Handshake, actual: step } });
            },
        };

        res.map_err(|error| self.fail(step, error))
    }

    fn fail(&mut self, step: State, error: Error<E>) -> SessionError<E> {
        error!("Session {} failed: {}", step, error);
        self.state = State::Failed;
        SessionError{ step, error }
    }

    fn expect(&self, expected: State) -> Result<(), Error<E>> {
        if self.state != expected {
            return Err(Error::InvalidState{ expected, actual: self.state });
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<(), Error<E>> {
        self.expect(State::Handshake)?;

        self.programmer.handshake()?;

        self.state = State::DeviceSelect;
        Ok(())
    }

    /// Select the first device reported by the bootloader
    fn select_device(&mut self) -> Result<DeviceCode, Error<E>> {
        self.expect(State::DeviceSelect)?;

        let devices = self.programmer.device_inquiry()?;
        let device = *devices.first()
            .ok_or_else(|| Error::Configuration("no devices reported".to_string()))?;

        self.programmer.device_select(&device)?;
        info!("Selected device: {}", device);

        self.device = Some(device);
        self.state = State::ClockSelect;
        Ok(device)
    }

    /// Select the first clock mode reported by the bootloader
    fn select_clock(&mut self) -> Result<u8, Error<E>> {
        self.expect(State::ClockSelect)?;

        let clocks = self.programmer.clock_inquiry()?;
        let clock = *clocks.first()
            .ok_or_else(|| Error::Configuration("no clock modes reported".to_string()))?;

        self.programmer.clock_select(clock)?;
        info!("Selected clock mode: {}", clock);

        self.clock = Some(clock);
        self.state = State::RatioDiscovery;
        Ok(clock)
    }

    fn discover_ratios(&mut self) -> Result<BaseClock, Error<E>> {
        self.expect(State::RatioDiscovery)?;

        let ratios = self.programmer.multiplication_ratio_inquiry()?;
        let freqs = self.programmer.operating_frequency_inquiry()?;

        let base = derive_base_clock(&ratios, &freqs)?;
        info!("Base clock: {} (ratios {:?})", base.frequency, base.ratios);

        self.base_clock = Some(base);
        self.state = State::BitrateSwitch;
        Ok(base)
    }

    fn switch_bitrate(&mut self) -> Result<u32, Error<E>> {
        self.expect(State::BitrateSwitch)?;

        let base = self.base_clock
            .ok_or_else(|| Error::Configuration("base clock not derived".to_string()))?;
        let baud = self.programmer.options().bitrate.unwrap_or_else(|| self.programmer.baud());

        self.programmer.bitrate_select(baud, base.frequency, &base.ratios)?;
        info!("Bit rate: {}", baud);

        self.state = State::AreaDiscovery;
        Ok(baud)
    }

    fn discover_areas(&mut self) -> Result<(), Error<E>> {
        self.expect(State::AreaDiscovery)?;

        let user_boot = self.programmer.user_boot_area_inquiry()?;
        let user = self.programmer.user_area_inquiry()?;

        let user_boot = *user_boot.first()
            .ok_or_else(|| Error::Configuration("no user boot area reported".to_string()))?;
        let user = *user.first()
            .ok_or_else(|| Error::Configuration("no user area reported".to_string()))?;

        info!("User boot area: {}", user_boot);
        info!("User area: {}", user);

        self.user_boot_area = Some(user_boot);
        self.user_area = Some(user);
        self.state = State::KeyUnlock;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), Error<E>> {
        self.expect(State::KeyUnlock)?;

        let key = self.programmer.options().key_code.0.clone();
        self.programmer.keycode_check(&key)?;
        info!("Key code accepted");

        self.state = State::ChecksumDiscovery;
        Ok(())
    }

    /// Fetch the device computed area sums, skipped when verification is off
    fn discover_checksums(&mut self) -> Result<(), Error<E>> {
        self.expect(State::ChecksumDiscovery)?;

        if !self.programmer.options().no_verify {
            self.user_boot_checksum = Some(self.programmer.user_boot_area_checksum_inquiry()?);
            self.user_checksum = Some(self.programmer.user_area_checksum_inquiry()?);
        }

        self.state = State::MemoryDump(MemoryArea::UserBoot);
        Ok(())
    }

    /// Read a whole memory area, verifying it against the device sum
    fn dump(&mut self, area: MemoryArea) -> Result<Image, Error<E>> {
        self.expect(State::MemoryDump(area))?;

        let (range, expected) = match area {
            MemoryArea::UserBoot => (self.user_boot_area, self.user_boot_checksum),
            MemoryArea::User => (self.user_area, self.user_checksum),
        };
        let range = range.ok_or_else(|| Error::Configuration(format!("{} not discovered", area)))?;

        let total = range.len();
        let block_size = self.programmer.options().block_size;
        let sink = &mut self.sink;

        let data = self.programmer.read_memory(area, range.start_addr, range.end_addr as u64 + 1, block_size, |block, n| {
            if let Some(s) = sink.as_mut() {
                s(area, block, n, total);
            }
        })?;

        info!("Read {} bytes from {}", data.len(), area);

        if let Some(expected) = expected {
            let mut actual = memory_sum(&data);
            // The user area sum also covers the key code
            if area == MemoryArea::User {
                actual = actual.wrapping_add(memory_sum(&self.programmer.options().key_code.0));
            }

            if actual != expected {
                return Err(Error::DumpChecksum{ area, expected, actual });
            }

            debug!("{} checksum verified: 0x{:08x}", area, actual);
        }

        self.state = match area {
            MemoryArea::UserBoot => State::MemoryDump(MemoryArea::User),
            MemoryArea::User => State::Done,
        };

        Ok(Image{ area, range, data })
    }
}
