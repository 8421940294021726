//! Boot-mode wire protocol: command identifiers, request framing and
//! payload decoding.
//!
//! Requests carrying data are framed as `id | len | data | sum`, bare
//! requests are sent as the single command byte. Multi-byte fields are
//! big-endian throughout.

use core::fmt;

/// Number of null bytes sent to synchronise with the bootloader
pub const SYNC_NULL_COUNT: usize = 30;
pub const SYNC_NULL: u8 = 0x00;
pub const SYNC: u8 = 0x55;
pub const SYNC_ACK: u8 = 0xE6;

/// Generic acknowledgement, also sent by the host to confirm a new bit rate
pub const ACK: u8 = 0x06;

/// Default memory read block size
pub const DEFAULT_BLOCK_SIZE: u32 = 0x40;

/// Length of the key code expected by the key-code check
pub const KEY_CODE_LEN: usize = 16;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Selects one of the devices reported by the device inquiry
    DeviceSelect = 0x10,

    /// Selects a clock mode reported by the clock inquiry
    ClockSelect = 0x11,

    /// Fetch supported device codes
    DeviceInquiry = 0x20,

    /// Fetch supported clock modes
    ClockInquiry = 0x21,

    /// Fetch multiplication ratios per clock type
    MultiplicationRatioInquiry = 0x22,

    /// Fetch operating frequency ranges per clock type
    OperatingFrequencyInquiry = 0x23,

    /// Fetch user boot area address ranges
    UserBootAreaInquiry = 0x24,

    /// Fetch user area address ranges
    UserAreaInquiry = 0x25,

    /// Sets the new bit rate and operating frequency
    BitrateSelect = 0x3F,

    /// Moves the device into the key-code determination state
    KeyCodeDetermination = 0x40,

    /// Fetch the 32-bit sum of the user boot area
    UserBootAreaChecksum = 0x4A,

    /// Fetch the 32-bit sum of the user area
    UserAreaChecksum = 0x4B,

    /// Fetch the boot program status
    StatusInquiry = 0x4F,

    /// Reads a block of memory
    ReadMemory = 0x52,

    /// Submits the key code
    KeyCodeCheck = 0x60,
}

impl Command {
    /// Response identifier the device answers this command with on success
    pub fn response(&self) -> u8 {
        use Command::*;

        match self {
            DeviceSelect | ClockSelect | BitrateSelect => ACK,
            DeviceInquiry => 0x30,
            ClockInquiry => 0x31,
            MultiplicationRatioInquiry => 0x32,
            OperatingFrequencyInquiry => 0x33,
            UserBootAreaInquiry => 0x34,
            UserAreaInquiry => 0x35,
            KeyCodeDetermination => 0x16,
            UserBootAreaChecksum => 0x5A,
            UserAreaChecksum => 0x5B,
            StatusInquiry => 0x5F,
            ReadMemory => 0x52,
            KeyCodeCheck => 0x26,
        }
    }
}

/// Layout of an expected response frame
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ResponseKind {
    /// Response is the identifier byte alone
    pub no_data: bool,
    /// Response carries no trailing checksum
    pub no_checksum: bool,
    /// Width of the big-endian size field (1, 2 or 4)
    pub size_len: usize,
}

impl ResponseKind {
    /// Bare acknowledgement
    pub const ACK: Self = Self{ no_data: true, no_checksum: false, size_len: 1 };
    /// Standard `id | len | data | sum` response
    pub const DATA: Self = Self{ no_data: false, no_checksum: false, size_len: 1 };
    /// Status inquiry response, the only one without a checksum
    pub const STATUS: Self = Self{ no_data: false, no_checksum: true, size_len: 1 };
    /// Memory read response with a 4-byte size field
    pub const MEMORY: Self = Self{ no_data: false, no_checksum: false, size_len: 4 };
}

/// Two's complement of the byte sum, so that a frame including its
/// checksum sums to zero.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |a, b| a.wrapping_add(*b)).wrapping_neg()
}

/// 32-bit wrapping sum used by the area checksum inquiries
pub fn memory_sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |a, b| a.wrapping_add(*b as u32))
}

/// Encode a request frame, returning `None` if the payload does not fit
/// a one byte length field.
pub fn encode_request(id: u8, data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return Some(vec![id]);
    }

    if data.len() > u8::MAX as usize {
        return None;
    }

    let mut req = Vec::with_capacity(data.len() + 3);
    req.push(id);
    req.push(data.len() as u8);
    req.extend_from_slice(data);
    req.push(checksum(&req));

    Some(req)
}

/// Decode a big-endian size field of 1, 2 or 4 bytes
pub fn decode_size(size: &[u8]) -> Option<usize> {
    match size {
        [a] => Some(*a as usize),
        [a, b] => Some(u16::from_be_bytes([*a, *b]) as usize),
        [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d]) as usize),
        _ => None,
    }
}

/// Device code reported by the device inquiry
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceCode(pub [u8; 4]);

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Inclusive address range of a flash area
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRange {
    pub start_addr: u32,
    pub end_addr: u32,
}

impl MemoryRange {
    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        (self.end_addr as u64 + 1).saturating_sub(self.start_addr as u64)
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}..=0x{:08x}", self.start_addr, self.end_addr)
    }
}

/// Memory area selector for memory reads
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryArea {
    UserBoot = 0x00,
    User = 0x01,
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryArea::UserBoot => write!(f, "user boot area"),
            MemoryArea::User => write!(f, "user area"),
        }
    }
}

/// Frequency in hundredths of a MHz, the resolution used on the wire
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Frequency(pub u16);

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02} MHz", self.0 / 100, self.0 % 100)
    }
}

/// Operating frequency limits for a clock type
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrequencyRange {
    pub min: Frequency,
    pub max: Frequency,
}

/// Boot program status
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StatusReport {
    pub status: u8,
    pub error: u8,
}

/// Device inquiry: count, then per device a length byte covering the
/// 4-byte device code and product name that follow it.
pub fn parse_devices(data: &[u8]) -> Option<Vec<DeviceCode>> {
    let (count, mut rest) = data.split_first()?;
    let mut devices = Vec::with_capacity(*count as usize);

    for _ in 0..*count {
        let (len, entry) = rest.split_first()?;
        let len = *len as usize;
        if len < 4 || entry.len() < len {
            return None;
        }

        let mut code = [0u8; 4];
        code.copy_from_slice(&entry[..4]);
        devices.push(DeviceCode(code));

        rest = &entry[len..];
    }

    Some(devices)
}

/// Clock inquiry: flat list of clock mode identifiers
pub fn parse_clock_modes(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

/// Area inquiries: count, then `count` pairs of big-endian start and end
/// addresses.
pub fn parse_ranges(data: &[u8]) -> Option<Vec<MemoryRange>> {
    let (count, rest) = data.split_first()?;
    let count = *count as usize;
    if rest.len() < count * 8 {
        return None;
    }

    let ranges = rest
        .chunks_exact(8)
        .take(count)
        .map(|c| MemoryRange {
            start_addr: u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
            end_addr: u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect();

    Some(ranges)
}

/// Multiplication ratio inquiry: clock type count, then per type a count
/// byte followed by that many ratios.
pub fn parse_ratios(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let (count, mut rest) = data.split_first()?;
    let mut ratios = Vec::with_capacity(*count as usize);

    for _ in 0..*count {
        let (n, tail) = rest.split_first()?;
        let n = *n as usize;
        if tail.len() < n {
            return None;
        }

        ratios.push(tail[..n].to_vec());
        rest = &tail[n..];
    }

    Some(ratios)
}

/// Operating frequency inquiry: clock type count, then a big-endian
/// min / max pair per type.
pub fn parse_frequencies(data: &[u8]) -> Option<Vec<FrequencyRange>> {
    let (count, rest) = data.split_first()?;
    let count = *count as usize;
    if rest.len() < count * 4 {
        return None;
    }

    let ranges = rest
        .chunks_exact(4)
        .take(count)
        .map(|c| FrequencyRange {
            min: Frequency(u16::from_be_bytes([c[0], c[1]])),
            max: Frequency(u16::from_be_bytes([c[2], c[3]])),
        })
        .collect();

    Some(ranges)
}

pub fn parse_status(data: &[u8]) -> Option<StatusReport> {
    match data {
        [status, error, ..] => Some(StatusReport { status: *status, error: *error }),
        _ => None,
    }
}

/// Area checksum inquiries return a single big-endian u32
pub fn parse_area_checksum(data: &[u8]) -> Option<u32> {
    match data {
        [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// Bit rate select payload: baud / 100, base frequency, clock type count
/// and one ratio per clock type.
pub fn bitrate_payload(baud: u16, base: Frequency, ratios: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(5 + ratios.len());
    data.extend_from_slice(&baud.to_be_bytes());
    data.extend_from_slice(&base.0.to_be_bytes());
    data.push(ratios.len() as u8);
    data.extend_from_slice(ratios);
    data
}

/// Memory read payload: area, start address and block size
pub fn read_memory_payload(area: MemoryArea, addr: u32, size: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(9);
    data.push(area as u8);
    data.extend_from_slice(&addr.to_be_bytes());
    data.extend_from_slice(&size.to_be_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_zeroes_frame() {
        for len in [1usize, 2, 7, 64, 255].iter() {
            let data: Vec<u8> = (0..*len).map(|i| (i * 37 + 11) as u8).collect();
            let req = encode_request(0x52, &data).unwrap();

            assert_eq!(req.len(), len + 3);
            assert_eq!(req[1] as usize, *len);

            let (body, sum) = req.split_at(req.len() - 1);
            assert_eq!(checksum(body), sum[0]);
            assert_eq!(req.iter().fold(0u8, |a, b| a.wrapping_add(*b)), 0);
        }
    }

    #[test]
    fn bare_request_has_no_suffix() {
        assert_eq!(encode_request(0x20, &[]), Some(vec![0x20]));
    }

    #[test]
    fn oversized_request_rejected() {
        assert_eq!(encode_request(0x60, &[0u8; 256]), None);
    }

    #[test]
    fn device_select_frame() {
        let req = encode_request(Command::DeviceSelect as u8, b"0123").unwrap();
        assert_eq!(req, vec![0x10, 0x04, 0x30, 0x31, 0x32, 0x33, 0x26]);
    }

    #[test]
    fn decode_size_widths() {
        assert_eq!(decode_size(&[0x40]), Some(0x40));
        assert_eq!(decode_size(&[0x01, 0x00]), Some(0x100));
        assert_eq!(decode_size(&[0x00, 0x00, 0x00, 0x40]), Some(0x40));
        assert_eq!(decode_size(&[0x00, 0x00, 0x40]), None);
    }

    #[test]
    fn ranges_decode() {
        let data = [0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00];
        assert_eq!(
            parse_ranges(&data),
            Some(vec![MemoryRange { start_addr: 0x100, end_addr: 0x200 }])
        );

        assert_eq!(parse_ranges(&data[..5]), None);
        assert_eq!(parse_ranges(&[]), None);
    }

    #[test]
    fn devices_skip_product_name() {
        let data = [
            0x02,
            0x08, b'A', b'B', b'C', b'D', b'n', b'a', b'm', b'e',
            0x04, b'W', b'X', b'Y', b'Z',
        ];
        assert_eq!(
            parse_devices(&data),
            Some(vec![DeviceCode(*b"ABCD"), DeviceCode(*b"WXYZ")])
        );

        assert_eq!(parse_devices(&data[..12]), None);
    }

    #[test]
    fn ratios_decode() {
        let data = [0x02, 0x02, 0x04, 0x08, 0x03, 0x01, 0x02, 0x04];
        assert_eq!(
            parse_ratios(&data),
            Some(vec![vec![0x04, 0x08], vec![0x01, 0x02, 0x04]])
        );
        assert_eq!(parse_ratios(&data[..6]), None);
    }

    #[test]
    fn frequencies_decode() {
        let data = [0x01, 0x03, 0xe8, 0x07, 0xd0];
        assert_eq!(
            parse_frequencies(&data),
            Some(vec![FrequencyRange { min: Frequency(1000), max: Frequency(2000) }])
        );
        assert_eq!(Frequency(2000).to_string(), "20.00 MHz");
        assert_eq!(Frequency(1234).to_string(), "12.34 MHz");
    }

    #[test]
    fn bitrate_payload_layout() {
        let data = bitrate_payload(96, Frequency(1000), &[2, 4]);
        assert_eq!(data, vec![0x00, 0x60, 0x03, 0xe8, 0x02, 0x02, 0x04]);
    }

    #[test]
    fn read_memory_payload_layout() {
        let data = read_memory_payload(MemoryArea::User, 0x1000, 0x40);
        assert_eq!(data, vec![0x01, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x40]);
    }

    #[test]
    fn memory_sum_wraps() {
        assert_eq!(memory_sum(&[0xff; 4]), 0x3fc);
        assert_eq!(memory_sum(&[]), 0);
    }
}
