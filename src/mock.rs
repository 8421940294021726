//! Test harness over `embedded-hal-mock` serial transactions.
//!
//! Scripts are written as request / response exchanges and expanded into
//! the write, flush and read transactions the programmer performs.

use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::serial::{Read, Write};
use embedded_hal_mock::delay::MockNoop;
use embedded_hal_mock::serial::{Mock, Transaction};
use embedded_hal_mock::MockError;

use crate::protocol::{checksum, encode_request};
use crate::{Options, Programmer, SerialPort};

/// Serial mock that also records baud rate changes
#[derive(Clone)]
pub struct MockPort {
    serial: Mock<u8>,
    baud_changes: Rc<RefCell<Vec<u32>>>,
}

impl MockPort {
    pub fn new(transactions: &[Transaction<u8>]) -> Self {
        Self{ serial: Mock::new(transactions), baud_changes: Rc::new(RefCell::new(vec![])) }
    }

    /// Panics if any scripted transaction was not consumed
    pub fn done(&self) {
        self.serial.clone().done();
    }

    pub fn baud_changes(&self) -> Vec<u32> {
        self.baud_changes.borrow().clone()
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.serial.read()
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.serial.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        self.serial.flush()
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), MockError> {
        self.baud_changes.borrow_mut().push(baud);
        Ok(())
    }
}

pub type MockProgrammer = Programmer<MockPort, MockNoop, MockError>;

/// Programmer that gives up after a single empty poll
pub fn programmer(port: &MockPort) -> MockProgrammer {
    programmer_with(port, Options::default())
}

pub fn programmer_with(port: &MockPort, options: Options) -> MockProgrammer {
    let options = Options{ response_timeout_ms: 0, ..options };
    Programmer::new(port.clone(), MockNoop::new(), 9600, options)
}

/// Empty poll, seen by the programmer as a timeout
pub fn silence() -> Transaction<u8> {
    Transaction::read_error(nb::Error::WouldBlock)
}

/// Buffer resets performed at the start of a handshake
pub fn buffer_reset() -> Vec<Transaction<u8>> {
    vec![silence(), Transaction::flush()]
}

/// Host writes `req`, device answers `resp`
pub fn exchange(req: &[u8], resp: &[u8]) -> Vec<Transaction<u8>> {
    let mut t = vec![Transaction::write_many(req.to_vec()), Transaction::flush()];
    if !resp.is_empty() {
        t.push(Transaction::read_many(resp.to_vec()));
    }
    t
}

pub fn exchanges(script: &[(Vec<u8>, Vec<u8>)]) -> Vec<Transaction<u8>> {
    script.iter().flat_map(|(req, resp)| exchange(req, resp)).collect()
}

/// Host request frame
pub fn request(id: u8, data: &[u8]) -> Vec<u8> {
    encode_request(id, data).unwrap()
}

/// Device response with a one byte size field
pub fn frame(id: u8, data: &[u8]) -> Vec<u8> {
    let mut f = vec![id, data.len() as u8];
    f.extend_from_slice(data);
    f.push(checksum(&f));
    f
}

/// Memory read response with a four byte size field
pub fn memory_frame(data: &[u8]) -> Vec<u8> {
    let mut f = vec![0x52];
    f.extend_from_slice(&(data.len() as u32).to_be_bytes());
    f.extend_from_slice(data);
    f.push(checksum(&f));
    f
}
