//! Byte-stream transport to the target
//!
//! The boot-ROM driver only needs a handful of operations from the physical
//! link: bounded reads, writes, baud control and the two signal lines used
//! for reset/boot strapping. [`Transport`] captures exactly that contract so
//! the command sequencer can also be driven by a scripted transport in tests;
//! [`SerialTransport`] is the real implementation over a serial port.

use std::io::{Read, Write};
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::error::{ConnectionError, Error};

#[cfg(test)]
pub(crate) use script::ScriptTransport;

/// Operations the protocol driver requires from the physical link.
///
/// `read_exact_timeout` must block until `buf` is filled or the timeout
/// elapses; a partial fill is reported as [`ConnectionError::ShortRead`].
pub trait Transport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Fill `buf` completely or fail. Returns the bytes actually read on a
    /// short read so callers can inspect a truncated answer.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    /// Read up to `buf.len()` bytes, returning however many arrived before
    /// the timeout. Used when scanning for ACK bytes and ASCII banners.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
    fn timeout(&self) -> Duration;

    fn set_baud(&mut self, baud: u32) -> Result<(), Error>;
    fn baud(&self) -> u32;

    /// Drive the reset line (active = held in reset).
    fn set_reset(&mut self, level: bool) -> Result<(), Error>;

    /// Drive the boot-strap / power line.
    fn set_boot(&mut self, level: bool) -> Result<(), Error>;

    /// Drop whatever is sitting in the receive buffer.
    fn clear_input(&mut self) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;
}

/// [`Transport`] over a host serial port.
///
/// Reset maps to RTS and boot/power to DTR, matching the wiring of the
/// vendor programming boards.
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
    baud: u32,
}

impl SerialTransport {
    pub fn open(device: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening {device} at {baud} baud");
        let serial = serialport::new(device, baud)
            .timeout(Duration::from_secs(2))
            .open()?;

        Ok(Self { serial, baud })
    }

    pub fn from_port(serial: Box<dyn SerialPort>) -> Result<Self, Error> {
        let baud = serial.baud_rate()?;
        Ok(Self { serial, baud })
    }

    pub fn into_port(self) -> Box<dyn SerialPort> {
        self.serial
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.serial.write_all(data)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut received = 0;
        while received < buf.len() {
            match self.serial.read(&mut buf[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        if received != buf.len() {
            return Err(Error::Connection(ConnectionError::ShortRead {
                expected: buf.len(),
                got: received,
            }));
        }

        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.serial.timeout()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.serial.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    fn set_reset(&mut self, level: bool) -> Result<(), Error> {
        self.serial.write_request_to_send(level)?;
        Ok(())
    }

    fn set_boot(&mut self, level: bool) -> Result<(), Error> {
        self.serial.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod script {
    use std::collections::VecDeque;
    use std::time::Duration;

    use crate::error::{ConnectionError, Error};

    use super::Transport;

    /// A [`Transport`] over a canned receive script, recording everything the
    /// driver writes. Reads drain the script; an empty script behaves like a
    /// quiet wire (timeouts).
    pub(crate) struct ScriptTransport {
        rx: VecDeque<u8>,
        pub written: Vec<u8>,
        pub baud_changes: Vec<u32>,
        baud: u32,
        timeout: Duration,
    }

    impl ScriptTransport {
        pub(crate) fn new(script: &[u8], baud: u32) -> Self {
            Self {
                rx: script.iter().copied().collect(),
                written: Vec::new(),
                baud_changes: Vec::new(),
                baud,
                timeout: Duration::from_millis(10),
            }
        }
    }

    impl Transport for ScriptTransport {
        fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
            let mut got = 0;
            while got < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[got] = byte;
                        got += 1;
                    }
                    None => {
                        return Err(Error::Connection(ConnectionError::ShortRead {
                            expected: buf.len(),
                            got,
                        }));
                    }
                }
            }
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let mut got = 0;
            while got < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[got] = byte;
                        got += 1;
                    }
                    None => break,
                }
            }
            Ok(got)
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
            self.baud = baud;
            self.baud_changes.push(baud);
            Ok(())
        }

        fn baud(&self) -> u32 {
            self.baud
        }

        fn set_reset(&mut self, _level: bool) -> Result<(), Error> {
            Ok(())
        }

        fn set_boot(&mut self, _level: bool) -> Result<(), Error> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }
}
