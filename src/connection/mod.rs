//! Connection to the target's boot ROM
//!
//! Owns the transport and implements the request/ACK protocol on top of it:
//! the sync handshake that gets the ROM listening, the two-byte ACK state
//! machine, length-prefixed responses and in-band baud renegotiation.

pub mod command;
pub mod reset;

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use self::{
    command::{Command, CommandType},
    reset::{reset_strategy_sequence, ResetConfig},
};
use crate::{
    chip::Chip,
    error::{ConnectionError, Error, ResultExt, RomError, TimedOutCommand},
    transport::Transport,
};

const SYNC_BYTE: u8 = 0x55;
/// ACK bytes; the ROM answers "OK" on success and "PD" while still busy.
const ACK_OK: [u8; 2] = [0x4F, 0x4B];
const ACK_PENDING: [u8; 2] = [0x50, 0x44];

const DEFAULT_HANDSHAKE_ATTEMPTS: usize = 5;
const ISP_ENTRY: &[u8] = b"\r\nispboot if\r\nreboot\r\n";
const ISP_READY_BANNERS: [&str; 2] = ["Boot2 ISP Shakehand Suss", "Boot2 ISP Ready"];
const ISP_CONFIRM: [u8; 4] = [0xA0, 0x00, 0x00, 0x00];

/// Knobs for [`Connection::handshake`].
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub attempts: usize,
    pub reset: ResetConfig,
    /// The serial bridge on vendor boards accepts a reset request in-band.
    pub usb_bridge: bool,
    /// Sent with the `password` command right after sync, for ROMs fused with
    /// a download password.
    pub password: Option<Vec<u8>>,
    /// Go through the Boot2 ISP instead of talking to a freshly reset ROM.
    pub isp: Option<IspOptions>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            reset: ResetConfig::default(),
            usb_bridge: false,
            password: None,
            isp: None,
        }
    }
}

/// Boot2 ISP entry parameters.
#[derive(Debug, Clone, Copy)]
pub struct IspOptions {
    /// Rate the ISP console runs at, independent of the session baud.
    pub baud: u32,
    pub timeout_ms: u64,
}

impl Default for IspOptions {
    fn default() -> Self {
        Self {
            baud: 2_000_000,
            timeout_ms: 5_000,
        }
    }
}

/// An active boot-ROM session over some transport.
pub struct Connection {
    transport: Box<dyn Transport>,
    chip: Chip,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, chip: Chip) -> Self {
        Self { transport, chip }
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn baud(&self) -> u32 {
        self.transport.baud()
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// Get the boot ROM's attention: reset into the ROM, stream sync bytes
    /// for the chip's sync window and wait for the "OK" answer, retrying with
    /// a fresh reset each time.
    pub fn handshake(&mut self, options: &HandshakeOptions) -> Result<(), Error> {
        // A target reached through Boot2 ISP is already listening; a reset
        // pulse here would boot it right back out.
        if let Some(isp) = &options.isp {
            self.enter_isp(isp)?;
            if self.sync()? {
                self.send_password(options)?;
                return Ok(());
            }
            return Err(Error::HandshakeFailed(1));
        }

        let strategies = reset_strategy_sequence(&options.reset, options.usb_bridge);

        for attempt in 1..=options.attempts {
            debug!("Handshake attempt {attempt}/{}", options.attempts);

            for strategy in &strategies {
                strategy.reset(self.transport.as_mut())?;
            }
            self.transport.clear_input()?;

            if self.sync()? {
                self.send_password(options)?;
                info!("Handshake succeeded on attempt {attempt}");
                return Ok(());
            }
        }

        warn!("Handshake exhausted its retries; check that the boot pin is");
        warn!("strapped high, TX/RX are not swapped, and the serial bridge");
        warn!("supports {} baud", self.transport.baud());

        Err(Error::HandshakeFailed(options.attempts))
    }

    fn send_password(&mut self, options: &HandshakeOptions) -> Result<(), Error> {
        if let Some(password) = &options.password {
            self.command(Command::Password {
                password: password.as_slice(),
            })?;
        }
        Ok(())
    }

    /// One sync burst plus the wait for its ACK.
    fn sync(&mut self) -> Result<bool, Error> {
        let params = self.chip.params();
        let baud = self.transport.baud() as f64;
        let count = (params.sync_window * baud / 10.0) as usize;

        self.transport.write_all(&vec![SYNC_BYTE; count])?;
        if let Some(preamble) = self.chip.sync_preamble() {
            sleep(Duration::from_millis(300));
            self.transport.write_all(preamble)?;
        }
        self.transport.flush()?;

        // Poll in ACK-sized reads so nothing belonging to the next response
        // gets consumed.
        let deadline = Instant::now() + Duration::from_millis(500);
        let mut buf = [0u8; 2];
        while Instant::now() < deadline {
            let n = self.transport.read_some(&mut buf)?;
            if buf[..n].iter().any(|&b| b == ACK_OK[0] || b == ACK_OK[1]) {
                return Ok(true);
            }
            if n == 0 {
                sleep(Duration::from_millis(10));
            }
        }

        Ok(false)
    }

    /// Reach the boot ROM through an already-flashed Boot2: switch to the ISP
    /// console rate, ask Boot2 to drop into ISP mode and wait for its banner.
    fn enter_isp(&mut self, options: &IspOptions) -> Result<(), Error> {
        let session_baud = self.transport.baud();
        self.transport.set_baud(options.baud)?;
        self.transport.write_all(ISP_ENTRY)?;
        self.transport.flush()?;

        let params = self.chip.params();
        let burst = vec![SYNC_BYTE; (params.sync_window * options.baud as f64 / 10.0) as usize];

        let deadline = Instant::now() + Duration::from_millis(options.timeout_ms);
        let mut banner = Vec::new();
        let mut buf = [0u8; 64];

        let ready = loop {
            if Instant::now() >= deadline {
                break false;
            }
            self.transport.write_all(&burst)?;
            let n = self.transport.read_some(&mut buf)?;
            banner.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&banner);
            if ISP_READY_BANNERS.iter().any(|b| text.contains(b)) {
                break true;
            }
        };

        if !ready {
            self.transport.set_baud(session_baud)?;
            return Err(Error::IspNotReady(options.timeout_ms));
        }

        self.transport.write_all(&ISP_CONFIRM)?;
        self.transport.flush()?;
        self.transport.set_baud(session_baud)?;
        // Boot2 takes a moment to hand the UART back to the ROM.
        sleep(Duration::from_millis(2200));
        self.transport.clear_input()?;

        Ok(())
    }

    /// Run a command that answers with a bare ACK.
    pub fn command(&mut self, command: Command<'_>) -> Result<(), Error> {
        let ty = command.command_type();
        self.write_command(command)?;
        self.read_ack(ty)
    }

    /// Run a command whose ACK is followed by a length-prefixed payload.
    pub fn command_with_response(&mut self, command: Command<'_>) -> Result<Vec<u8>, Error> {
        let ty = command.command_type();
        self.write_command(command)?;
        self.read_ack(ty)?;

        let mut len = [0u8; 2];
        self.transport
            .read_exact(&mut len)
            .map_err(flashing)
            .for_command(ty)?;
        let len = u16::from_le_bytes(len) as usize;

        let mut payload = vec![0u8; len];
        self.transport
            .read_exact(&mut payload)
            .map_err(flashing)
            .for_command(ty)?;

        Ok(payload)
    }

    fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {command:?}");
        let ty = command.command_type();

        self.transport.set_timeout(ty.timeout())?;

        let mut frame = Vec::new();
        command
            .write(&mut frame)
            .map_err(|e| Error::Flashing(ConnectionError::Serial(e)))?;
        self.transport.write_all(&frame).map_err(flashing)?;
        self.transport.flush().map_err(flashing)
    }

    /// The two-byte ACK state machine: "OK" succeeds, "PD" means the ROM is
    /// still working and the answer must be polled again, anything else is
    /// followed by a two-byte little-endian error code.
    fn read_ack(&mut self, ty: CommandType) -> Result<(), Error> {
        let deadline = Instant::now() + ty.timeout();

        loop {
            let mut ack = [0u8; 2];
            match self.transport.read_exact(&mut ack) {
                Ok(()) => {
                    if ack.contains(&ACK_OK[0]) || ack.contains(&ACK_OK[1]) {
                        return Ok(());
                    }
                    if ack == ACK_PENDING {
                        if Instant::now() >= deadline {
                            return Err(timeout(ty));
                        }
                        continue;
                    }

                    let mut code = [0u8; 2];
                    self.transport
                        .read_exact(&mut code)
                        .map_err(flashing)
                        .for_command(ty)?;
                    return Err(RomError::new(ty, u16::from_le_bytes(code)).into());
                }
                Err(Error::Connection(ConnectionError::ShortRead { .. })) => {
                    if Instant::now() >= deadline {
                        return Err(timeout(ty));
                    }
                    sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Renegotiate the link rate in-band. The request goes out at the old
    /// rate; after letting the frame drain we switch the local side and expect
    /// a fresh ACK at the new rate. On failure the old rate is restored.
    pub fn change_baud(&mut self, new_baud: u32) -> Result<(), Error> {
        let prior_baud = self.transport.baud();
        if prior_baud == new_baud {
            return Ok(());
        }

        info!("Changing baud rate from {prior_baud} to {new_baud}");
        self.write_command(Command::ChangeRate {
            prior_baud,
            new_baud,
        })?;

        sleep(change_rate_drain(prior_baud));
        self.transport.set_baud(new_baud)?;
        self.transport.clear_input()?;

        match self.read_ack(CommandType::ChangeRate) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transport.set_baud(prior_baud)?;
                Err(e)
            }
        }
    }

    /// Temporarily run with a different transport timeout.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.transport.timeout();
        self.transport.set_timeout(timeout)?;
        let result = f(self);
        self.transport.set_timeout(old_timeout)?;

        result
    }
}

/// Time for the change-rate frame to drain at `baud` (11 characters at 10
/// bits each), doubled for margin, never below 3 ms.
fn change_rate_drain(baud: u32) -> Duration {
    let secs = 11.0 * 10.0 / baud as f64 * 2.0;
    Duration::from_secs_f64(secs).max(Duration::from_millis(3))
}

fn flashing(err: Error) -> Error {
    match err {
        Error::Connection(inner) => Error::Flashing(inner),
        err => err,
    }
}

fn timeout(ty: CommandType) -> Error {
    Error::Flashing(ConnectionError::Timeout(TimedOutCommand::from(ty)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptTransport;

    fn connection(script: &[u8]) -> Connection {
        Connection::new(Box::new(ScriptTransport::new(script, 500_000)), Chip::Bl602)
    }

    #[test]
    fn pending_ack_is_polled_until_ok() {
        // PD, PD, then OK
        let mut conn = connection(&[0x50, 0x44, 0x50, 0x44, 0x4F, 0x4B]);
        conn.command(Command::CheckImage).unwrap();
    }

    #[test]
    fn failed_ack_carries_rom_error_code() {
        // "FL" then code 0x0203 (boot header magic)
        let mut conn = connection(&[0x46, 0x4C, 0x03, 0x02]);
        let err = conn.command(Command::CheckImage).unwrap_err();
        match err {
            Error::Rom(rom) => {
                assert_eq!(rom.kind(), crate::error::RomErrorKind::BootHeaderMagic)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn response_payload_is_length_prefixed() {
        let mut script = vec![0x4F, 0x4B, 0x04, 0x00];
        script.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut conn = connection(&script);

        let payload = conn.command_with_response(Command::GetBootInfo).unwrap();
        assert_eq!(payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn truncated_response_is_fatal() {
        // OK, length 8, but only 2 payload bytes on the wire
        let mut conn = connection(&[0x4F, 0x4B, 0x08, 0x00, 0x01, 0x02]);
        assert!(conn.command_with_response(Command::GetBootInfo).is_err());
    }

    #[test]
    fn drain_time_has_a_3ms_floor() {
        assert_eq!(change_rate_drain(2_000_000), Duration::from_millis(3));
        assert!(change_rate_drain(9_600) > Duration::from_millis(3));
    }

    #[test]
    fn change_baud_restores_prior_rate_on_failure() {
        // quiet wire: no ACK ever arrives at the new rate
        let mut conn = connection(&[]);
        assert!(conn.change_baud(2_000_000).is_err());
        assert_eq!(conn.baud(), 500_000);
    }
}
