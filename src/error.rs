//! Library errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

#[cfg(feature = "serialport")]
use crate::connection::command::CommandType;

/// All possible errors returned by blflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[cfg(feature = "serialport")]
    #[error("The boot ROM returned an error")]
    #[diagnostic(transparent)]
    Rom(#[from] RomError),

    #[error(
        "Handshake with the boot ROM failed after {0} attempts"
    )]
    #[diagnostic(
        code(blflash::handshake_failed),
        help("Check that the boot pin is pulled to the board's own 3.3V rail, \
              that UART TX/RX are not swapped, that the selected baud rate is \
              supported by the serial bridge, and that the chip was reset with \
              the boot pin held high")
    )]
    HandshakeFailed(usize),

    #[error("Boot2 ISP did not report ready within {0} ms")]
    #[diagnostic(code(blflash::isp_not_ready))]
    IspNotReady(u64),

    #[error("Image file sign/encrypt mode ({file_sign}/{file_encrypt}) does not match the device's fused mode ({dev_sign}/{dev_encrypt})")]
    #[diagnostic(
        code(blflash::format_mismatch),
        help("The image must be rebuilt for the modes burned into this chip; the mismatch is never auto-corrected")
    )]
    FormatMismatch {
        file_sign: u8,
        file_encrypt: u8,
        dev_sign: u8,
        dev_encrypt: u8,
    },

    /// Not a failure: the chip id was already flashed in this session, so the
    /// load was short-circuited before any segment data was transmitted.
    #[error("Chip {0} was already flashed in this session")]
    #[diagnostic(code(blflash::duplicate_chip))]
    DuplicateChip(String),

    #[error("An eflash loader is already running on the target")]
    #[diagnostic(
        code(blflash::eflash_loader_present),
        help("Power-cycle the chip to return to the boot ROM")
    )]
    EflashLoaderPresent,

    #[error("Boot header magic {0:#010x} is not recognized")]
    #[diagnostic(code(blflash::bad_magic))]
    BadMagic(u32),

    #[error("Boot header is {got} bytes, expected {expected} for this chip")]
    #[diagnostic(code(blflash::bad_header_length))]
    BadHeaderLength { expected: usize, got: usize },

    #[error("Segment header count ({headers}) does not match segment data count ({data})")]
    #[diagnostic(code(blflash::segment_count_mismatch))]
    SegmentCountMismatch { headers: usize, data: usize },

    #[error("{0} must be provided")]
    #[diagnostic(code(blflash::missing_key_material))]
    MissingKeyMaterial(&'static str),

    #[error("Missing configuration key `{0}`")]
    #[diagnostic(code(blflash::missing_config_key))]
    MissingConfigKey(&'static str),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Failed to open file: {0}")]
    FileOpen(String, #[source] io::Error),

    #[error("Failed to write file: {0}")]
    FileWrite(String, #[source] io::Error),
}

#[cfg(feature = "serialport")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// Failures of the serial transport itself
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(blflash::connection_failed),
        help("Ensure the device is connected and the host recognizes the serial bridge")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(code(blflash::serial_not_found))]
    DeviceNotFound,

    #[error("Read {got} bytes, expected {expected}")]
    #[diagnostic(code(blflash::short_read))]
    ShortRead { expected: usize, got: usize },

    #[error("Timeout while running command")]
    #[diagnostic(code(blflash::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(blflash::serial_error))]
    Serial(#[from] io::Error),
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => ConnectionError::Serial(kind.into()),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::ConnectionFailed,
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<String>,
}

#[cfg(feature = "serialport")]
impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        Self {
            command: Some(command.to_string()),
        }
    }
}

impl std::fmt::Display for TimedOutCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{command}"),
            None => Ok(()),
        }
    }
}

/// Errors originating from key material or a failed signing step.
///
/// A build aborts before any output file is written when one of these occurs,
/// so a failed build never leaves a partial image in place.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("AES key must be 16, 24 or 32 bytes, got {0}")]
    #[diagnostic(code(blflash::crypto::invalid_key_length))]
    InvalidKeyLength(usize),

    #[error("AES IV must be 16 bytes, got {0}")]
    #[diagnostic(code(blflash::crypto::invalid_iv_length))]
    InvalidIvLength(usize),

    #[error("AES input length {0} is not a multiple of the 16-byte block size")]
    #[diagnostic(code(blflash::crypto::unaligned))]
    UnalignedPlaintext(usize),

    #[error("Key/IV hex string has invalid length or characters ({0} chars)")]
    #[diagnostic(code(blflash::crypto::invalid_hex))]
    InvalidHex(usize),

    #[error("Failed to parse EC private key: {0}")]
    #[diagnostic(
        code(blflash::crypto::key_parse),
        help("The key must be a P-256 private key in PKCS#8 or SEC1 PEM form")
    )]
    KeyParse(String),
}

/// Error codes the boot ROM reports as a two-byte little-endian pair after a
/// failing ACK.
#[cfg(feature = "serialport")]
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[non_exhaustive]
#[repr(u16)]
pub enum RomErrorKind {
    Success = 0x0000,
    BootHeaderLength = 0x0201,
    BootHeaderNotLoaded = 0x0202,
    BootHeaderMagic = 0x0203,
    BootHeaderCrc = 0x0204,
    BootHeaderEncryptMismatch = 0x0205,
    BootHeaderSignMismatch = 0x0206,
    SegmentCount = 0x0207,
    AesIvLength = 0x0208,
    AesIvCrc = 0x0209,
    PublicKeyLength = 0x020A,
    PublicKeyCrc = 0x020B,
    PublicKeyHash = 0x020C,
    SignatureLength = 0x020D,
    SignatureCrc = 0x020E,
    SegmentHeaderLength = 0x020F,
    SegmentHeaderCrc = 0x0210,
    SegmentHeaderAddress = 0x0211,
    SegmentDataLength = 0x0212,
    SegmentDataDecrypt = 0x0213,
    SegmentDataTotalLength = 0x0214,
    SegmentDataCrc = 0x0215,
    ImageIncomplete = 0x0216,
    ImageHash = 0x0217,
    SignatureParse = 0x0218,
    SignatureVerify = 0x0219,
    ImageDecrypt = 0x021A,
    ImageAllInvalid = 0x021B,
    ChipProtected = 0x0A0A,
    InvalidMessage = 0xFFFF,
}

#[cfg(feature = "serialport")]
impl From<u16> for RomErrorKind {
    fn from(raw: u16) -> Self {
        match raw {
            0x0000 => Self::Success,
            0x0201 => Self::BootHeaderLength,
            0x0202 => Self::BootHeaderNotLoaded,
            0x0203 => Self::BootHeaderMagic,
            0x0204 => Self::BootHeaderCrc,
            0x0205 => Self::BootHeaderEncryptMismatch,
            0x0206 => Self::BootHeaderSignMismatch,
            0x0207 => Self::SegmentCount,
            0x0208 => Self::AesIvLength,
            0x0209 => Self::AesIvCrc,
            0x020A => Self::PublicKeyLength,
            0x020B => Self::PublicKeyCrc,
            0x020C => Self::PublicKeyHash,
            0x020D => Self::SignatureLength,
            0x020E => Self::SignatureCrc,
            0x020F => Self::SegmentHeaderLength,
            0x0210 => Self::SegmentHeaderCrc,
            0x0211 => Self::SegmentHeaderAddress,
            0x0212 => Self::SegmentDataLength,
            0x0213 => Self::SegmentDataDecrypt,
            0x0214 => Self::SegmentDataTotalLength,
            0x0215 => Self::SegmentDataCrc,
            0x0216 => Self::ImageIncomplete,
            0x0217 => Self::ImageHash,
            0x0218 => Self::SignatureParse,
            0x0219 => Self::SignatureVerify,
            0x021A => Self::ImageDecrypt,
            0x021B => Self::ImageAllInvalid,
            0x0A0A => Self::ChipProtected,
            _ => Self::InvalidMessage,
        }
    }
}

/// An error originating from the boot ROM of a target device in response to a
/// command, carrying the raw code alongside the decoded kind.
#[cfg(feature = "serialport")]
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Boot ROM responded to {command} with error {code:#06x} ({kind})")]
#[diagnostic(code(blflash::rom_error))]
pub struct RomError {
    command: CommandType,
    code: u16,
    kind: RomErrorKind,
}

#[cfg(feature = "serialport")]
impl RomError {
    pub fn new(command: CommandType, code: u16) -> RomError {
        RomError {
            command,
            code,
            kind: RomErrorKind::from(code),
        }
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Operation-context attachment, as a convenience for mapping transport
/// failures to the command that was in flight.
#[cfg(feature = "serialport")]
pub trait ResultExt {
    /// Mark the error as occurring during a specific command
    fn for_command(self, command: CommandType) -> Self;
}

#[cfg(feature = "serialport")]
impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        self.map_err(|err| match err {
            Error::Connection(ConnectionError::Timeout(_)) => {
                Error::Connection(ConnectionError::Timeout(TimedOutCommand {
                    command: Some(command.to_string()),
                }))
            }
            Error::Flashing(ConnectionError::Timeout(_)) => {
                Error::Flashing(ConnectionError::Timeout(TimedOutCommand {
                    command: Some(command.to_string()),
                }))
            }
            err => err,
        })
    }
}

#[cfg(all(test, feature = "serialport"))]
mod tests {
    use super::*;

    #[test]
    fn rom_error_codes_decode() {
        assert_eq!(RomErrorKind::from(0x0203), RomErrorKind::BootHeaderMagic);
        assert_eq!(RomErrorKind::from(0x0A0A), RomErrorKind::ChipProtected);
        assert_eq!(RomErrorKind::from(0xBEEF), RomErrorKind::InvalidMessage);
    }
}
