//! Boot-ROM command set
//!
//! Every request shares one frame shape: `opcode ‖ reserved(0) ‖ len(LE16) ‖
//! payload`. The opcodes and their nominal payload lengths are fixed per the
//! boot-ROM protocol; only the boot header length varies by chip, which is
//! why [`Command::LoadBootHeader`] carries its payload instead of a length.

use std::io::Write;
use std::time::Duration;

use strum::Display;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
const GET_INFO_TIMEOUT: Duration = Duration::from_millis(100);

/// Boot-ROM opcodes
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    GetChipId = 0x05,
    GetBootInfo = 0x10,
    LoadBootHeader = 0x11,
    LoadPublicKey = 0x12,
    LoadPublicKey2 = 0x13,
    LoadSignature = 0x14,
    LoadSignature2 = 0x15,
    LoadAesIv = 0x16,
    LoadSegHeader = 0x17,
    LoadSegData = 0x18,
    CheckImage = 0x19,
    RunImage = 0x1A,
    LoadSha384Params = 0x1B,
    ChangeRate = 0x20,
    Reset = 0x21,
    SetTimeout = 0x23,
    Password = 0x24,
    FlashErase = 0x30,
    FlashWrite = 0x31,
    FlashRead = 0x32,
    FlashBoot = 0x33,
    EfuseWrite = 0x40,
    EfuseRead = 0x41,
    MemoryWrite = 0x50,
    MemoryRead = 0x51,
}

impl CommandType {
    /// Whether a successful ACK is followed by a length-prefixed payload.
    pub fn has_response_payload(&self) -> bool {
        matches!(
            self,
            CommandType::GetChipId
                | CommandType::GetBootInfo
                | CommandType::LoadSegHeader
                | CommandType::FlashRead
                | CommandType::EfuseRead
                | CommandType::MemoryRead
        )
    }

    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::GetBootInfo | CommandType::GetChipId => GET_INFO_TIMEOUT,
            CommandType::FlashErase => ERASE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// A single boot-ROM request
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    GetChipId,
    GetBootInfo,
    /// Payload is the whole variant-length boot header from the image file.
    LoadBootHeader {
        data: &'a [u8],
    },
    LoadSha384Params {
        data: &'a [u8],
    },
    /// `second` selects the group-1 key slot on dual-group parts.
    LoadPublicKey {
        second: bool,
        data: &'a [u8],
    },
    LoadSignature {
        second: bool,
        data: &'a [u8],
    },
    LoadAesIv {
        data: &'a [u8],
    },
    LoadSegHeader {
        data: &'a [u8],
    },
    LoadSegData {
        data: &'a [u8],
    },
    CheckImage,
    /// `payload` is normally empty; some chips substitute a register patch
    /// blob the ROM applies before jumping.
    RunImage {
        payload: &'a [u8],
    },
    ChangeRate {
        prior_baud: u32,
        new_baud: u32,
    },
    Reset,
    SetTimeout {
        ms: u32,
    },
    Password {
        password: &'a [u8],
    },
    FlashErase {
        start: u32,
        end: u32,
    },
    FlashWrite {
        addr: u32,
        data: &'a [u8],
    },
    FlashRead {
        addr: u32,
        len: u32,
    },
    FlashBoot,
    EfuseWrite {
        data: &'a [u8],
    },
    EfuseRead {
        addr: u32,
        len: u32,
    },
    MemoryWrite {
        addr: u32,
        value: u32,
    },
    MemoryRead {
        addr: u32,
        len: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::GetChipId => CommandType::GetChipId,
            Command::GetBootInfo => CommandType::GetBootInfo,
            Command::LoadBootHeader { .. } => CommandType::LoadBootHeader,
            Command::LoadSha384Params { .. } => CommandType::LoadSha384Params,
            Command::LoadPublicKey { second: false, .. } => CommandType::LoadPublicKey,
            Command::LoadPublicKey { second: true, .. } => CommandType::LoadPublicKey2,
            Command::LoadSignature { second: false, .. } => CommandType::LoadSignature,
            Command::LoadSignature { second: true, .. } => CommandType::LoadSignature2,
            Command::LoadAesIv { .. } => CommandType::LoadAesIv,
            Command::LoadSegHeader { .. } => CommandType::LoadSegHeader,
            Command::LoadSegData { .. } => CommandType::LoadSegData,
            Command::CheckImage => CommandType::CheckImage,
            Command::RunImage { .. } => CommandType::RunImage,
            Command::ChangeRate { .. } => CommandType::ChangeRate,
            Command::Reset => CommandType::Reset,
            Command::SetTimeout { .. } => CommandType::SetTimeout,
            Command::Password { .. } => CommandType::Password,
            Command::FlashErase { .. } => CommandType::FlashErase,
            Command::FlashWrite { .. } => CommandType::FlashWrite,
            Command::FlashRead { .. } => CommandType::FlashRead,
            Command::FlashBoot => CommandType::FlashBoot,
            Command::EfuseWrite { .. } => CommandType::EfuseWrite,
            Command::EfuseRead { .. } => CommandType::EfuseRead,
            Command::MemoryWrite { .. } => CommandType::MemoryWrite,
            Command::MemoryRead { .. } => CommandType::MemoryRead,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    /// Serialize the request frame.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        match *self {
            Command::GetChipId
            | Command::GetBootInfo
            | Command::CheckImage
            | Command::Reset
            | Command::FlashBoot => {
                write_frame(&mut writer, self.command_type(), &[])?;
            }
            Command::RunImage { payload } => {
                write_frame(&mut writer, self.command_type(), payload)?;
            }
            Command::LoadBootHeader { data }
            | Command::LoadSha384Params { data }
            | Command::LoadPublicKey { data, .. }
            | Command::LoadSignature { data, .. }
            | Command::LoadAesIv { data }
            | Command::LoadSegHeader { data }
            | Command::LoadSegData { data }
            | Command::EfuseWrite { data } => {
                write_frame(&mut writer, self.command_type(), data)?;
            }
            Command::ChangeRate {
                prior_baud,
                new_baud,
            } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&prior_baud.to_le_bytes());
                payload[4..].copy_from_slice(&new_baud.to_le_bytes());
                write_frame(&mut writer, self.command_type(), &payload)?;
            }
            Command::SetTimeout { ms } => {
                write_frame(&mut writer, self.command_type(), &ms.to_le_bytes())?;
            }
            Command::Password { password } => {
                write_frame(&mut writer, self.command_type(), password)?;
            }
            Command::FlashErase { start, end } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&start.to_le_bytes());
                payload[4..].copy_from_slice(&end.to_le_bytes());
                write_frame(&mut writer, self.command_type(), &payload)?;
            }
            Command::FlashWrite { addr, data } => {
                writer.write_all(&[self.command_type() as u8, 0])?;
                writer.write_all(&((data.len() + 4) as u16).to_le_bytes())?;
                writer.write_all(&addr.to_le_bytes())?;
                writer.write_all(data)?;
            }
            Command::FlashRead { addr, len }
            | Command::EfuseRead { addr, len }
            | Command::MemoryRead { addr, len } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&addr.to_le_bytes());
                payload[4..].copy_from_slice(&len.to_le_bytes());
                write_frame(&mut writer, self.command_type(), &payload)?;
            }
            Command::MemoryWrite { addr, value } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&addr.to_le_bytes());
                payload[4..].copy_from_slice(&value.to_le_bytes());
                write_frame(&mut writer, self.command_type(), &payload)?;
            }
        }

        Ok(())
    }
}

fn write_frame<W: Write>(writer: &mut W, ty: CommandType, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(&[ty as u8, 0])?;
    writer.write_all(&(payload.len() as u16).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_opcode_reserved_len_payload() {
        let mut buf = Vec::new();
        Command::LoadAesIv { data: &[0xAB; 20] }.write(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x16, 0x00, 0x14, 0x00]);
        assert_eq!(buf.len(), 4 + 20);
    }

    #[test]
    fn change_rate_carries_old_then_new_rate() {
        let mut buf = Vec::new();
        Command::ChangeRate {
            prior_baud: 500_000,
            new_baud: 2_000_000,
        }
        .write(&mut buf)
        .unwrap();

        assert_eq!(&buf[..4], &[0x20, 0x00, 0x08, 0x00]);
        assert_eq!(&buf[4..8], &500_000u32.to_le_bytes());
        assert_eq!(&buf[8..12], &2_000_000u32.to_le_bytes());
    }

    #[test]
    fn second_key_slot_selects_alternate_opcode() {
        let cmd = Command::LoadPublicKey {
            second: true,
            data: &[],
        };
        assert_eq!(cmd.command_type() as u8, 0x13);
    }

    #[test]
    fn empty_commands_have_zero_length() {
        let mut buf = Vec::new();
        Command::CheckImage.write(&mut buf).unwrap();
        assert_eq!(buf, vec![0x19, 0x00, 0x00, 0x00]);
    }
}
