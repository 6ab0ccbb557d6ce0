//! Image loading orchestration
//!
//! Drives a handshaken [`Connection`] through the full download sequence:
//! boot info, mode agreement, header, key/signature/IV blocks, segments,
//! image check and run. A shared [`ChipRegistry`] short-circuits repeat
//! flashes of the same physical chip.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    chip::{Chip, TimeoutQuirk},
    connection::{
        command::Command,
        Connection, HandshakeOptions,
    },
    crypto::AES_BLOCK_SIZE,
    error::{ConnectionError, Error},
    image::{builder, BootHeader},
};

/// Largest `load_seg_data` chunk the ROM accepts.
const SEGMENT_CHUNK: usize = 4080;

/// Chip ids flashed so far, shared between sessions on one station.
///
/// Registering an id that is already present means the chip was flashed
/// before; the caller treats that as a short-circuit, not a failure.
#[derive(Debug, Default)]
pub struct ChipRegistry {
    seen: Mutex<HashSet<String>>,
}

impl ChipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `chip_id`; returns false when it was already known.
    pub fn register(&self, chip_id: &str) -> bool {
        self.seen.lock().unwrap().insert(chip_id.to_string())
    }

    pub fn contains(&self, chip_id: &str) -> bool {
        self.seen.lock().unwrap().contains(chip_id)
    }
}

/// Decoded `get_boot_info` answer.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub raw: Vec<u8>,
    /// Hex chip id, already in display byte order.
    pub chip_id: String,
    /// Fused sign mode per image group.
    pub sign: Vec<u8>,
    /// Fused encrypt mode per image group.
    pub encrypt: Vec<u8>,
}

impl BootInfo {
    fn parse(chip: Chip, raw: Vec<u8>) -> Result<Self, Error> {
        let params = chip.params();
        let (id_start, id_end) = params.chip_id_range;
        if raw.len() < id_end {
            return Err(Error::Flashing(ConnectionError::ShortRead {
                expected: id_end,
                got: raw.len(),
            }));
        }

        // An eflash loader answers boot info with an all-ones first word.
        if raw[..4] == [0xFF; 4] {
            return Err(Error::EflashLoaderPresent);
        }

        let mut id_bytes = raw[id_start..id_end].to_vec();
        if params.chip_id_reversed {
            id_bytes.reverse();
        }
        let chip_id = hex::encode(id_bytes);

        let groups = if params.dual_group { 2 } else { 1 };
        let mut sign = Vec::with_capacity(groups);
        let mut encrypt = Vec::with_capacity(groups);
        for group in 0..groups {
            let (sign_off, encrypt_off) = chip.bootinfo_mode_offsets(group);
            sign.push(raw[sign_off] & 0x3);
            encrypt.push(raw[encrypt_off] & 0x3);
        }

        Ok(Self {
            raw,
            chip_id,
            sign,
            encrypt,
        })
    }
}

/// Knobs for one load session.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub handshake: HandshakeOptions,
    /// Renegotiate to this rate right after the handshake.
    pub baud: Option<u32>,
    /// SHA-384 parameter block to send after the boot header, for images
    /// built in 384-bit hash mode.
    pub sha384_params: Option<Vec<u8>>,
    /// Issue `run_image` once everything checked out.
    pub run: bool,
}

/// One load session over an established connection.
pub struct Loader<'a> {
    connection: &'a mut Connection,
    registry: Option<&'a ChipRegistry>,
}

impl<'a> Loader<'a> {
    pub fn new(connection: &'a mut Connection, registry: Option<&'a ChipRegistry>) -> Self {
        Self {
            connection,
            registry,
        }
    }

    /// Query and decode boot info, applying the chip's post-query timeout
    /// quirk.
    pub fn get_boot_info(&mut self) -> Result<BootInfo, Error> {
        let chip = self.connection.chip();
        let raw = self.connection.command_with_response(Command::GetBootInfo)?;
        let info = BootInfo::parse(chip, raw)?;
        debug!("Boot info: chip id {}", info.chip_id);

        match chip.params().timeout_quirk {
            TimeoutQuirk::None => {}
            TimeoutQuirk::SetTimeout {
                ms,
                a0_addr,
                a0_value,
            } => {
                // A0 silicon predates the set_timeout command.
                if info.raw[0] == 0x01 {
                    self.connection.command(Command::MemoryWrite {
                        addr: a0_addr,
                        value: a0_value,
                    })?;
                } else {
                    self.connection.command(Command::SetTimeout { ms })?;
                }
            }
        }

        Ok(info)
    }

    /// The 16-byte ASCII chip id blob, for variants that identify themselves
    /// before download.
    pub fn get_chip_id(&mut self) -> Result<Vec<u8>, Error> {
        self.connection.command_with_response(Command::GetChipId)
    }

    /// Handshake, optionally renegotiate baud, then push `image`.
    pub fn load_image(&mut self, image: &[u8], options: &LoadOptions) -> Result<BootInfo, Error> {
        self.load_images(image, None, options)
    }

    /// Like [`Self::load_image`] but with an optional secondary image
    /// (second core or staged bootloader) sent in the same session.
    pub fn load_images(
        &mut self,
        primary: &[u8],
        secondary: Option<&[u8]>,
        options: &LoadOptions,
    ) -> Result<BootInfo, Error> {
        self.connection.handshake(&options.handshake)?;
        if let Some(baud) = options.baud {
            self.connection.change_baud(baud)?;
        }

        let boot_info = self.get_boot_info()?;

        if let Some(registry) = self.registry {
            if !registry.register(&boot_info.chip_id) {
                info!("Chip {} already flashed, skipping", boot_info.chip_id);
                return Err(Error::DuplicateChip(boot_info.chip_id));
            }
        }

        self.check_mode_agreement(primary, &boot_info)?;

        self.send_image(primary, options.sha384_params.as_deref())?;
        if let Some(secondary) = secondary {
            self.send_image(secondary, None)?;
        }

        if options.run {
            self.run_image()?;
        }

        Ok(boot_info)
    }

    /// The image's declared modes must agree with what is fused into the
    /// chip; a mismatch is never auto-corrected.
    fn check_mode_agreement(&self, image: &[u8], boot_info: &BootInfo) -> Result<(), Error> {
        let chip = self.connection.chip();
        let header_len = chip.params().header_len;
        if image.len() < header_len {
            return Err(Error::BadHeaderLength {
                expected: header_len,
                got: image.len(),
            });
        }
        let header = BootHeader::parse(chip, image[..header_len].to_vec())?;

        let dev_sign = boot_info.sign[0];
        let dev_encrypt = boot_info.encrypt[0];
        if header.sign() != dev_sign || (header.encrypt() != 0) != (dev_encrypt != 0) {
            return Err(Error::FormatMismatch {
                file_sign: header.sign(),
                file_encrypt: header.encrypt(),
                dev_sign,
                dev_encrypt,
            });
        }

        Ok(())
    }

    /// Header, key material blocks and segments, strictly in order, ending
    /// with `check_image`.
    fn send_image(&mut self, image: &[u8], sha384_params: Option<&[u8]>) -> Result<(), Error> {
        let chip = self.connection.chip();
        let params = chip.params();

        let header = BootHeader::parse(chip, image[..params.header_len].to_vec())?;
        let sign = header.sign();
        let encrypt = header.encrypt();
        let count = header.segment_count() as usize;

        self.connection.command(Command::LoadBootHeader {
            data: header.as_bytes(),
        })?;

        if let Some(data) = sha384_params {
            self.connection.command(Command::LoadSha384Params { data })?;
        }

        let mut cursor = params.header_len;
        let groups = if params.dual_group { 2 } else { 1 };

        if sign != 0 {
            for group in 0..groups {
                let block = take(image, &mut cursor, 68)?;
                self.connection.command(Command::LoadPublicKey {
                    second: group == 1,
                    data: block,
                })?;
            }
            for group in 0..groups {
                // block length is stored in its first field
                let sig_len =
                    u32::from_le_bytes(take(image, &mut cursor, 4)?.try_into().unwrap()) as usize;
                cursor -= 4;
                let block = take(image, &mut cursor, 4 + sig_len + 4)?;
                self.connection.command(Command::LoadSignature {
                    second: group == 1,
                    data: block,
                })?;
            }
        }

        if encrypt != 0 {
            let block = take(image, &mut cursor, 20)?;
            self.connection.command(Command::LoadAesIv { data: block })?;
        }

        for _ in 0..count {
            let seg_header = take(image, &mut cursor, 16)?;
            let response = self
                .connection
                .command_with_response(Command::LoadSegHeader { data: seg_header })?;
            if response.len() < 8 {
                return Err(Error::Flashing(ConnectionError::ShortRead {
                    expected: 8,
                    got: response.len(),
                }));
            }

            // the ROM answers with the decrypted header; its length field is
            // the number of payload bytes it now expects
            let mut seg_len =
                u32::from_le_bytes(response[4..8].try_into().unwrap()) as usize;
            if encrypt != 0 {
                seg_len = seg_len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
            }

            let mut remaining = seg_len;
            while remaining > 0 {
                let chunk_len = remaining.min(SEGMENT_CHUNK);
                let chunk = take(image, &mut cursor, chunk_len)?;
                self.connection.command(Command::LoadSegData { data: chunk })?;
                remaining -= chunk_len;
            }
        }

        self.connection.command(Command::CheckImage)
    }

    /// Jump into the downloaded image. Chips with a pre-run patch get it
    /// substituted as the command payload.
    pub fn run_image(&mut self) -> Result<(), Error> {
        let payload = self.connection.chip().pre_run_patch().unwrap_or_default();
        sleep(Duration::from_millis(100));
        self.connection.command(Command::RunImage { payload })
    }

    pub fn reset_cpu(&mut self) -> Result<(), Error> {
        self.connection.command(Command::Reset)
    }

    /// Raw efuse readback, for diagnostics.
    pub fn read_efuse(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, Error> {
        self.connection
            .command_with_response(Command::EfuseRead { addr, len })
    }
}

fn take<'b>(image: &'b [u8], cursor: &mut usize, len: usize) -> Result<&'b [u8], Error> {
    let end = *cursor + len;
    if end > image.len() {
        return Err(Error::Flashing(ConnectionError::ShortRead {
            expected: len,
            got: image.len().saturating_sub(*cursor),
        }));
    }
    let slice = &image[*cursor..end];
    *cursor = end;
    Ok(slice)
}

/// Pick the actual file to transmit for `path`, honoring the
/// encryption-at-rest fallback chain: fresh key material builds an encrypted
/// sibling, a fused device looks for a pre-built one, everything else loads
/// the plain file.
pub fn select_image_file(
    path: &Path,
    device_sign: u8,
    device_encrypt: u8,
    keys: builder::KeyMaterial,
    chip: Chip,
) -> Result<PathBuf, Error> {
    let encrypt_requested = keys.aes_key.is_some() && keys.aes_iv.is_some();

    if encrypt_requested || keys.keypair.is_some() {
        let image = fs::read(path).map_err(|e| Error::FileOpen(path.display().to_string(), e))?;

        let encrypted = builder::encrypt_loader_bin(chip, &image, keys)?;
        let out = encrypt_sibling(path);
        fs::write(&out, &encrypted)
            .map_err(|e| Error::FileWrite(out.display().to_string(), e))?;
        return Ok(out);
    }

    if device_sign != 0 || device_encrypt != 0 {
        let sibling = encrypt_sibling(path);
        if sibling.exists() {
            return Ok(sibling);
        }
        warn!(
            "Device is fused for sign/encrypt but {} has no encrypted sibling",
            path.display()
        );
    }

    Ok(path.to_path_buf())
}

/// `fw.bin` -> `fw_encrypt.bin`.
fn encrypt_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_encrypt{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chip::BFLB_MAGIC,
        connection::reset::ResetConfig,
        image::builder::{build, BuildBody, BuildInput, ImageMode, KeyMaterial},
        transport::ScriptTransport,
    };

    const OK: [u8; 2] = [0x4F, 0x4B];

    fn fast_options() -> LoadOptions {
        LoadOptions {
            handshake: HandshakeOptions {
                attempts: 1,
                reset: ResetConfig {
                    hold_ms: 1,
                    shake_delay_ms: 1,
                    ..ResetConfig::default()
                },
                ..HandshakeOptions::default()
            },
            ..LoadOptions::default()
        }
    }

    /// Plain boot info for bl602: chip id at 12..18, modes at 4/5.
    fn boot_info_bytes(chip_id: &[u8; 6]) -> Vec<u8> {
        let mut raw = vec![0u8; 20];
        raw[12..18].copy_from_slice(chip_id);
        raw
    }

    fn response(payload: &[u8]) -> Vec<u8> {
        let mut script = OK.to_vec();
        script.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        script.extend_from_slice(payload);
        script
    }

    fn unsigned_image() -> Vec<u8> {
        let mut header = vec![0u8; Chip::Bl602.params().header_len];
        header[..4].copy_from_slice(&BFLB_MAGIC.to_le_bytes());

        let mut seg_header = vec![0u8; 12];
        seg_header[..4].copy_from_slice(&0x2200_0000u32.to_le_bytes());

        build(
            BuildInput {
                chip: Chip::Bl602,
                header,
                body: BuildBody::Segments(vec![(seg_header, vec![0x11; 10])]),
                keys: KeyMaterial::default(),
            },
            ImageMode::Ram,
        )
        .unwrap()
        .whole
    }

    /// A full happy-path script: handshake OK, boot info, then an OK for
    /// every command the loader issues.
    fn happy_script(image: &[u8]) -> Vec<u8> {
        let mut script = OK.to_vec(); // handshake
        script.extend_from_slice(&response(&boot_info_bytes(b"\x01\x02\x03\x04\x05\x06")));
        script.extend_from_slice(&OK); // load_boot_header

        // load_seg_header answers with the decrypted 16-byte header
        let header_len = Chip::Bl602.params().header_len;
        script.extend_from_slice(&response(&image[header_len..header_len + 16]));

        script.extend_from_slice(&OK); // load_seg_data
        script.extend_from_slice(&OK); // check_image
        script
    }

    fn connection(script: &[u8]) -> Connection {
        Connection::new(Box::new(ScriptTransport::new(script, 500_000)), Chip::Bl602)
    }

    #[test]
    fn happy_path_streams_all_segments() {
        let image = unsigned_image();
        let mut conn = connection(&happy_script(&image));

        let mut loader = Loader::new(&mut conn, None);
        let info = loader.load_image(&image, &fast_options()).unwrap();
        assert_eq!(info.chip_id, "060504030201");
    }

    #[test]
    fn duplicate_chip_short_circuits_before_any_segment() {
        let image = unsigned_image();
        let registry = ChipRegistry::new();
        let options = fast_options();

        let mut conn = connection(&happy_script(&image));
        Loader::new(&mut conn, Some(&registry))
            .load_image(&image, &options)
            .unwrap();

        // Same chip id again. The script ends right after boot info, so any
        // transmitted segment would have failed on a missing ACK instead of
        // short-circuiting.
        let mut script = OK.to_vec();
        script.extend_from_slice(&response(&boot_info_bytes(b"\x01\x02\x03\x04\x05\x06")));
        let mut conn = connection(&script);
        let err = Loader::new(&mut conn, Some(&registry))
            .load_image(&image, &options)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateChip(_)));
    }

    #[test]
    fn eflash_loader_answer_is_detected() {
        let mut raw = vec![0xFFu8; 20];
        raw[12] = 0;
        assert!(matches!(
            BootInfo::parse(Chip::Bl602, raw),
            Err(Error::EflashLoaderPresent)
        ));
    }

    #[test]
    fn chip_id_is_reversed_on_bl602_but_not_bl702() {
        let mut raw = vec![0u8; 24];
        raw[12..18].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let info = BootInfo::parse(Chip::Bl602, raw.clone()).unwrap();
        assert_eq!(info.chip_id, "060504030201");

        raw[16..24].copy_from_slice(&[0xA, 0xB, 0xC, 0xD, 0xE, 0xF, 0x10, 0x11]);
        let info = BootInfo::parse(Chip::Bl702, raw).unwrap();
        assert_eq!(info.chip_id, "0a0b0c0d0e0f1011");
    }

    #[test]
    fn mode_mismatch_aborts_before_transmission() {
        let mut image = unsigned_image();
        image[116] |= 0x1; // claim signed

        let mut conn = connection(&{
            let mut script = OK.to_vec();
            script.extend_from_slice(&response(&boot_info_bytes(b"\xAA\xBB\xCC\xDD\xEE\xFF")));
            script
        });

        let err = Loader::new(&mut conn, None)
            .load_image(&image, &fast_options())
            .unwrap_err();
        assert!(matches!(err, Error::FormatMismatch { .. }));
    }

    #[test]
    fn registry_reports_repeats() {
        let registry = ChipRegistry::new();
        assert!(registry.register("abc"));
        assert!(!registry.register("abc"));
        assert!(registry.contains("abc"));
        assert!(!registry.contains("def"));
    }

    #[test]
    fn image_file_selection_follows_fallback_chain() {
        let dir = std::env::temp_dir().join(format!("blflash-select-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let plain = dir.join("fw.bin");
        fs::write(&plain, unsigned_image()).unwrap();

        // plain device, no key material: the original file goes out as-is
        let picked =
            select_image_file(&plain, 0, 0, KeyMaterial::default(), Chip::Bl602).unwrap();
        assert_eq!(picked, plain);

        // fused device without fresh keys: a pre-built sibling wins
        let sibling = dir.join("fw_encrypt.bin");
        fs::write(&sibling, [0u8; 4]).unwrap();
        let picked =
            select_image_file(&plain, 1, 0, KeyMaterial::default(), Chip::Bl602).unwrap();
        assert_eq!(picked, sibling);

        // fresh key material rebuilds the sibling from the plain image
        let keys = KeyMaterial {
            aes_key: Some(vec![0x5A; 16]),
            aes_iv: Some([0x24; 16]),
            keypair: None,
        };
        let picked = select_image_file(&plain, 0, 1, keys, Chip::Bl602).unwrap();
        assert_eq!(picked, sibling);
        let rebuilt = fs::read(&sibling).unwrap();
        assert!(rebuilt.len() > Chip::Bl602.params().header_len);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn encrypt_sibling_name() {
        assert_eq!(
            encrypt_sibling(Path::new("out/fw.bin")),
            PathBuf::from("out/fw_encrypt.bin")
        );
    }
}
