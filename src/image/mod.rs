//! On-flash image structures
//!
//! A firmware image is a variant-length boot header, an optional public-key
//! and signature block, an optional AES-IV block and the segment (or raw
//! firmware) body. Everything integrity-related is CRC32; the header carries
//! a SHA-256 of the body.

pub mod builder;
pub mod efuse;

use bytemuck::{Pod, Zeroable};

use crate::{
    chip::{Chip, BFLB_MAGIC},
    crypto::{crc32, crc32_bytes},
    error::Error,
};

/// Flags byte offset inside the boot header (sign/encrypt/key-select).
const FLAGS_OFFSET: usize = 116;
/// Offset of the crc-ignore / hash-ignore byte.
const IGNORE_OFFSET: usize = 118;
/// Length of the SHA-256 field.
const HASH_LEN: usize = 32;

/// A chip's boot header, manipulated in place through the variant's offset
/// table.
#[derive(Debug, Clone)]
pub struct BootHeader {
    chip: Chip,
    bytes: Vec<u8>,
}

impl BootHeader {
    /// Take ownership of a raw header, validating magic and length.
    pub fn parse(chip: Chip, bytes: Vec<u8>) -> Result<Self, Error> {
        let params = chip.params();
        if bytes.len() != params.header_len {
            return Err(Error::BadHeaderLength {
                expected: params.header_len,
                got: bytes.len(),
            });
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != BFLB_MAGIC {
            return Err(Error::BadMagic(magic));
        }

        Ok(Self { chip, bytes })
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Sign mode, bits [1:0] of the flags byte.
    pub fn sign(&self) -> u8 {
        self.bytes[FLAGS_OFFSET] & 0x3
    }

    /// Encrypt mode, bits [3:2] of the flags byte.
    pub fn encrypt(&self) -> u8 {
        (self.bytes[FLAGS_OFFSET] >> 2) & 0x3
    }

    /// Key-select, bits [5:4] of the flags byte.
    pub fn key_sel(&self) -> u8 {
        (self.bytes[FLAGS_OFFSET] >> 4) & 0x3
    }

    pub fn set_sign(&mut self, sign: u8) {
        self.bytes[FLAGS_OFFSET] = (self.bytes[FLAGS_OFFSET] & !0x3) | (sign & 0x3);
    }

    pub fn set_encrypt(&mut self, encrypt: u8) {
        self.bytes[FLAGS_OFFSET] = (self.bytes[FLAGS_OFFSET] & !0xC) | ((encrypt & 0x3) << 2);
    }

    pub fn crc_ignore(&self) -> bool {
        self.bytes[IGNORE_OFFSET] & 0x1 != 0
    }

    pub fn hash_ignore(&self) -> bool {
        (self.bytes[IGNORE_OFFSET] >> 1) & 0x1 != 0
    }

    /// Segment count for segmented images; total body length for whole-flash
    /// images. Same field either way.
    pub fn segment_count(&self) -> u32 {
        let off = self.chip.params().segment_count_offset;
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    pub fn set_segment_count(&mut self, count: u32) {
        let off = self.chip.params().segment_count_offset;
        self.bytes[off..off + 4].copy_from_slice(&count.to_le_bytes());
    }

    /// Offset of the firmware body inside a whole-flash image.
    pub fn image_offset(&self) -> u32 {
        let off = self.chip.params().image_offset_offset;
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    /// Store the body hash, unless the header asks for it to be skipped and
    /// the image is unsigned (signed images always carry the hash).
    pub fn set_hash(&mut self, hash: &[u8; HASH_LEN]) {
        if self.hash_ignore() && self.sign() == 0 {
            return;
        }
        let off = self.chip.params().hash_offset;
        self.bytes[off..off + HASH_LEN].copy_from_slice(hash);
    }

    /// Recompute the trailing CRC32 over bytes [0, len-4). A header with the
    /// crc-ignore flag set is never mutated.
    pub fn update_crc(&mut self) {
        if self.crc_ignore() {
            return;
        }
        let body_end = self.bytes.len() - 4;
        let crc = crc32_bytes(&self.bytes[..body_end]);
        self.bytes[body_end..].copy_from_slice(&crc);
    }
}

/// The 12 stored fields of a segment header; its CRC32 is appended on the
/// wire for 16 bytes total.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SegmentHeader {
    pub dest_addr: u32,
    /// Logical payload length, before any block padding.
    pub len: u32,
    /// CRC32 of the payload including padding bytes.
    pub data_crc: u32,
}

impl SegmentHeader {
    pub const WIRE_LEN: usize = 16;

    pub fn parse(bytes: &[u8; 12]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    /// Stored fields plus the trailing header CRC32.
    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        let body = bytemuck::bytes_of(&self);
        out[..12].copy_from_slice(body);
        out[12..].copy_from_slice(&crc32_bytes(body));
        out
    }
}

/// Public key block: x ‖ y coordinates with a trailing CRC32.
pub fn public_key_block(xy: &[u8; 64]) -> Vec<u8> {
    let mut block = xy.to_vec();
    block.extend_from_slice(&crc32_bytes(xy));
    block
}

/// Signature block: 4-byte LE length, raw r ‖ s, CRC32 over length ‖
/// signature.
pub fn signature_block(signature: &[u8; 64]) -> Vec<u8> {
    let mut block = (signature.len() as u32).to_le_bytes().to_vec();
    block.extend_from_slice(signature);
    let crc = crc32(&block);
    block.extend_from_slice(&crc.to_le_bytes());
    block
}

/// AES-IV block: the 16-byte IV with a trailing CRC32.
pub fn iv_block(iv: &[u8; 16]) -> Vec<u8> {
    let mut block = iv.to_vec();
    block.extend_from_slice(&crc32_bytes(iv));
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_template(chip: Chip) -> Vec<u8> {
        let mut bytes = vec![0u8; chip.params().header_len];
        bytes[..4].copy_from_slice(&BFLB_MAGIC.to_le_bytes());
        bytes
    }

    #[test]
    fn flag_fields_round_trip() {
        let mut header = BootHeader::parse(Chip::Bl602, header_template(Chip::Bl602)).unwrap();
        header.set_sign(1);
        header.set_encrypt(2);
        assert_eq!(header.sign(), 1);
        assert_eq!(header.encrypt(), 2);
        assert_eq!(header.key_sel(), 0);
    }

    #[test]
    fn crc_recompute_is_idempotent() {
        let mut header = BootHeader::parse(Chip::Bl602, header_template(Chip::Bl602)).unwrap();
        header.set_segment_count(3);
        header.update_crc();
        let once = header.as_bytes().to_vec();
        header.update_crc();
        assert_eq!(header.as_bytes(), &once[..]);

        let len = once.len();
        assert_eq!(
            &once[len - 4..],
            &crc32_bytes(&once[..len - 4]),
        );
    }

    #[test]
    fn crc_ignore_leaves_header_untouched() {
        let mut bytes = header_template(Chip::Bl602);
        bytes[IGNORE_OFFSET] |= 0x1;
        let mut header = BootHeader::parse(Chip::Bl602, bytes.clone()).unwrap();
        header.update_crc();
        assert_eq!(header.as_bytes(), &bytes[..]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = vec![0u8; Chip::Bl602.params().header_len];
        assert!(matches!(
            BootHeader::parse(Chip::Bl602, bytes),
            Err(Error::BadMagic(0))
        ));
    }

    #[test]
    fn segment_header_wire_form_appends_crc() {
        let header = SegmentHeader {
            dest_addr: 0x2200_0000,
            len: 10,
            data_crc: 0xDEAD_BEEF,
        };
        let wire = header.to_wire();
        assert_eq!(&wire[..4], &0x2200_0000u32.to_le_bytes());
        assert_eq!(&wire[12..], &crc32_bytes(&wire[..12]));
    }

    #[test]
    fn signature_block_crc_covers_length_and_signature() {
        let block = signature_block(&[0x42u8; 64]);
        assert_eq!(block.len(), 4 + 64 + 4);
        assert_eq!(&block[..4], &64u32.to_le_bytes());
        assert_eq!(&block[68..], &crc32_bytes(&block[..68]));
    }
}
