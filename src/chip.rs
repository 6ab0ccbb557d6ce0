//! Supported target devices
//!
//! Every variant speaks the same boot-ROM command set; what differs between
//! chips is the boot header length, a handful of field offsets and some
//! timing quirks. Those differences live in one static [`ChipParams`] table
//! that a session selects once at connect time.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

/// Boot header magic for the BL60x/BL70x family ("BFNP").
pub const BFLB_MAGIC: u32 = 0x504E4642;

/// Extra payload bl808 parts expect right after the sync burst.
const BL808_SYNC_PREAMBLE: [u8; 12] = [
    0x50, 0x00, 0x08, 0x00, 0x38, 0xF0, 0x00, 0x20, 0x00, 0x00, 0x00, 0x18,
];

/// Payload substituted for the `run_image` command body on bl702 parts; the
/// boot ROM needs these register pokes before it will jump to the image.
const BL702_PRE_RUN_PATCH: [u8; 40] = [
    0x50, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x58, 0x00, 0x04, 0x04, 0x01, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x50, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x58, 0x00,
    0x04, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// All supported devices
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// BL602, BL604
    Bl602,
    /// BL702, BL704, BL706
    Bl702,
    /// BL702L
    Bl702l,
    /// BL616, BL618
    Bl616,
    /// BL628
    Bl628,
    /// BL808
    Bl808,
}

/// How the boot-ROM timeout gets extended after `get_boot_info`, where the
/// silicon needs it at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutQuirk {
    /// Nothing to do.
    None,
    /// Issue `set_timeout` with the given duration in milliseconds; A0
    /// silicon lacks the command and takes a raw memory write instead.
    SetTimeout { ms: u32, a0_addr: u32, a0_value: u32 },
}

/// Device-specific parameters, selected once per session
#[derive(Debug, Clone, Copy)]
pub struct ChipParams {
    /// Total boot header length in bytes (0xB0..=0x160 across the family)
    pub header_len: usize,
    /// Byte offset of the 4-byte LE segment-count field inside the header
    pub segment_count_offset: usize,
    /// Byte offset of the 4-byte LE image offset field (whole-flash images)
    pub image_offset_offset: usize,
    /// Byte offset of the 32-byte SHA-256 field inside the header
    pub hash_offset: usize,
    /// boot-info byte carrying the sign mode (group 0)
    pub bootinfo_sign_offset: usize,
    /// boot-info byte carrying the encrypt mode (group 0)
    pub bootinfo_encrypt_offset: usize,
    /// Time window the 0x55 sync burst must span, in seconds
    pub sync_window: f64,
    /// Chip id is stored most-significant-first in boot-info and must be
    /// byte-reversed for display on most variants
    pub chip_id_reversed: bool,
    /// Range of boot-info bytes holding the chip id
    pub chip_id_range: (usize, usize),
    /// Second public-key/signature block expected (dual-group parts)
    pub dual_group: bool,
    pub timeout_quirk: TimeoutQuirk,
}

impl ChipParams {
    const fn new(
        header_len: usize,
        segment_count_offset: usize,
        sync_window: f64,
    ) -> Self {
        Self {
            header_len,
            segment_count_offset,
            image_offset_offset: 128,
            // hash sits 12 bytes past the segment count on every variant
            hash_offset: segment_count_offset + 12,
            bootinfo_sign_offset: 4,
            bootinfo_encrypt_offset: 5,
            sync_window,
            chip_id_reversed: true,
            chip_id_range: (12, 18),
            dual_group: false,
            timeout_quirk: TimeoutQuirk::None,
        }
    }
}

const BL602_PARAMS: ChipParams = ChipParams::new(0x0B0, 120, 0.006);

const BL702_PARAMS: ChipParams = ChipParams {
    chip_id_reversed: false,
    chip_id_range: (16, 24),
    ..ChipParams::new(0x0B0, 120, 0.003)
};

const BL702L_PARAMS: ChipParams = ChipParams {
    chip_id_reversed: false,
    chip_id_range: (16, 24),
    ..ChipParams::new(0x0F0, 120, 0.003)
};

const BL616_PARAMS: ChipParams = ChipParams {
    timeout_quirk: TimeoutQuirk::SetTimeout {
        ms: 10_000,
        a0_addr: 0x6102_DF04,
        a0_value: 0x2710_1200,
    },
    ..ChipParams::new(0x100, 132, 0.006)
};

const BL628_PARAMS: ChipParams = ChipParams {
    bootinfo_encrypt_offset: 6,
    dual_group: true,
    ..ChipParams::new(0x100, 136, 0.006)
};

const BL808_PARAMS: ChipParams = ChipParams {
    bootinfo_encrypt_offset: 6,
    dual_group: true,
    ..ChipParams::new(0x160, 140, 0.006)
};

impl Chip {
    pub fn params(&self) -> &'static ChipParams {
        match self {
            Chip::Bl602 => &BL602_PARAMS,
            Chip::Bl702 => &BL702_PARAMS,
            Chip::Bl702l => &BL702L_PARAMS,
            Chip::Bl616 => &BL616_PARAMS,
            Chip::Bl628 => &BL628_PARAMS,
            Chip::Bl808 => &BL808_PARAMS,
        }
    }

    /// boot-info byte offsets for the sign/encrypt modes of a given image
    /// group. Dual-group parts interleave group 1 right after group 0.
    pub fn bootinfo_mode_offsets(&self, group: usize) -> (usize, usize) {
        let p = self.params();
        if p.dual_group && group > 0 {
            (p.bootinfo_sign_offset + 1, p.bootinfo_encrypt_offset + 1)
        } else {
            (p.bootinfo_sign_offset, p.bootinfo_encrypt_offset)
        }
    }

    /// Extra bytes to transmit right after the sync burst, if any.
    pub fn sync_preamble(&self) -> Option<&'static [u8]> {
        match self {
            Chip::Bl808 => Some(&BL808_SYNC_PREAMBLE),
            _ => None,
        }
    }

    /// Payload substituted for the `run_image` command body, if any.
    pub fn pre_run_patch(&self) -> Option<&'static [u8]> {
        match self {
            Chip::Bl702 => Some(&BL702_PRE_RUN_PATCH),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn params_match_documented_header_lengths() {
        assert_eq!(Chip::Bl602.params().header_len, 0x0B0);
        assert_eq!(Chip::Bl702l.params().header_len, 0x0F0);
        assert_eq!(Chip::Bl616.params().header_len, 0x100);
        assert_eq!(Chip::Bl808.params().header_len, 0x160);
    }

    #[test]
    fn dual_group_offsets_shift_by_one() {
        assert_eq!(Chip::Bl808.bootinfo_mode_offsets(0), (4, 6));
        assert_eq!(Chip::Bl808.bootinfo_mode_offsets(1), (5, 7));
        // single-group parts ignore the group index
        assert_eq!(Chip::Bl602.bootinfo_mode_offsets(1), (4, 5));
    }

    #[test]
    fn chip_parses_from_str() {
        assert_eq!(Chip::from_str("bl602").unwrap(), Chip::Bl602);
        assert_eq!(Chip::from_str("bl808").unwrap(), Chip::Bl808);
        assert!(Chip::from_str("esp32").is_err());
    }
}
