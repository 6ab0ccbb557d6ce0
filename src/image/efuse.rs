//! Efuse programming blobs
//!
//! An efuse image is 128 bytes of programming data plus a 128-byte write
//! mask. Key material lands in 16-byte-aligned slots; whenever a slot is
//! populated its write-lock (and, for the flash-key slots, read-lock) bits
//! must be set in the same update, so the slot writers here do both.

use crate::{
    crypto::{aes_encrypt, crc32_bytes, AesKind, CipherMode},
    error::{CryptoError, Error},
};

pub const EFUSE_LEN: usize = 128;

/// Byte offset of key slot `n`; slots are 16 bytes apiece starting at 28.
const fn slot_offset(slot: usize) -> usize {
    28 + 16 * slot
}

/// Offset of the 4-byte lock word shared by data and mask.
const LOCK_WORD_OFFSET: usize = EFUSE_LEN - 4;

// Write-lock bit positions inside the lock word.
const WR_LOCK_KEY_SLOT_0: u32 = 19;
const WR_LOCK_KEY_SLOT_1: u32 = 20;
const WR_LOCK_KEY_SLOT_2: u32 = 21;
const WR_LOCK_KEY_SLOT_3: u32 = 22;

// Read-lock bit positions.
const RD_LOCK_KEY_SLOT_2: u32 = 28;
const RD_LOCK_KEY_SLOT_3: u32 = 29;

/// Efuse data and write mask under construction.
#[derive(Debug, Clone)]
pub struct EfuseBlob {
    data: [u8; EFUSE_LEN],
    mask: [u8; EFUSE_LEN],
    lock: u32,
}

impl Default for EfuseBlob {
    fn default() -> Self {
        Self::new()
    }
}

impl EfuseBlob {
    pub fn new() -> Self {
        Self {
            data: [0; EFUSE_LEN],
            mask: [0; EFUSE_LEN],
            lock: 0,
        }
    }

    /// Record the sign and encrypt modes in the config word. An encrypted
    /// image also fuses the encryption-enable and key-select bits.
    pub fn set_modes(&mut self, sign: u8, encrypt: Option<AesKind>) {
        if let Some(kind) = encrypt {
            self.data[0] |= kind.efuse_encrypt_type();
            self.data[0] |= 0x80 | 0x30;
        }
        self.data[0] |= (sign & 0x3) << 2;
        self.mask[0] = 0xFF;
    }

    /// Fuse the public-key hash into slots 0 and 1, write-locking both.
    pub fn set_public_key_hash(&mut self, hash: &[u8; 32]) {
        self.write_bytes(slot_offset(0), hash);
        self.lock |= 1 << WR_LOCK_KEY_SLOT_0;
        self.lock |= 1 << WR_LOCK_KEY_SLOT_1;
    }

    /// Fuse the flash AES key starting at slot 2, write- and read-locking the
    /// slots it occupies.
    pub fn set_flash_key(&mut self, key: &[u8]) -> Result<(), Error> {
        AesKind::from_key_len(key.len())?;

        self.write_bytes(slot_offset(2), key);
        self.lock |= 1 << WR_LOCK_KEY_SLOT_2;
        self.lock |= 1 << RD_LOCK_KEY_SLOT_2;
        if key.len() > 16 {
            self.lock |= 1 << WR_LOCK_KEY_SLOT_3;
            self.lock |= 1 << RD_LOCK_KEY_SLOT_3;
        }

        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        for mask in &mut self.mask[offset..offset + bytes.len()] {
            *mask = 0xFF;
        }
    }

    pub fn lock_word(&self) -> u32 {
        self.lock
    }

    /// Write the lock word into both halves and return (data, mask).
    pub fn finalize(mut self) -> ([u8; EFUSE_LEN], [u8; EFUSE_LEN]) {
        let word = self.lock.to_le_bytes();
        self.data[LOCK_WORD_OFFSET..].copy_from_slice(&word);
        self.mask[LOCK_WORD_OFFSET..].copy_from_slice(&word);
        (self.data, self.mask)
    }
}

/// Encrypt a finalized efuse data blob for security mode.
///
/// The plaintext's CRC32 is kept in the clear as a 4-byte prefix so a
/// programmer can tell encrypted from plaintext blobs without decrypting.
pub fn encrypt_blob(data: &[u8; EFUSE_LEN], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, Error> {
    let iv: &[u8; 16] = iv
        .try_into()
        .map_err(|_| CryptoError::InvalidIvLength(iv.len()))?;

    let mut out = crc32_bytes(data).to_vec();
    out.extend_from_slice(&aes_encrypt(data, key, iv, CipherMode::Cbc)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::crc32;

    #[test]
    fn slots_are_sixteen_byte_aligned_from_28() {
        assert_eq!(slot_offset(0), 28);
        assert_eq!(slot_offset(2), 60);
        assert_eq!(slot_offset(5), 108);
    }

    #[test]
    fn populated_slots_carry_their_lock_bits() {
        let mut blob = EfuseBlob::new();
        blob.set_public_key_hash(&[0x11; 32]);
        blob.set_flash_key(&[0x22; 32]).unwrap();

        let lock = blob.lock_word();
        for bit in [
            WR_LOCK_KEY_SLOT_0,
            WR_LOCK_KEY_SLOT_1,
            WR_LOCK_KEY_SLOT_2,
            WR_LOCK_KEY_SLOT_3,
            RD_LOCK_KEY_SLOT_2,
            RD_LOCK_KEY_SLOT_3,
        ] {
            assert_ne!(lock & (1 << bit), 0, "bit {bit} not set");
        }

        let (data, mask) = blob.finalize();
        assert_eq!(&data[28..60], &[0x11; 32]);
        assert_eq!(&mask[28..60], &[0xFF; 32]);
        assert_eq!(&data[124..], &lock.to_le_bytes());
        assert_eq!(&mask[124..], &lock.to_le_bytes());
    }

    #[test]
    fn short_key_locks_only_its_own_slot() {
        let mut blob = EfuseBlob::new();
        blob.set_flash_key(&[0x22; 16]).unwrap();
        let lock = blob.lock_word();
        assert_ne!(lock & (1 << WR_LOCK_KEY_SLOT_2), 0);
        assert_eq!(lock & (1 << WR_LOCK_KEY_SLOT_3), 0);
    }

    #[test]
    fn encrypt_mode_fuses_config_word() {
        let mut blob = EfuseBlob::new();
        blob.set_modes(1, Some(AesKind::Aes192));
        let (data, mask) = blob.finalize();
        // type 2, sign bit, enable + key-select bits
        assert_eq!(data[0], 0x02 | 0x04 | 0x80 | 0x30);
        assert_eq!(mask[0], 0xFF);
    }

    #[test]
    fn encrypted_blob_keeps_plaintext_crc_in_clear() {
        let data = [0x5Au8; EFUSE_LEN];
        let out = encrypt_blob(&data, &[0x01; 16], &[0x02; 16]).unwrap();
        assert_eq!(out.len(), 4 + EFUSE_LEN);
        assert_eq!(&out[..4], &crc32(&data).to_le_bytes());
        assert_ne!(&out[4..], &data[..]);
    }
}
