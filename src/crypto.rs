//! Codec primitives shared by the image builder and the protocol driver:
//! CRC32, SHA-256, AES-CBC/ECB and ECDSA P-256 signing.

use aes::{
    cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, block_padding::NoPadding},
    Aes128, Aes192, Aes256,
};
use crc::{Crc, CRC_32_ISO_HDLC};
use p256::ecdsa::{signature::Signer, Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Error};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// AES block size; segment payloads are padded to this boundary when
/// encryption is active.
pub const AES_BLOCK_SIZE: usize = 16;

/// CRC32 (ISO-HDLC, the `binascii.crc32` polynomial) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC32 of `data` as the 4 little-endian bytes stored on flash.
pub fn crc32_bytes(data: &[u8]) -> [u8; 4] {
    crc32(data).to_le_bytes()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// AES key widths understood by the boot ROM.
///
/// The boot header's 2-bit encrypt field and the efuse `flash_encrypt_type`
/// field disagree on numbering; both mappings live here so they cannot drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesKind {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKind {
    /// Key length is implied by the hex-string length supplied in the config
    /// (32 hex chars -> AES-128, 48 -> AES-192, 64 -> AES-256).
    pub fn from_key_len(len: usize) -> Result<Self, Error> {
        match len {
            16 => Ok(AesKind::Aes128),
            24 => Ok(AesKind::Aes192),
            32 => Ok(AesKind::Aes256),
            _ => Err(CryptoError::InvalidKeyLength(len).into()),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AesKind::Aes128 => 16,
            AesKind::Aes192 => 24,
            AesKind::Aes256 => 32,
        }
    }

    /// Value of the boot header's encrypt bit field.
    pub fn header_encrypt_field(self) -> u8 {
        match self {
            AesKind::Aes128 => 1,
            AesKind::Aes256 => 2,
            AesKind::Aes192 => 3,
        }
    }

    /// Inverse of [`Self::header_encrypt_field`].
    pub fn from_header_encrypt_field(field: u8) -> Option<Self> {
        match field {
            1 => Some(AesKind::Aes128),
            2 => Some(AesKind::Aes256),
            3 => Some(AesKind::Aes192),
            _ => None,
        }
    }

    /// Value of the efuse `flash_encrypt_type` field.
    pub fn efuse_encrypt_type(self) -> u8 {
        match self {
            AesKind::Aes128 => 1,
            AesKind::Aes192 => 2,
            AesKind::Aes256 => 3,
        }
    }
}

/// Block cipher mode used for the image body.
///
/// Segmented images are chained with the supplied IV; whole-flash images are
/// encrypted ECB per 16-byte block so the target can decrypt random blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Cbc,
    Ecb,
}

/// Encrypt `plaintext` (whose length must already be a multiple of 16) with
/// the mode and key width selected by the caller.
pub fn aes_encrypt(
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8; 16],
    mode: CipherMode,
) -> Result<Vec<u8>, Error> {
    if plaintext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedPlaintext(plaintext.len()).into());
    }

    let kind = AesKind::from_key_len(key.len())?;
    let out = match (kind, mode) {
        (AesKind::Aes128, CipherMode::Cbc) => cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
        (AesKind::Aes192, CipherMode::Cbc) => cbc::Encryptor::<Aes192>::new(key.into(), iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
        (AesKind::Aes256, CipherMode::Cbc) => cbc::Encryptor::<Aes256>::new(key.into(), iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
        (AesKind::Aes128, CipherMode::Ecb) => ecb::Encryptor::<Aes128>::new(key.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
        (AesKind::Aes192, CipherMode::Ecb) => ecb::Encryptor::<Aes192>::new(key.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
        (AesKind::Aes256, CipherMode::Ecb) => ecb::Encryptor::<Aes256>::new(key.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext),
    };

    Ok(out)
}

/// Decrypt counterpart of [`aes_encrypt`]; used by tests and by the efuse
/// tooling when reading back an encrypted blob.
pub fn aes_decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8; 16],
    mode: CipherMode,
) -> Result<Vec<u8>, Error> {
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedPlaintext(ciphertext.len()).into());
    }

    let kind = AesKind::from_key_len(key.len())?;
    let out = match (kind, mode) {
        (AesKind::Aes128, CipherMode::Cbc) => cbc::Decryptor::<Aes128>::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        (AesKind::Aes192, CipherMode::Cbc) => cbc::Decryptor::<Aes192>::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        (AesKind::Aes256, CipherMode::Cbc) => cbc::Decryptor::<Aes256>::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        (AesKind::Aes128, CipherMode::Ecb) => ecb::Decryptor::<Aes128>::new(key.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        (AesKind::Aes192, CipherMode::Ecb) => ecb::Decryptor::<Aes192>::new(key.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        (AesKind::Aes256, CipherMode::Ecb) => ecb::Decryptor::<Aes256>::new(key.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
    }
    .map_err(|_| CryptoError::UnalignedPlaintext(ciphertext.len()))?;

    Ok(out)
}

/// Zero-pad `data` to the next 16-byte boundary. Padding bytes are covered by
/// the segment data CRC and are part of what gets encrypted.
pub fn pad16(data: &mut Vec<u8>) {
    let rem = data.len() % AES_BLOCK_SIZE;
    if rem != 0 {
        data.resize(data.len() + AES_BLOCK_SIZE - rem, 0);
    }
}

/// A parsed P-256 signing key together with its public half.
#[derive(Debug)]
pub struct EcKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl EcKeyPair {
    /// Load a private key from PEM text. Accepts both PKCS#8
    /// (`BEGIN PRIVATE KEY`) and SEC1 (`BEGIN EC PRIVATE KEY`) encodings.
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .or_else(|_| p256::SecretKey::from_sec1_pem(pem).map(|k| SigningKey::from(&k)))
            .map_err(|e| CryptoError::KeyParse(e.to_string()))?;
        let verifying = *signing.verifying_key();

        Ok(Self { signing, verifying })
    }

    /// Uncompressed public key coordinates, x ‖ y, 64 bytes big-endian.
    pub fn public_key_xy(&self) -> [u8; 64] {
        let point = self.verifying.to_encoded_point(false);
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(point.x().expect("uncompressed point"));
        out[32..].copy_from_slice(point.y().expect("uncompressed point"));
        out
    }

    /// ECDSA (P-256, SHA-256) over `message`, returned as raw r ‖ s.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.signing.sign(message);
        signature.to_bytes().into()
    }
}

/// Decode a hex key/IV string from the configuration surface.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, Error> {
    hex::decode(s.trim()).map_err(|_| CryptoError::InvalidHex(s.len()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_reference() {
        // binascii.crc32(b"123456789") == 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn pad16_is_idempotent_on_aligned_input() {
        let mut data = vec![0xAAu8; 32];
        pad16(&mut data);
        assert_eq!(data.len(), 32);

        let mut data = vec![0xAAu8; 10];
        pad16(&mut data);
        assert_eq!(data.len(), 16);
        assert_eq!(&data[10..], &[0u8; 6]);
    }

    #[test]
    fn aes_round_trips_for_all_key_lengths() {
        let iv = [0x24u8; 16];
        let mut plain = b"hello bouffalo".to_vec();
        pad16(&mut plain);

        for key_len in [16usize, 24, 32] {
            let key = vec![0x5Au8; key_len];
            for mode in [CipherMode::Cbc, CipherMode::Ecb] {
                let cipher = aes_encrypt(&plain, &key, &iv, mode).unwrap();
                assert_ne!(cipher, plain);
                let back = aes_decrypt(&cipher, &key, &iv, mode).unwrap();
                assert_eq!(back, plain);
            }
        }
    }

    #[test]
    fn unaligned_plaintext_is_rejected() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        assert!(aes_encrypt(&[0u8; 15], &key, &iv, CipherMode::Cbc).is_err());
    }

    #[test]
    fn header_and_efuse_numbering_differ_for_aes192() {
        assert_eq!(AesKind::Aes256.header_encrypt_field(), 2);
        assert_eq!(AesKind::Aes256.efuse_encrypt_type(), 3);
        assert_eq!(AesKind::Aes192.header_encrypt_field(), 3);
        assert_eq!(AesKind::Aes192.efuse_encrypt_type(), 2);
    }
}
