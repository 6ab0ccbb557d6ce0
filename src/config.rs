//! Image-build configuration
//!
//! The build is driven by a flat key/value map (loaded by the caller from
//! whatever source it likes); [`Config`] is the typed view over the keys the
//! builder and loader understand. Multi-valued keys use the vendor list
//! conventions: segment header files are space-separated, segment data files
//! pipe-separated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    map: HashMap<String, String>,
}

impl Config {
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(key.to_string(), value.into());
    }

    /// Empty values count as absent, matching the ini files these maps come
    /// from.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str, Error> {
        self.get(key).ok_or(Error::MissingConfigKey(key))
    }

    pub fn aes_key(&self) -> Option<&str> {
        self.get("aes_key_org")
    }

    pub fn aes_iv(&self) -> Option<&str> {
        self.get("aes_iv")
    }

    pub fn public_key_file(&self) -> Option<&str> {
        self.get("publickey_file")
    }

    pub fn private_key_file(&self) -> Option<&str> {
        self.get("privatekey_file_uecc")
    }

    pub fn boot_header_file(&self) -> Result<&str, Error> {
        self.require("boot_header_file")
    }

    pub fn segment_header_files(&self) -> Vec<&str> {
        self.get("segheader_file")
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn segment_data_files(&self) -> Vec<&str> {
        self.get("segdata_file")
            .map(|v| v.split('|').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn bootinfo_file(&self) -> Result<&str, Error> {
        self.require("bootinfo_file")
    }

    pub fn img_file(&self) -> Result<&str, Error> {
        self.require("img_file")
    }

    pub fn whole_img_file(&self) -> Result<&str, Error> {
        self.require("whole_img_file")
    }

    pub fn efuse_file(&self) -> Result<&str, Error> {
        self.require("efuse_file")
    }

    pub fn efuse_mask_file(&self) -> Result<&str, Error> {
        self.require("efuse_mask_file")
    }

    /// Key/IV pair for encrypting the efuse blob itself in security mode.
    pub fn security_key(&self) -> Option<&str> {
        self.get("security_key")
    }

    pub fn security_iv(&self) -> Option<&str> {
        self.get("security_iv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_keys_split_on_their_separators() {
        let mut cfg = Config::default();
        cfg.insert("segheader_file", "a.bin b.bin  c.bin");
        cfg.insert("segdata_file", "x.bin|y.bin");

        assert_eq!(cfg.segment_header_files(), vec!["a.bin", "b.bin", "c.bin"]);
        assert_eq!(cfg.segment_data_files(), vec!["x.bin", "y.bin"]);
    }

    #[test]
    fn empty_values_count_as_absent() {
        let mut cfg = Config::default();
        cfg.insert("aes_key_org", "");
        assert_eq!(cfg.aes_key(), None);
        assert!(matches!(
            cfg.boot_header_file(),
            Err(Error::MissingConfigKey("boot_header_file"))
        ));
    }
}
