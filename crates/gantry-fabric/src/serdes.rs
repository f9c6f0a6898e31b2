//! Keyed serialization for metadata blobs.
//!
//! Connection info and memory keys cross the bootstrap channel as
//! key/value blobs: a flat little-endian sequence of
//! `[key_len: u16][key][value_len: u32][value]` entries. Values are
//! opaque bytes; helpers cover the `u64` and string cases the rail
//! manager needs.

use std::collections::BTreeMap;

use thiserror::Error;

/// Failures while building or parsing a keyed blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerDesError {
    /// The blob ended inside an entry.
    #[error("truncated blob at offset {0}")]
    Truncated(usize),

    /// A required key is absent.
    #[error("missing key: {0}")]
    MissingKey(String),

    /// A value had the wrong width for the requested type.
    #[error("bad value width for key {key}: got {got} bytes")]
    BadWidth {
        /// The key whose value was malformed.
        key: String,
        /// Actual value width.
        got: usize,
    },

    /// A key was not valid UTF-8.
    #[error("malformed key at offset {0}")]
    MalformedKey(usize),
}

/// Builder/parser for keyed blobs. Keys are unique; re-adding replaces.
#[derive(Debug, Default, Clone)]
pub struct SerDes {
    entries: BTreeMap<String, Vec<u8>>,
}

impl SerDes {
    /// Start an empty blob.
    pub fn new() -> Self {
        SerDes::default()
    }

    /// Add raw bytes under `key`.
    pub fn add_buf(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec());
    }

    /// Add a little-endian `u64` under `key`.
    pub fn add_u64(&mut self, key: &str, value: u64) {
        self.add_buf(key, &value.to_le_bytes());
    }

    /// Add a UTF-8 string under `key`.
    pub fn add_str(&mut self, key: &str, value: &str) {
        self.add_buf(key, value.as_bytes());
    }

    /// Raw bytes stored under `key`.
    pub fn get_buf(&self, key: &str) -> Result<&[u8], SerDesError> {
        self.entries
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| SerDesError::MissingKey(key.to_string()))
    }

    /// True when `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// `u64` stored under `key`.
    pub fn get_u64(&self, key: &str) -> Result<u64, SerDesError> {
        let buf = self.get_buf(key)?;
        let bytes: [u8; 8] = buf
            .try_into()
            .map_err(|_| SerDesError::BadWidth { key: key.to_string(), got: buf.len() })?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// UTF-8 string stored under `key`. Lossy on invalid sequences, as
    /// values are opaque bytes by contract.
    pub fn get_str(&self, key: &str) -> Result<String, SerDesError> {
        Ok(String::from_utf8_lossy(self.get_buf(key)?).into_owned())
    }

    /// Flatten to the wire representation.
    pub fn export(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    /// Parse a wire blob.
    pub fn import(data: &[u8]) -> Result<Self, SerDesError> {
        let mut entries = BTreeMap::new();
        let mut off = 0usize;
        while off < data.len() {
            let key_len = read_u16(data, &mut off)? as usize;
            let key_bytes = read_slice(data, &mut off, key_len)?;
            let key = std::str::from_utf8(key_bytes)
                .map_err(|_| SerDesError::MalformedKey(off - key_len))?
                .to_string();
            let value_len = read_u32(data, &mut off)? as usize;
            let value = read_slice(data, &mut off, value_len)?.to_vec();
            entries.insert(key, value);
        }
        Ok(SerDes { entries })
    }
}

fn read_u16(data: &[u8], off: &mut usize) -> Result<u16, SerDesError> {
    let bytes = read_slice(data, off, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], off: &mut usize) -> Result<u32, SerDesError> {
    let bytes = read_slice(data, off, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_slice<'a>(data: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8], SerDesError> {
    let end = off.checked_add(len).ok_or(SerDesError::Truncated(*off))?;
    if end > data.len() {
        return Err(SerDesError::Truncated(*off));
    }
    let slice = &data[*off..end];
    *off = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut sd = SerDes::new();
        sd.add_u64("count", 4);
        sd.add_str("srcdata_ep_0", "nic0#1");
        sd.add_buf("blob", &[0xDE, 0xAD]);

        let parsed = SerDes::import(&sd.export()).unwrap();
        assert_eq!(parsed.get_u64("count").unwrap(), 4);
        assert_eq!(parsed.get_str("srcdata_ep_0").unwrap(), "nic0#1");
        assert_eq!(parsed.get_buf("blob").unwrap(), &[0xDE, 0xAD]);
    }

    #[test]
    fn test_export_is_stable() {
        let mut a = SerDes::new();
        a.add_u64("x", 1);
        a.add_str("y", "z");
        let mut b = SerDes::new();
        b.add_str("y", "z");
        b.add_u64("x", 1);
        assert_eq!(a.export(), b.export());
    }

    #[test]
    fn test_missing_key() {
        let sd = SerDes::new();
        assert_eq!(sd.get_u64("absent").unwrap_err(), SerDesError::MissingKey("absent".into()));
    }

    #[test]
    fn test_bad_width() {
        let mut sd = SerDes::new();
        sd.add_buf("short", &[1, 2, 3]);
        assert!(matches!(sd.get_u64("short"), Err(SerDesError::BadWidth { got: 3, .. })));
    }

    #[test]
    fn test_truncated_blob() {
        let mut sd = SerDes::new();
        sd.add_str("key", "value");
        let blob = sd.export();
        assert!(matches!(SerDes::import(&blob[..blob.len() - 2]), Err(SerDesError::Truncated(_))));
    }

    #[test]
    fn test_empty_blob() {
        let sd = SerDes::import(&[]).unwrap();
        assert!(!sd.contains("anything"));
        assert!(sd.export().is_empty());
    }
}
