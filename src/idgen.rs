//! Time-sortable 128-bit site identifiers (UUID v7 layout).

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{CloudsyncError, Result};

/// A 16-byte site identifier: 48-bit millisecond timestamp prefix (for
/// sortability), 74 random bits, with the version/variant bits of a v7 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId([u8; 16]);

impl SiteId {
    /// Generate a new site id stamped with the current wall-clock time.
    pub fn new() -> Self {
        Self::at(now_millis())
    }

    /// Generate a site id stamped with an explicit millisecond timestamp.
    /// Exposed for deterministic tests; production callers use [`SiteId::new`].
    pub fn at(timestamp_ms: u64) -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);

        let ts = (timestamp_ms & 0xFFFF_FFFF_FFFF).to_be_bytes();
        bytes[0..6].copy_from_slice(&ts[2..8]);

        bytes[6] = (bytes[6] & 0x0F) | 0x70; // version nibble = 7
        bytes[8] = (bytes[8] & 0x3F) | 0x80; // variant bits = 10

        SiteId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SiteId(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 16 {
            return Err(CloudsyncError::Integrity(format!(
                "site id must be 16 bytes, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(slice);
        Ok(SiteId(bytes))
    }

    /// 48-bit millisecond timestamp encoded in the first 6 bytes.
    pub fn timestamp_ms(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(buf)
    }

    /// 32 lowercase hex characters, no separators.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Grouped `8-4-4-4-12` hex form.
    pub fn to_grouped(&self) -> String {
        let hex = self.to_hex();
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        if cleaned.len() != 32 {
            return Err(CloudsyncError::Integrity(format!(
                "malformed site id string: {s}"
            )));
        }
        let mut bytes = [0u8; 16];
        for i in 0..16 {
            bytes[i] = u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16)
                .map_err(|_| CloudsyncError::Integrity(format!("malformed site id string: {s}")))?;
        }
        Ok(SiteId(bytes))
    }

    /// Total order: timestamp prefix is the major key, remaining bytes
    /// (including version/variant and random bits) break ties
    /// lexicographically.
    pub fn compare(&self, other: &SiteId) -> Ordering {
        match self.timestamp_ms().cmp(&other.timestamp_ms()) {
            Ordering::Equal => self.0[6..16].cmp(&other.0[6..16]),
            ord => ord,
        }
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialOrd for SiteId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for SiteId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_grouped())
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_timestamp_sorts_greater() {
        let a = SiteId::at(1_000);
        let b = SiteId::at(2_000);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn hex_roundtrip() {
        let id = SiteId::at(123_456_789);
        let hex = id.to_hex();
        let back = SiteId::from_hex(&hex).unwrap();
        assert_eq!(id, back);
        let grouped = id.to_grouped();
        let back2 = SiteId::from_hex(&grouped).unwrap();
        assert_eq!(id, back2);
    }

    #[test]
    fn version_and_variant_bits_set() {
        let id = SiteId::at(1);
        assert_eq!(id.as_bytes()[6] & 0xF0, 0x70);
        assert_eq!(id.as_bytes()[8] & 0xC0, 0x80);
    }

    #[test]
    fn grouped_form_has_expected_dashes() {
        let id = SiteId::at(42);
        let grouped = id.to_grouped();
        assert_eq!(grouped.len(), 36);
        assert_eq!(grouped.matches('-').count(), 4);
    }
}
