//! Per-host policy blacklist.
//!
//! Protocol handlers record here what went wrong with a host before
//! (or what the user chose to tolerate), and consult it on later
//! requests. Purely advisory: the scheduler itself never blocks on
//! these flags.

use indexmap::IndexMap;

bitflags::bitflags! {
    /// Per-host policy flags, OR-merged on repeated insertion.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BlacklistFlags: u32 {
        /// Do not request compressed transfer encodings.
        const NO_COMPRESSION = 1 << 0;
        /// Avoid insecure fallbacks for this host.
        const AVOID_INSECURE = 1 << 1;
        /// User accepted an invalid certificate.
        const IGNORE_CERTIFICATE = 1 << 2;
        /// User accepted a protocol downgrade.
        const IGNORE_DOWNGRADE = 1 << 3;
        /// User accepted a weak cipher.
        const IGNORE_CIPHER = 1 << 4;
    }
}

/// Hostname → policy flags. Entries never expire on their own; they
/// are dropped once every flag is cleared.
#[derive(Debug, Default)]
pub struct BlacklistTable {
    entries: IndexMap<String, BlacklistFlags>,
}

impl BlacklistTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `flags` into the entry for `host`, creating it if absent.
    pub fn add_flags(&mut self, host: &str, flags: BlacklistFlags) {
        let key = host.to_ascii_lowercase();
        let entry = self.entries.entry(key).or_default();
        *entry |= flags;
    }

    /// Clear `flags` for `host`; the entry is dropped once empty.
    pub fn remove_flags(&mut self, host: &str, flags: BlacklistFlags) {
        let key = host.to_ascii_lowercase();
        if let Some(entry) = self.entries.get_mut(&key) {
            *entry &= !flags;
            if entry.is_empty() {
                self.entries.shift_remove(&key);
            }
        }
    }

    /// Flags recorded for `host`; empty for unknown hosts.
    pub fn flags(&self, host: &str) -> BlacklistFlags {
        self.entries
            .get(&host.to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Number of blacklisted hosts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_host_is_clean() {
        let table = BlacklistTable::new();
        assert_eq!(table.flags("example.com"), BlacklistFlags::empty());
    }

    #[test]
    fn test_flags_merge() {
        let mut table = BlacklistTable::new();
        table.add_flags("example.com", BlacklistFlags::NO_COMPRESSION);
        table.add_flags("example.com", BlacklistFlags::IGNORE_CERTIFICATE);
        assert_eq!(
            table.flags("example.com"),
            BlacklistFlags::NO_COMPRESSION | BlacklistFlags::IGNORE_CERTIFICATE
        );
    }

    #[test]
    fn test_host_key_is_case_insensitive() {
        let mut table = BlacklistTable::new();
        table.add_flags("Example.COM", BlacklistFlags::AVOID_INSECURE);
        assert_eq!(table.flags("example.com"), BlacklistFlags::AVOID_INSECURE);
    }

    #[test]
    fn test_empty_entry_is_dropped() {
        let mut table = BlacklistTable::new();
        table.add_flags("example.com", BlacklistFlags::NO_COMPRESSION);
        table.remove_flags("example.com", BlacklistFlags::NO_COMPRESSION);
        assert!(table.is_empty());
    }

    #[test]
    fn test_partial_clear_keeps_entry() {
        let mut table = BlacklistTable::new();
        table.add_flags(
            "example.com",
            BlacklistFlags::NO_COMPRESSION | BlacklistFlags::IGNORE_CIPHER,
        );
        table.remove_flags("example.com", BlacklistFlags::NO_COMPRESSION);
        assert_eq!(table.flags("example.com"), BlacklistFlags::IGNORE_CIPHER);
    }
}
