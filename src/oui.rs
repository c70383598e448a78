//! MAC vendor lookup. The scan engine only depends on the `VendorLookup` trait;
//! `OuiTable` is a file-backed implementation reading either the IEEE `oui.csv`
//! export or the tab-separated `AA-BB-CC<TAB>Vendor` combined format.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::ScanError;

/// Resolves a vendor name from a MAC address
pub trait VendorLookup: Send + Sync {
    fn vendor_for_mac(&self, mac: &str) -> Option<String>;
}

/// Lookup that never matches, used when no OUI table is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVendorLookup;

impl VendorLookup for NoVendorLookup {
    fn vendor_for_mac(&self, _mac: &str) -> Option<String> {
        None
    }
}

impl<F> VendorLookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn vendor_for_mac(&self, mac: &str) -> Option<String> {
        self(mac)
    }
}

/// Normalize a MAC address to lowercase colon-separated form.
/// Accepts `:`/`-`/`.` separators and single-digit octets as printed by BSD `arp`.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let trimmed = mac.trim();
    let octets: Vec<String> = if trimmed.contains(':') || trimmed.contains('-') {
        trimmed
            .split([':', '-'])
            .map(|o| format!("{:0>2}", o.to_lowercase()))
            .collect()
    } else {
        let cleaned: String = trimmed.replace('.', "").to_lowercase();
        if cleaned.len() != 12 {
            return None;
        }
        (0..6).map(|i| cleaned[i * 2..i * 2 + 2].to_string()).collect()
    };

    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(octets.join(":"))
}

/// 24-bit OUI prefix as `aa:bb:cc`
pub fn oui_prefix(mac: &str) -> Option<String> {
    normalize_mac(mac).map(|m| m[..8].to_string())
}

/// Locally administered (randomized/private) MACs have bit 0x02 of the first octet set
pub fn is_locally_administered(mac: &str) -> bool {
    normalize_mac(mac)
        .and_then(|m| u8::from_str_radix(&m[..2], 16).ok())
        .is_some_and(|first| first & 0x02 != 0)
}

/// In-memory OUI prefix table
#[derive(Debug, Default, Clone)]
pub struct OuiTable {
    entries: HashMap<String, String>,
}

impl OuiTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, prefix: &str, vendor: &str) {
        if let Some(key) = prefix_key(prefix) {
            self.entries.insert(key, vendor.trim().to_string());
        }
    }

    /// Load a table, detecting the IEEE CSV format by its header row
    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let mut raw = String::new();
        std::fs::File::open(path)?
            .take(50_000_000)
            .read_to_string(&mut raw)?;
        let table = if raw.starts_with("Registry,") {
            Self::from_ieee_csv(&raw)?
        } else {
            Self::from_combined(&raw)
        };
        tracing::info!(path = %path.display(), entries = table.len(), "Loaded OUI table");
        Ok(table)
    }

    /// IEEE CSV columns: Registry, Assignment (6 hex chars), Organization Name, Organization Address
    pub fn from_ieee_csv(content: &str) -> Result<Self, ScanError> {
        let mut table = Self::default();
        let mut reader = csv::Reader::from_reader(content.as_bytes());

        for record in reader.records() {
            let record = record.map_err(|e| ScanError::Config(format!("OUI csv: {}", e)))?;
            let assignment = record.get(1).unwrap_or("").trim();
            let org_name = record.get(2).unwrap_or("").trim();
            if assignment.len() != 6 || org_name.is_empty() {
                continue;
            }
            table.insert(assignment, org_name);
        }
        Ok(table)
    }

    /// `AA-BB-CC<TAB>Vendor` per line; blank and `#` lines are skipped
    pub fn from_combined(content: &str) -> Self {
        let mut table = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((prefix, vendor)) = line.split_once(['\t', ' ']) else {
                continue;
            };
            let vendor = vendor.trim();
            if !vendor.is_empty() {
                table.insert(prefix, vendor);
            }
        }
        table
    }
}

impl VendorLookup for OuiTable {
    fn vendor_for_mac(&self, mac: &str) -> Option<String> {
        let prefix = oui_prefix(mac)?;
        self.entries.get(&prefix).cloned()
    }
}

fn prefix_key(prefix: &str) -> Option<String> {
    let hex: String = prefix
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    if hex.len() < 6 {
        return None;
    }
    Some(format!("{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("AA-BB-CC-DD-EE-FF"),
            Some("aa:bb:cc:dd:ee:ff".to_string())
        );
        assert_eq!(
            normalize_mac("0:1a:2b:3:4d:5e"),
            Some("00:1a:2b:03:4d:5e".to_string())
        );
        assert_eq!(
            normalize_mac("001a.2b3c.4d5e"),
            Some("00:1a:2b:3c:4d:5e".to_string())
        );
        assert_eq!(normalize_mac("(incomplete)"), None);
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:ff"), None);
    }

    #[test]
    fn test_oui_prefix() {
        assert_eq!(oui_prefix("44:19:B6:01:02:03"), Some("44:19:b6".to_string()));
    }

    #[test]
    fn test_is_locally_administered() {
        assert!(is_locally_administered("02:00:00:00:00:01"));
        assert!(is_locally_administered("da:a1:19:00:00:01"));
        assert!(!is_locally_administered("44:19:b6:00:00:01"));
        assert!(!is_locally_administered("garbage"));
    }

    #[test]
    fn test_from_ieee_csv() {
        let csv = "Registry,Assignment,Organization Name,Organization Address\n\
                   MA-L,4419B6,\"Hangzhou Hikvision Digital Technology Co.,Ltd.\",\"Hangzhou CN\"\n\
                   MA-L,AABBCC,Apple Inc.,\"1 Apple Park Way Cupertino CA US 95014\"\n";
        let table = OuiTable::from_ieee_csv(csv).unwrap();
        assert_eq!(table.vendor_for_mac("aa:bb:cc:00:11:22"), Some("Apple Inc.".to_string()));
        assert!(table.vendor_for_mac("44-19-B6-00-11-22").is_some());
    }

    #[test]
    fn test_from_combined() {
        let table = OuiTable::from_combined(
            "# comment\n00-40-8C\tAxis Communications AB\n\nBC-AD-28\tHangzhou Hikvision\n",
        );
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.vendor_for_mac("00:40:8c:12:34:56"),
            Some("Axis Communications AB".to_string())
        );
        assert_eq!(table.vendor_for_mac("11:22:33:44:55:66"), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "00-40-8C\tAxis Communications AB").unwrap();
        let table = OuiTable::load(file.path()).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |mac: &str| mac.starts_with("00:40:8c").then(|| "Axis".to_string());
        assert_eq!(lookup.vendor_for_mac("00:40:8c:00:00:01"), Some("Axis".to_string()));
        assert_eq!(NoVendorLookup.vendor_for_mac("00:40:8c:00:00:01"), None);
    }
}
