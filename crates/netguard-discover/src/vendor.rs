//! OUI vendor table.
//!
//! Loaded once from a CSV reference file and shared read-only. Accepts the
//! IEEE `oui.csv` layout (`Registry,Assignment,Organization Name,...`) or a
//! headerless `prefix,vendor` file.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use netguard_core::HardwareAddr;

use crate::error::Result;

const ASSIGNMENT_HEADER: &str = "assignment";
const ORGANIZATION_HEADER: &str = "organization name";

/// Immutable OUI prefix to manufacturer map.
#[derive(Debug, Clone, Default)]
pub struct VendorTable {
    entries: HashMap<[u8; 3], String>,
}

impl VendorTable {
    /// Load a table from disk. A missing or unreadable file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        tracing::info!(path = %path.display(), entries = table.len(), "Vendor table loaded");
        Ok(table)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut columns = (0, 1);
        let mut entries = HashMap::new();

        for (index, row) in csv.records().enumerate() {
            let row = row?;
            if index == 0 {
                if let Some(found) = header_columns(&row) {
                    columns = found;
                    continue;
                }
            }

            let (Some(prefix), Some(vendor)) = (row.get(columns.0), row.get(columns.1)) else {
                continue;
            };
            let vendor = vendor.trim();
            match parse_prefix(prefix) {
                Some(oui) if !vendor.is_empty() => {
                    entries.entry(oui).or_insert_with(|| vendor.to_string());
                }
                _ => tracing::debug!(row = index, "Skipping malformed vendor row"),
            }
        }

        Ok(Self { entries })
    }

    pub fn lookup(&self, mac: &HardwareAddr) -> Option<&str> {
        self.entries.get(&mac.oui()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Column positions of the IEEE header, if `row` is one.
fn header_columns(row: &csv::StringRecord) -> Option<(usize, usize)> {
    let position = |name: &str| {
        row.iter()
            .position(|field| field.trim().eq_ignore_ascii_case(name))
    };
    Some((position(ASSIGNMENT_HEADER)?, position(ORGANIZATION_HEADER)?))
}

/// `AA:BB:CC`, `AA-BB-CC` or `AABBCC` to three octets.
fn parse_prefix(raw: &str) -> Option<[u8; 3]> {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let mut oui = [0u8; 3];
    for (i, octet) in oui.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(oui)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoverError;

    fn mac(raw: &str) -> HardwareAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn reads_ieee_layout() {
        let data = "Registry,Assignment,Organization Name,Organization Address\n\
MA-L,00000C,\"Cisco Systems, Inc\",170 West Tasman Drive San Jose CA US 95134\n\
MA-L,B827EB,Raspberry Pi Foundation,Mitchell Wood House Caldecote GB CB23 7NU\n";

        let table = VendorTable::from_reader(data.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(&mac("00:00:0c:12:34:56")), Some("Cisco Systems, Inc"));
        assert_eq!(table.lookup(&mac("b8-27-eb-00-00-01")), Some("Raspberry Pi Foundation"));
        assert_eq!(table.lookup(&mac("aa:bb:cc:00:00:01")), None);
    }

    #[test]
    fn reads_headerless_two_column_layout() {
        let data = "AA:BB:CC,Acme Devices\n11-22-33,Globex\nDDEEFF,Initech\nnot-a-prefix,Nobody\n";

        let table = VendorTable::from_reader(data.as_bytes()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(&mac("aa:bb:cc:01:02:03")), Some("Acme Devices"));
        assert_eq!(table.lookup(&mac("11:22:33:44:55:66")), Some("Globex"));
        assert_eq!(table.lookup(&mac("dd:ee:ff:00:00:00")), Some("Initech"));
    }

    #[test]
    fn empty_input_is_an_empty_table() {
        let table = VendorTable::from_reader("".as_bytes()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn missing_file_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let result = VendorTable::load(dir.path().join("absent.csv"));
        assert!(matches!(result, Err(DiscoverError::Io(_))));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oui.csv");
        std::fs::write(&path, "001122,Example Corp\n").unwrap();

        let table = VendorTable::load(&path).unwrap();
        assert_eq!(table.lookup(&mac("00:11:22:33:44:55")), Some("Example Corp"));
    }
}
