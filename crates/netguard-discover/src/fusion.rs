//! Record fusion: one canonical record per address from every probe's view.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use netguard_core::{DiscoveryProtocol, HardwareAddr};
use serde::Serialize;

use crate::probe::PartialRecord;

/// Everything one cycle learned about one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedRecord {
    pub address: IpAddr,
    pub mac: Option<HardwareAddr>,
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub open_ports: BTreeSet<u16>,
    pub protocols: BTreeSet<DiscoveryProtocol>,
}

impl FusedRecord {
    fn new(address: IpAddr) -> Self {
        Self {
            address,
            mac: None,
            name: None,
            device_type: None,
            open_ports: BTreeSet::new(),
            protocols: BTreeSet::new(),
        }
    }

    fn absorb(&mut self, record: &PartialRecord) {
        match (self.mac, record.mac) {
            (None, Some(mac)) => self.mac = Some(mac),
            (Some(kept), Some(other)) if kept != other => {
                tracing::debug!(
                    address = %self.address,
                    kept = %kept,
                    ignored = %other,
                    protocol = %record.protocol,
                    "Conflicting hardware address ignored"
                );
            }
            _ => {}
        }

        prefer_longer(&mut self.name, record.name.as_deref());
        prefer_longer(&mut self.device_type, record.device_type.as_deref());
        self.open_ports.extend(&record.open_ports);
        self.protocols.insert(record.protocol);
    }
}

/// Blank and "unknown" carry no information.
fn is_placeholder(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("unknown")
}

/// Replace `current` only with a strictly longer real value, so ties keep
/// whatever arrived first.
fn prefer_longer(current: &mut Option<String>, candidate: Option<&str>) {
    let Some(candidate) = candidate.map(str::trim) else {
        return;
    };
    if is_placeholder(candidate) {
        return;
    }
    let replace = match current.as_deref() {
        None => true,
        Some(existing) => candidate.chars().count() > existing.chars().count(),
    };
    if replace {
        *current = Some(candidate.to_string());
    }
}

/// Fuse records given in probe precedence order. Output is sorted by address.
pub fn fuse<'a>(records: impl IntoIterator<Item = &'a PartialRecord>) -> Vec<FusedRecord> {
    let mut fused: BTreeMap<IpAddr, FusedRecord> = BTreeMap::new();
    for record in records {
        fused
            .entry(record.address)
            .or_insert_with(|| FusedRecord::new(record.address))
            .absorb(record);
    }
    fused.into_values().collect()
}
