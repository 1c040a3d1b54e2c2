//! In-memory database shared by both store implementations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;

use netguard_core::{DeviceSnapshot, DeviceState, ScanSummary, StateTransition};
use serde::{Deserialize, Serialize};

use crate::{CycleRecord, Result, StoreError};

/// Snapshots kept per device; older ones are dropped on write.
pub(crate) const SNAPSHOT_RETENTION: usize = 20;

/// Scan summaries kept; older ones are dropped on write. The transition
/// log is the audit trail and is never trimmed, so the document still
/// grows with the number of state changes.
pub(crate) const SCAN_RETENTION: usize = 1_000;

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    devices: BTreeMap<IpAddr, DeviceState>,
    transitions: Vec<StateTransition>,
    scans: Vec<ScanSummary>,
    snapshots: BTreeMap<IpAddr, VecDeque<DeviceSnapshot>>,
}

/// On-disk layout of [`StoreState`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreDocument {
    pub version: u32,
    pub devices: Vec<DeviceState>,
    pub transitions: Vec<StateTransition>,
    pub scans: Vec<ScanSummary>,
    pub snapshots: Vec<DeviceSnapshot>,
}

pub(crate) const DOCUMENT_VERSION: u32 = 1;

impl StoreState {
    pub fn device(&self, address: IpAddr) -> Option<DeviceState> {
        self.devices.get(&address).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceState> {
        self.devices.values().cloned().collect()
    }

    pub fn upsert_device(&mut self, device: &DeviceState) {
        self.devices.insert(device.address, device.clone());
    }

    pub fn append_transition(&mut self, transition: &StateTransition) -> Result<()> {
        if !self.devices.contains_key(&transition.address) {
            return Err(StoreError::UnknownDevice(transition.address));
        }
        self.transitions.push(transition.clone());
        Ok(())
    }

    pub fn apply_operator_change(
        &mut self,
        device: &DeviceState,
        transition: Option<&StateTransition>,
    ) -> Result<()> {
        if let Some(t) = transition {
            if t.address != device.address {
                return Err(StoreError::InvalidRecord(format!(
                    "transition for {} does not match device {}",
                    t.address, device.address
                )));
            }
        }
        self.upsert_device(device);
        if let Some(t) = transition {
            self.transitions.push(t.clone());
        }
        Ok(())
    }

    /// Check a cycle record against the current state without mutating it.
    fn validate_cycle(&self, record: &CycleRecord) -> Result<()> {
        let mut seen = BTreeSet::new();
        for device in &record.devices {
            if !seen.insert(device.address) {
                return Err(StoreError::InvalidRecord(format!(
                    "device {} appears more than once",
                    device.address
                )));
            }
        }

        for t in &record.transitions {
            if !seen.contains(&t.address) && !self.devices.contains_key(&t.address) {
                return Err(StoreError::UnknownDevice(t.address));
            }
        }

        Ok(())
    }

    pub fn apply_cycle(&mut self, record: &CycleRecord) -> Result<()> {
        self.validate_cycle(record)?;

        for device in &record.devices {
            self.upsert_device(device);
        }
        self.transitions.extend(record.transitions.iter().cloned());
        if let Some(summary) = &record.summary {
            self.scans.push(summary.clone());
            trim_front(&mut self.scans, SCAN_RETENTION);
        }
        for snapshot in &record.snapshots {
            self.push_snapshot(snapshot.clone());
        }

        Ok(())
    }

    fn push_snapshot(&mut self, snapshot: DeviceSnapshot) {
        let history = self.snapshots.entry(snapshot.device.address).or_default();
        history.push_back(snapshot);
        while history.len() > SNAPSHOT_RETENTION {
            history.pop_front();
        }
    }

    pub fn transitions(&self, address: Option<IpAddr>) -> Vec<StateTransition> {
        self.transitions
            .iter()
            .filter(|t| address.map_or(true, |a| t.address == a))
            .cloned()
            .collect()
    }

    pub fn scan_history(&self, limit: usize) -> Vec<ScanSummary> {
        self.scans.iter().rev().take(limit).cloned().collect()
    }

    pub fn snapshots(&self, address: IpAddr, limit: usize) -> Vec<DeviceSnapshot> {
        let Some(history) = self.snapshots.get(&address) else {
            return Vec::new();
        };
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn to_document(&self) -> StoreDocument {
        StoreDocument {
            version: DOCUMENT_VERSION,
            devices: self.devices(),
            transitions: self.transitions.clone(),
            scans: self.scans.clone(),
            snapshots: self.snapshots.values().flatten().cloned().collect(),
        }
    }

    pub fn from_document(doc: StoreDocument) -> Self {
        let mut state = Self {
            devices: doc.devices.into_iter().map(|d| (d.address, d)).collect(),
            transitions: doc.transitions,
            scans: doc.scans,
            snapshots: BTreeMap::new(),
        };
        trim_front(&mut state.scans, SCAN_RETENTION);
        for snapshot in doc.snapshots {
            state.push_snapshot(snapshot);
        }
        state
    }
}

fn trim_front<T>(items: &mut Vec<T>, keep: usize) {
    let excess = items.len().saturating_sub(keep);
    items.drain(..excess);
}
