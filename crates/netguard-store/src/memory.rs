//! Volatile store backed by a lock-guarded map.

use std::net::IpAddr;

use async_trait::async_trait;
use netguard_core::{DeviceSnapshot, DeviceState, ScanSummary, StateTransition};
use tokio::sync::RwLock;

use crate::state::StoreState;
use crate::{CycleRecord, DeviceStore, Result};

/// In-process [`DeviceStore`]. Nothing survives a restart.
///
/// Every write takes the lock once and validates before mutating, so a
/// rejected cycle leaves the store untouched.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_prior_state(&self, address: IpAddr) -> Result<Option<DeviceState>> {
        Ok(self.state.read().await.device(address))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceState>> {
        Ok(self.state.read().await.devices())
    }

    async fn upsert_device(&self, device: &DeviceState) -> Result<()> {
        self.state.write().await.upsert_device(device);
        Ok(())
    }

    async fn append_transition(&self, transition: &StateTransition) -> Result<()> {
        self.state.write().await.append_transition(transition)
    }

    async fn apply_operator_change(
        &self,
        device: &DeviceState,
        transition: Option<&StateTransition>,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .apply_operator_change(device, transition)
    }

    async fn persist_cycle(&self, record: &CycleRecord) -> Result<()> {
        self.state.write().await.apply_cycle(record)?;
        tracing::debug!(
            devices = record.devices.len(),
            transitions = record.transitions.len(),
            "Cycle persisted in memory"
        );
        Ok(())
    }

    async fn transitions(&self, address: Option<IpAddr>) -> Result<Vec<StateTransition>> {
        Ok(self.state.read().await.transitions(address))
    }

    async fn scan_history(&self, limit: usize) -> Result<Vec<ScanSummary>> {
        Ok(self.state.read().await.scan_history(limit))
    }

    async fn snapshots(&self, address: IpAddr, limit: usize) -> Result<Vec<DeviceSnapshot>> {
        Ok(self.state.read().await.snapshots(address, limit))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::{SCAN_RETENTION, SNAPSHOT_RETENTION};
    use crate::StoreError;
    use chrono::{Duration, Utc};
    use netguard_core::{DiscoveryProtocol, LifecycleState, TransitionOrigin};
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    pub(crate) fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    pub(crate) fn device(last: u8, state: LifecycleState) -> DeviceState {
        let mut d = DeviceState::new(addr(last), Utc::now());
        d.state = state;
        d
    }

    pub(crate) fn summary(offset_secs: i64) -> ScanSummary {
        ScanSummary {
            scan_id: Uuid::new_v4(),
            scope: "192.168.1.0/24".to_string(),
            started_at: Utc::now() + Duration::seconds(offset_secs),
            total_devices: 1,
            vulnerable_devices: 0,
            new_devices: 1,
            transitions: 1,
            duration_ms: 1200,
        }
    }

    pub(crate) fn snapshot(device: &DeviceState) -> DeviceSnapshot {
        DeviceSnapshot {
            scan_id: Uuid::new_v4(),
            observed_at: Utc::now(),
            device: device.clone(),
            protocols: BTreeSet::from([DiscoveryProtocol::Arp]),
            reachable: true,
            rtt_ms: Some(2.5),
            loss_pct: Some(0.0),
            activity_score: 97.5,
        }
    }

    pub(crate) fn new_device_cycle(last: u8) -> CycleRecord {
        let d = device(last, LifecycleState::New);
        let t = StateTransition::new(
            &d,
            LifecycleState::Unknown,
            LifecycleState::New,
            "first seen",
            TransitionOrigin::Classifier,
            Utc::now(),
        );
        CycleRecord {
            summary: Some(summary(0)),
            snapshots: vec![snapshot(&d)],
            devices: vec![d],
            transitions: vec![t],
        }
    }

    #[tokio::test]
    async fn persist_cycle_then_read_back() {
        let store = MemoryStore::new();
        store.persist_cycle(&new_device_cycle(10)).await.unwrap();

        let prior = store.get_prior_state(addr(10)).await.unwrap().unwrap();
        assert_eq!(prior.state, LifecycleState::New);
        assert_eq!(store.transitions(None).await.unwrap().len(), 1);
        assert_eq!(store.scan_history(10).await.unwrap().len(), 1);
        assert_eq!(store.snapshots(addr(10), 20).await.unwrap().len(), 1);
        assert!(store.get_prior_state(addr(11)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_cycle_leaves_store_untouched() {
        let store = MemoryStore::new();
        let mut record = new_device_cycle(10);
        record.devices.push(record.devices[0].clone());

        let err = store.persist_cycle(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert!(store.list_devices().await.unwrap().is_empty());
        assert!(store.transitions(None).await.unwrap().is_empty());
        assert!(store.scan_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transition_for_unknown_device_is_rejected() {
        let store = MemoryStore::new();
        let mut record = new_device_cycle(10);
        record.devices.clear();

        let err = store.persist_cycle(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownDevice(a) if a == addr(10)));

        let orphan = record.transitions[0].clone();
        assert!(store.append_transition(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn scan_history_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let record = CycleRecord {
                summary: Some(summary(i)),
                ..Default::default()
            };
            store.persist_cycle(&record).await.unwrap();
        }

        let history = store.scan_history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].started_at > history[1].started_at);
    }

    #[tokio::test]
    async fn scan_history_keeps_only_recent_summaries() {
        let store = MemoryStore::new();
        let mut last = None;
        for i in 0..SCAN_RETENTION as i64 + 3 {
            let s = summary(i);
            last = Some(s.scan_id);
            let record = CycleRecord {
                summary: Some(s),
                ..Default::default()
            };
            store.persist_cycle(&record).await.unwrap();
        }

        let history = store.scan_history(usize::MAX).await.unwrap();
        assert_eq!(history.len(), SCAN_RETENTION);
        assert_eq!(Some(history[0].scan_id), last);
    }

    #[tokio::test]
    async fn snapshots_are_capped_per_device() {
        let store = MemoryStore::new();
        let d = device(10, LifecycleState::Safe);
        for _ in 0..SNAPSHOT_RETENTION + 5 {
            let record = CycleRecord {
                devices: vec![d.clone()],
                snapshots: vec![snapshot(&d)],
                ..Default::default()
            };
            store.persist_cycle(&record).await.unwrap();
        }

        assert_eq!(
            store.snapshots(addr(10), 100).await.unwrap().len(),
            SNAPSHOT_RETENTION
        );
        assert_eq!(store.snapshots(addr(10), 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn transitions_filter_by_address() {
        let store = MemoryStore::new();
        store.persist_cycle(&new_device_cycle(10)).await.unwrap();
        store.persist_cycle(&new_device_cycle(11)).await.unwrap();

        let only = store.transitions(Some(addr(11))).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].address, addr(11));
    }

    #[tokio::test]
    async fn operator_change_replaces_device_and_logs_transition() {
        let store = MemoryStore::new();
        store.persist_cycle(&new_device_cycle(10)).await.unwrap();

        let mut d = store.get_prior_state(addr(10)).await.unwrap().unwrap();
        let from = d.state;
        d.state = LifecycleState::Blocked;
        let t = StateTransition::new(
            &d,
            from,
            LifecycleState::Blocked,
            "blocked by operator",
            TransitionOrigin::Operator,
            Utc::now(),
        );
        store.apply_operator_change(&d, Some(&t)).await.unwrap();

        let stored = store.get_prior_state(addr(10)).await.unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Blocked);
        let log = store.transitions(Some(addr(10))).await.unwrap();
        assert_eq!(log.last().unwrap().origin, TransitionOrigin::Operator);
    }
}
