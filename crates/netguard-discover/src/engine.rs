//! Scan orchestration.
//!
//! One cycle: resolve scope → run probes concurrently → fuse → for every
//! fused host read the committed state, check reachability, classify and
//! score → sweep persisted devices that went silent → assemble the result.
//!
//! The engine never decides persistence boundaries. A cycle hands back a
//! [`PendingCycle`] that holds the engine lock; committing it persists the
//! whole result as one unit, dropping it throws the result away. Either
//! way the next cycle classifies against exactly what was committed.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use netguard_core::{
    DeviceSnapshot, DeviceState, DiscoveryProtocol, LifecycleState, ProbeWarning, ScanSummary,
    StateTransition, TransitionOrigin, WarningKind,
};
use netguard_journal::{
    CycleJournal, JournalEntry, JournalId, JournalListing, JournalQuery, JournalSession,
};
use netguard_store::{CycleRecord, DeviceStore};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::classifier::ClassifierPolicy;
use crate::config::DiscoverConfig;
use crate::error::{DiscoverError, Result};
use crate::fusion::{self, FusedRecord};
use crate::journal::{self, PendingJournal};
use crate::operator::{self, OperatorAction};
use crate::probe::{self, ProbeReport, ProbeSlot};
use crate::reachability::{self, NetworkReachability, ReachabilityCheck};
use crate::reverse_dns::{DnsReverseResolver, NameResolver};
use crate::scope::{self, Scope};
use crate::scoring;
use crate::vendor::VendorTable;

/// Everything one cycle produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub scan_id: Uuid,
    pub scope: String,
    /// Observed devices, sorted by address.
    pub devices: Vec<DeviceSnapshot>,
    /// Persisted in-scope devices missing from this cycle.
    pub absent: Vec<DeviceState>,
    pub transitions: Vec<StateTransition>,
    pub summary: ScanSummary,
    pub warnings: Vec<ProbeWarning>,
}

impl ScanOutcome {
    /// The unit handed to [`DeviceStore::persist_cycle`].
    pub fn to_record(&self) -> CycleRecord {
        CycleRecord {
            summary: Some(self.summary.clone()),
            devices: self
                .devices
                .iter()
                .map(|s| s.device.clone())
                .chain(self.absent.iter().cloned())
                .collect(),
            snapshots: self.devices.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

/// A finished cycle that still holds the engine lock.
pub struct PendingCycle {
    outcome: ScanOutcome,
    store: Arc<dyn DeviceStore>,
    journal: Option<PendingJournal>,
    _guard: OwnedMutexGuard<()>,
}

impl PendingCycle {
    pub fn outcome(&self) -> &ScanOutcome {
        &self.outcome
    }

    /// Persist the cycle atomically, journal it and release the lock.
    pub async fn commit(self) -> Result<ScanOutcome> {
        let PendingCycle {
            outcome,
            store,
            journal: pending,
            _guard,
        } = self;

        let persisted = store.persist_cycle(&outcome.to_record()).await;
        if let Some(pending) = pending {
            pending.finish(|session| match &persisted {
                Ok(()) => journal::record_cycle_results(session, &outcome),
                Err(e) => journal::record_cycle_error(session, &e.to_string()),
            });
        }
        persisted?;

        tracing::info!(
            scan_id = %outcome.scan_id,
            devices = outcome.devices.len(),
            transitions = outcome.transitions.len(),
            "Scan cycle committed"
        );
        Ok(outcome)
    }
}

/// The discovery and classification engine.
pub struct ScanEngine {
    config: DiscoverConfig,
    store: Arc<dyn DeviceStore>,
    probes: Vec<ProbeSlot>,
    reachability: Arc<dyn ReachabilityCheck>,
    names: Option<Arc<dyn NameResolver>>,
    vendors: Option<Arc<VendorTable>>,
    journal: Option<Arc<CycleJournal>>,
    policy: ClassifierPolicy,
    cycle_lock: Arc<Mutex<()>>,
}

impl ScanEngine {
    /// Engine with the network probes and reachability check from `config`.
    pub fn new(config: DiscoverConfig, store: Arc<dyn DeviceStore>) -> Self {
        Self {
            probes: probe::network_probes(&config.probes),
            reachability: Arc::new(NetworkReachability::new(&config.reachability)),
            names: DnsReverseResolver::from_config(&config.reverse_dns)
                .map(|r| Arc::new(r) as Arc<dyn NameResolver>),
            policy: ClassifierPolicy::from_config(&config.classifier),
            vendors: None,
            journal: None,
            cycle_lock: Arc::new(Mutex::new(())),
            config,
            store,
        }
    }

    pub fn with_probes(mut self, probes: Vec<ProbeSlot>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn ReachabilityCheck>) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn with_name_resolver(mut self, names: Arc<dyn NameResolver>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn with_vendor_table(mut self, vendors: Arc<VendorTable>) -> Self {
        self.vendors = Some(vendors);
        self
    }

    pub fn with_journal(mut self, journal: Arc<CycleJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &DiscoverConfig {
        &self.config
    }

    /// Run one cycle without persisting it.
    ///
    /// Fails fast with [`DiscoverError::EngineBusy`] while another cycle or
    /// operator action holds the engine.
    pub async fn run_scan_cycle(&self, requested: Option<&str>) -> Result<PendingCycle> {
        let guard = self
            .cycle_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| DiscoverError::EngineBusy)?;

        let scan_id = Uuid::new_v4();
        let mut session = self
            .journal
            .as_ref()
            .map(|j| journal::start_cycle_session(j, scan_id, requested));

        match self.execute(scan_id, requested, session.as_mut()).await {
            Ok(outcome) => Ok(PendingCycle {
                outcome,
                store: self.store.clone(),
                journal: self
                    .journal
                    .clone()
                    .zip(session)
                    .map(|(j, s)| PendingJournal::new(j, s)),
                _guard: guard,
            }),
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "Scan cycle failed");
                if let (Some(j), Some(mut s)) = (self.journal.as_ref(), session) {
                    journal::record_cycle_error(&mut s, &e.to_string());
                    j.commit(s);
                }
                Err(e)
            }
        }
    }

    /// Run one cycle and commit it.
    pub async fn scan_and_commit(&self, requested: Option<&str>) -> Result<ScanOutcome> {
        self.run_scan_cycle(requested).await?.commit().await
    }

    async fn execute(
        &self,
        scan_id: Uuid,
        requested: Option<&str>,
        mut session: Option<&mut JournalSession>,
    ) -> Result<ScanOutcome> {
        let started = Instant::now();
        let started_at = Utc::now();

        let scope = scope::resolve(&self.config, requested).await?;
        if let Some(s) = session.as_deref_mut() {
            s.set_scope(&scope.to_string());
        }
        tracing::info!(scan_id = %scan_id, scope = %scope, "Scan cycle started");

        let deadline = started + self.config.cycle_deadline();
        let mut reports = self.run_probe_phase(&scope, deadline).await;
        let mut fused = fusion::fuse(reports.iter().flat_map(|r| r.records.iter()));
        if let Some(report) = self.reverse_lookup(&fused, deadline).await {
            if !report.records.is_empty() {
                fused = fusion::fuse(
                    reports
                        .iter()
                        .flat_map(|r| r.records.iter())
                        .chain(report.records.iter()),
                );
            }
            reports.push(report);
        }

        if let Some(s) = session.as_deref_mut() {
            journal::record_probe_reports(s, &reports);
        }
        let warnings: Vec<ProbeWarning> = reports.iter().filter_map(|r| r.warning.clone()).collect();

        let reachability = reachability::check_all(
            self.reachability.clone(),
            fused.iter().map(|r| r.address),
            self.config.reachability.max_concurrent,
        )
        .await;

        let observed_at = Utc::now();
        let mut devices = Vec::with_capacity(fused.len());
        let mut transitions = Vec::new();

        for record in &fused {
            let prior = self.store.get_prior_state(record.address).await?;
            let reach = reachability.get(&record.address).copied().unwrap_or_default();
            let from = prior.as_ref().map(|p| p.state);
            let decision = self.policy.classify(from, Some(&record.open_ports), reach.reachable);
            let score = scoring::activity_score(
                reach.reachable,
                reach.rtt_ms,
                reach.loss_pct,
                record.open_ports.len(),
            );

            let mut device = prior.unwrap_or_else(|| DeviceState::new(record.address, observed_at));
            self.merge_observation(&mut device, record);
            device.state = decision.state;
            device.risk = decision.risk.unwrap_or(device.risk);
            device.activity_score = score;
            device.last_seen = observed_at;

            // A first sighting counts as a change from `unknown`.
            let from = from.unwrap_or_default();
            if from != device.state {
                transitions.push(classifier_transition(&device, from, decision.reason, observed_at));
            }

            devices.push(DeviceSnapshot {
                scan_id,
                observed_at,
                device,
                protocols: record.protocols.clone(),
                reachable: reach.reachable,
                rtt_ms: reach.rtt_ms,
                loss_pct: reach.loss_pct,
                activity_score: score,
            });
        }

        let seen: HashSet<IpAddr> = fused.iter().map(|r| r.address).collect();
        let mut absent = Vec::new();
        for mut device in self.store.list_devices().await? {
            if seen.contains(&device.address) || !scope.contains(device.address) {
                continue;
            }
            let from = device.state;
            let decision = self.policy.classify(Some(from), None, false);
            device.state = decision.state;
            device.activity_score = 0.0;
            if from != device.state {
                transitions.push(classifier_transition(&device, from, decision.reason, observed_at));
            }
            absent.push(device);
        }

        let summary = ScanSummary {
            scan_id,
            scope: scope.to_string(),
            started_at,
            total_devices: count(devices.len()),
            vulnerable_devices: count(devices.iter().filter(|s| s.device.risk.is_vulnerable()).count()),
            new_devices: count(
                devices
                    .iter()
                    .filter(|s| s.device.state == LifecycleState::New)
                    .count(),
            ),
            transitions: count(transitions.len()),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        tracing::info!(
            scan_id = %scan_id,
            scope = %scope,
            total = summary.total_devices,
            vulnerable = summary.vulnerable_devices,
            new = summary.new_devices,
            absent = absent.len(),
            transitions = summary.transitions,
            warnings = warnings.len(),
            duration_ms = summary.duration_ms,
            "Scan cycle complete"
        );

        Ok(ScanOutcome {
            scan_id,
            scope: scope.to_string(),
            devices,
            absent,
            transitions,
            summary,
            warnings,
        })
    }

    /// Concurrent phase, then fallback probes when ARP came back empty.
    async fn run_probe_phase(&self, scope: &Scope, deadline: Instant) -> Vec<ProbeReport> {
        let (fallback, concurrent): (Vec<ProbeSlot>, Vec<ProbeSlot>) =
            self.probes.iter().cloned().partition(|s| s.fallback_only);

        let mut reports = probe::run_probes(&concurrent, scope, deadline).await;

        let arp_found = reports
            .iter()
            .any(|r| r.protocol == DiscoveryProtocol::Arp && !r.records.is_empty());
        if fallback.is_empty() || arp_found {
            return reports;
        }

        if Instant::now() < deadline {
            tracing::info!(scope = %scope, probes = fallback.len(), "No ARP replies, running fallback probes");
            reports.extend(probe::run_probes(&fallback, scope, deadline).await);
        } else {
            for slot in &fallback {
                let protocol = slot.probe.protocol();
                tracing::warn!(protocol = %protocol, "Fallback probe skipped at cycle deadline");
                reports.push(ProbeReport {
                    protocol,
                    records: Vec::new(),
                    elapsed: Duration::ZERO,
                    warning: Some(ProbeWarning {
                        protocol,
                        kind: WarningKind::DeadlineExceeded,
                        message: "skipped: cycle deadline reached".to_string(),
                    }),
                });
            }
        }

        reports.sort_by_key(|r| r.protocol);
        reports
    }

    /// PTR name hints for the fused hosts, bounded by the cycle deadline.
    async fn reverse_lookup(&self, fused: &[FusedRecord], deadline: Instant) -> Option<ProbeReport> {
        let names = self.names.as_ref()?;
        if fused.is_empty() {
            return None;
        }

        let protocol = DiscoveryProtocol::Dns;
        let started = Instant::now();
        if started >= deadline {
            tracing::warn!(protocol = %protocol, "Reverse lookups skipped at cycle deadline");
            return Some(ProbeReport {
                protocol,
                records: Vec::new(),
                elapsed: Duration::ZERO,
                warning: Some(ProbeWarning {
                    protocol,
                    kind: WarningKind::DeadlineExceeded,
                    message: "skipped: cycle deadline reached".to_string(),
                }),
            });
        }

        let addresses: Vec<IpAddr> = fused.iter().map(|r| r.address).collect();
        let (records, warning) = match names.resolve(&addresses, deadline).await {
            Ok(records) => (records, None),
            Err(e) => {
                tracing::warn!(protocol = %protocol, error = %e, "Reverse lookups failed");
                let warning = ProbeWarning {
                    protocol,
                    kind: e.warning_kind(),
                    message: e.to_string(),
                };
                (Vec::new(), Some(warning))
            }
        };
        Some(ProbeReport {
            protocol,
            records,
            elapsed: started.elapsed(),
            warning,
        })
    }

    /// Fold this cycle's observation into the persisted record.
    fn merge_observation(&self, device: &mut DeviceState, record: &FusedRecord) {
        if record.mac.is_some() {
            device.mac = record.mac;
        }
        if record.name.is_some() {
            device.name = record.name.clone();
        }
        if record.device_type.is_some() {
            device.device_type = record.device_type.clone();
        }
        if let (Some(vendors), Some(mac)) = (&self.vendors, device.mac) {
            if let Some(vendor) = vendors.lookup(&mac) {
                device.vendor = Some(vendor.to_string());
            }
        }
        device.open_ports = record.open_ports.clone();
    }

    // ── Operator actions ──────────────────────────────────────────

    pub async fn block(&self, address: IpAddr) -> Result<DeviceState> {
        self.apply_action(OperatorAction::Block, address).await
    }

    pub async fn unblock(&self, address: IpAddr) -> Result<DeviceState> {
        self.apply_action(OperatorAction::Unblock, address).await
    }

    pub async fn mark_safe(&self, address: IpAddr) -> Result<DeviceState> {
        self.apply_action(OperatorAction::MarkSafe, address).await
    }

    /// Set the operator alias. A blank alias clears it.
    pub async fn rename(&self, address: IpAddr, alias: &str) -> Result<DeviceState> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| DiscoverError::EngineBusy)?;
        let mut device = self.known_device(address).await?;

        let alias = alias.trim();
        device.alias = (!alias.is_empty()).then(|| alias.to_string());
        self.store.upsert_device(&device).await?;

        tracing::info!(address = %address, alias = ?device.alias, "Device renamed");
        Ok(device)
    }

    async fn apply_action(&self, action: OperatorAction, address: IpAddr) -> Result<DeviceState> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| DiscoverError::EngineBusy)?;
        let device = self.known_device(address).await?;

        let (updated, transition) = operator::apply(action, &device, Utc::now());
        match &transition {
            Some(t) => {
                self.store.apply_operator_change(&updated, Some(t)).await?;
                tracing::info!(
                    address = %address,
                    action = %action,
                    from = %t.from,
                    to = %t.to,
                    "Operator action applied"
                );
            }
            None => {
                tracing::info!(
                    address = %address,
                    action = %action,
                    state = %updated.state,
                    "Operator action left state unchanged"
                );
            }
        }
        Ok(updated)
    }

    async fn known_device(&self, address: IpAddr) -> Result<DeviceState> {
        self.store
            .get_prior_state(address)
            .await?
            .ok_or(DiscoverError::UnknownDevice(address))
    }

    // ── Queries ───────────────────────────────────────────────────

    pub async fn devices(&self) -> Result<Vec<DeviceState>> {
        Ok(self.store.list_devices().await?)
    }

    pub async fn transitions(&self, address: Option<IpAddr>) -> Result<Vec<StateTransition>> {
        Ok(self.store.transitions(address).await?)
    }

    /// Most recent observations of one device, oldest first.
    pub async fn activity(&self, address: IpAddr, limit: usize) -> Result<Vec<DeviceSnapshot>> {
        self.known_device(address).await?;
        Ok(self.store.snapshots(address, limit).await?)
    }

    /// Journal entries matching `query` with their integrity verdicts.
    pub fn journal_entries(&self, query: &JournalQuery) -> Result<Vec<JournalListing>> {
        let journal = self.journal.as_ref().ok_or(DiscoverError::JournalDisabled)?;
        Ok(journal.list(query)?)
    }

    /// One verified journal entry.
    pub fn journal_entry(&self, scan_id: Uuid) -> Result<JournalEntry> {
        let journal = self.journal.as_ref().ok_or(DiscoverError::JournalDisabled)?;
        Ok(journal.get(JournalId(scan_id))?)
    }

    pub async fn scan_history(&self, limit: usize) -> Result<Vec<ScanSummary>> {
        Ok(self.store.scan_history(limit).await?)
    }
}

fn classifier_transition(
    device: &DeviceState,
    from: LifecycleState,
    reason: String,
    at: DateTime<Utc>,
) -> StateTransition {
    StateTransition::new(device, from, device.state, reason, TransitionOrigin::Classifier, at)
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::{host, slot, ScriptedProbe};
    use crate::probe::PartialRecord;
    use crate::config::ReverseDnsConfig;
    use crate::reachability::tests::FixedReachability;
    use crate::reverse_dns::tests::FixedNames;
    use netguard_core::RiskLevel;
    use netguard_store::MemoryStore;
    use std::net::Ipv4Addr;

    fn config() -> DiscoverConfig {
        DiscoverConfig {
            scope: Some("192.168.1.0/24".to_string()),
            reverse_dns: ReverseDnsConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn engine(store: &Arc<MemoryStore>, probes: Vec<ProbeSlot>, reachable: &[IpAddr]) -> ScanEngine {
        ScanEngine::new(config(), store.clone())
            .with_probes(probes)
            .with_reachability(Arc::new(FixedReachability::reachable(reachable.iter().copied())))
    }

    fn tcp(last: u8, ports: &[u16]) -> ProbeSlot {
        slot(ScriptedProbe::new(
            DiscoveryProtocol::Tcp,
            vec![PartialRecord::new(host(last), DiscoveryProtocol::Tcp).with_ports(ports.iter().copied())],
        ))
    }

    fn arp(last: u8) -> ProbeSlot {
        slot(ScriptedProbe::new(
            DiscoveryProtocol::Arp,
            vec![PartialRecord::new(host(last), DiscoveryProtocol::Arp)
                .with_mac(netguard_core::HardwareAddr::new([0x00, 0x11, 0x22, 0x00, 0x00, last]))],
        ))
    }

    async fn seed(store: &MemoryStore, last: u8, state: LifecycleState) -> DeviceState {
        let mut device = DeviceState::new(host(last), Utc::now());
        device.state = state;
        device.activity_score = 80.0;
        store.upsert_device(&device).await.unwrap();
        device
    }

    #[tokio::test]
    async fn empty_probe_results_are_an_empty_cycle() {
        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![], &[]).scan_and_commit(None).await.unwrap();

        assert!(outcome.devices.is_empty());
        assert!(outcome.transitions.is_empty());
        assert_eq!(outcome.summary.total_devices, 0);
        assert_eq!(outcome.summary.vulnerable_devices, 0);
        assert_eq!(outcome.summary.scope, "192.168.1.0/24");
        assert_eq!(store.scan_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_sighting_with_telnet_is_new() {
        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![tcp(10, &[23])], &[host(10)])
            .scan_and_commit(None)
            .await
            .unwrap();

        assert_eq!(outcome.devices.len(), 1);
        let device = &outcome.devices[0].device;
        assert_eq!(device.state, LifecycleState::New);
        assert_eq!(device.risk, RiskLevel::High);

        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].from, LifecycleState::Unknown);
        assert_eq!(outcome.transitions[0].to, LifecycleState::New);
        assert_eq!(outcome.transitions[0].origin, TransitionOrigin::Classifier);
        assert_eq!(outcome.summary.new_devices, 1);
        assert_eq!(outcome.summary.vulnerable_devices, 1);

        let stored = store.get_prior_state(host(10)).await.unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::New);
        assert_eq!(store.transitions(Some(host(10))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn safe_device_exposing_rdp_becomes_suspicious() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 11, LifecycleState::Safe).await;

        let outcome = engine(&store, vec![tcp(11, &[3389])], &[host(11)])
            .scan_and_commit(None)
            .await
            .unwrap();

        assert_eq!(outcome.devices[0].device.state, LifecycleState::Suspicious);
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].from, LifecycleState::Safe);
        assert!(outcome.transitions[0].reason.contains("3389"));
        assert_eq!(store.transitions(Some(host(11))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blocked_device_seen_unreachable_stays_blocked() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 12, LifecycleState::Blocked).await;

        let outcome = engine(&store, vec![arp(12)], &[])
            .scan_and_commit(None)
            .await
            .unwrap();

        assert_eq!(outcome.devices[0].device.state, LifecycleState::Blocked);
        assert!(outcome.transitions.is_empty());
        assert!(store.transitions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_cycle_while_pending_is_busy() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 13, LifecycleState::Safe).await;
        let engine = engine(&store, vec![], &[]);

        let pending = engine.run_scan_cycle(None).await.unwrap();
        assert!(matches!(engine.run_scan_cycle(None).await, Err(DiscoverError::EngineBusy)));
        assert!(matches!(engine.block(host(13)).await, Err(DiscoverError::EngineBusy)));

        drop(pending);
        let pending = engine.run_scan_cycle(None).await.unwrap();
        pending.commit().await.unwrap();
        assert!(engine.run_scan_cycle(None).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_cycle_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![tcp(14, &[80])], &[host(14)]);

        let pending = engine.run_scan_cycle(None).await.unwrap();
        assert_eq!(pending.outcome().devices.len(), 1);
        drop(pending);

        assert!(store.list_devices().await.unwrap().is_empty());
        assert!(store.scan_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_device_goes_unknown_and_is_kept() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 20, LifecycleState::Safe).await;
        let mut elsewhere = DeviceState::new(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), Utc::now());
        elsewhere.state = LifecycleState::Safe;
        store.upsert_device(&elsewhere).await.unwrap();

        let outcome = engine(&store, vec![], &[]).scan_and_commit(None).await.unwrap();

        assert_eq!(outcome.absent.len(), 1);
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].to, LifecycleState::Unknown);
        assert_eq!(outcome.transitions[0].reason, crate::classifier::REASON_NOT_SEEN);

        let stored = store.get_prior_state(host(20)).await.unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Unknown);
        assert_eq!(stored.activity_score, 0.0);

        let untouched = store.get_prior_state(elsewhere.address).await.unwrap().unwrap();
        assert_eq!(untouched.state, LifecycleState::Safe);
        assert_eq!(store.list_devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn absent_blocked_device_stays_blocked() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 21, LifecycleState::Blocked).await;

        let outcome = engine(&store, vec![], &[]).scan_and_commit(None).await.unwrap();
        assert_eq!(outcome.absent[0].state, LifecycleState::Blocked);
        assert!(outcome.transitions.is_empty());
    }

    #[tokio::test]
    async fn classification_reads_previous_commit() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![tcp(15, &[9100])], &[host(15)]);

        let first = engine.scan_and_commit(None).await.unwrap();
        assert_eq!(first.devices[0].device.state, LifecycleState::New);

        let second = engine.scan_and_commit(None).await.unwrap();
        assert_eq!(second.devices[0].device.state, LifecycleState::Safe);
        assert_eq!(second.transitions.len(), 1);
        assert_eq!(second.transitions[0].from, LifecycleState::New);
        assert_eq!(second.summary.new_devices, 0);

        let third = engine.scan_and_commit(None).await.unwrap();
        assert!(third.transitions.is_empty());
    }

    #[tokio::test]
    async fn unblock_is_the_only_way_out_of_blocked() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 16, LifecycleState::Safe).await;
        let engine = engine(&store, vec![tcp(16, &[9100])], &[host(16)]);

        engine.block(host(16)).await.unwrap();
        let outcome = engine.scan_and_commit(None).await.unwrap();
        assert_eq!(outcome.devices[0].device.state, LifecycleState::Blocked);
        assert_eq!(engine.mark_safe(host(16)).await.unwrap().state, LifecycleState::Blocked);

        let unblocked = engine.unblock(host(16)).await.unwrap();
        assert_eq!(unblocked.state, LifecycleState::Unknown);

        let outcome = engine.scan_and_commit(None).await.unwrap();
        assert_eq!(outcome.devices[0].device.state, LifecycleState::Safe);

        let history = engine.transitions(Some(host(16))).await.unwrap();
        let origins: Vec<_> = history.iter().map(|t| (t.to, t.origin)).collect();
        assert_eq!(
            origins,
            vec![
                (LifecycleState::Blocked, TransitionOrigin::Operator),
                (LifecycleState::Unknown, TransitionOrigin::Operator),
                (LifecycleState::Safe, TransitionOrigin::Classifier),
            ]
        );
    }

    #[tokio::test]
    async fn operator_actions_need_a_known_device() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![], &[]);
        assert!(matches!(
            engine.block(host(99)).await,
            Err(DiscoverError::UnknownDevice(a)) if a == host(99)
        ));
        assert!(matches!(
            engine.rename(host(99), "x").await,
            Err(DiscoverError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn rename_sets_alias_without_transition() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 17, LifecycleState::Safe).await;
        let engine = engine(&store, vec![arp(17)], &[host(17)]);

        let renamed = engine.rename(host(17), "  hallway camera ").await.unwrap();
        assert_eq!(renamed.alias.as_deref(), Some("hallway camera"));
        assert!(engine.transitions(None).await.unwrap().is_empty());

        engine.scan_and_commit(None).await.unwrap();
        let stored = store.get_prior_state(host(17)).await.unwrap().unwrap();
        assert_eq!(stored.display_name(), Some("hallway camera"));
    }

    #[tokio::test]
    async fn icmp_fallback_runs_only_without_arp_replies() {
        let icmp = || {
            slot(ScriptedProbe::new(
                DiscoveryProtocol::Icmp,
                vec![PartialRecord::new(host(30), DiscoveryProtocol::Icmp)],
            ))
            .fallback()
        };
        let empty_arp = slot(ScriptedProbe::new(DiscoveryProtocol::Arp, vec![]));

        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![empty_arp, icmp()], &[])
            .scan_and_commit(None)
            .await
            .unwrap();
        assert_eq!(outcome.devices.len(), 1);
        assert!(outcome.devices[0].protocols.contains(&DiscoveryProtocol::Icmp));

        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![arp(31), icmp()], &[])
            .scan_and_commit(None)
            .await
            .unwrap();
        let addresses: Vec<_> = outcome.devices.iter().map(|s| s.device.address).collect();
        assert_eq!(addresses, vec![host(31)]);
    }

    #[tokio::test]
    async fn failing_probe_degrades_to_a_warning() {
        let mut failing = ScriptedProbe::new(
            DiscoveryProtocol::Arp,
            vec![PartialRecord::new(host(40), DiscoveryProtocol::Arp)],
        );
        failing.fail = Some(|| crate::error::ProbeError::PermissionDenied("raw socket".into()));

        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![slot(failing), tcp(41, &[22])], &[host(41)])
            .scan_and_commit(None)
            .await
            .unwrap();

        assert_eq!(outcome.devices.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::PermissionDenied);
    }

    #[tokio::test]
    async fn vendor_hint_comes_from_hardware_address() {
        let vendors = VendorTable::from_reader("001122,Example Devices\n".as_bytes()).unwrap();
        let store = Arc::new(MemoryStore::new());
        let outcome = engine(&store, vec![arp(18)], &[host(18)])
            .with_vendor_table(Arc::new(vendors))
            .scan_and_commit(None)
            .await
            .unwrap();

        assert_eq!(outcome.devices[0].device.vendor.as_deref(), Some("Example Devices"));
    }

    #[tokio::test]
    async fn invalid_scope_fails_and_releases_the_lock() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![], &[]);

        assert!(matches!(
            engine.run_scan_cycle(Some("not-a-network")).await,
            Err(DiscoverError::InvalidScope { .. })
        ));
        assert!(engine.scan_and_commit(None).await.is_ok());
    }

    #[tokio::test]
    async fn cycles_are_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(CycleJournal::open(dir.path()).unwrap());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![tcp(19, &[23])], &[host(19)]).with_journal(journal.clone());

        let outcome = engine.scan_and_commit(None).await.unwrap();
        let _ = engine.run_scan_cycle(Some("garbage")).await;
        drop(engine.run_scan_cycle(None).await.unwrap());

        let entries = engine.journal_entries(&JournalQuery::default()).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|l| l.intact));

        let committed = engine.journal_entry(outcome.scan_id).unwrap();
        assert!(committed.succeeded());
        assert_eq!(committed.scope, "192.168.1.0/24");
        assert_eq!(committed.decisions.len(), 1);
        assert_eq!(committed.summary.unwrap().total_devices, 1);
        assert_eq!(committed.probes.len(), 1);

        let failed = engine
            .journal_entries(&JournalQuery {
                failed_only: true,
                limit: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().any(|l| l.entry.scope == "garbage"));
    }

    #[tokio::test]
    async fn journal_reads_need_a_journal() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![], &[]);
        assert!(matches!(
            engine.journal_entries(&JournalQuery::default()),
            Err(DiscoverError::JournalDisabled)
        ));
        assert!(matches!(
            engine.journal_entry(Uuid::new_v4()),
            Err(DiscoverError::JournalDisabled)
        ));
    }

    #[tokio::test]
    async fn activity_lists_recent_observations_in_order() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store, vec![tcp(40, &[80])], &[host(40)]);
        let first = engine.scan_and_commit(None).await.unwrap();
        let second = engine.scan_and_commit(None).await.unwrap();

        let activity = engine.activity(host(40), 10).await.unwrap();
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].scan_id, first.scan_id);
        assert_eq!(activity[1].scan_id, second.scan_id);
        assert!(activity.iter().all(|s| s.reachable && s.activity_score > 0.0));

        let latest = engine.activity(host(40), 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].scan_id, second.scan_id);
        assert!(matches!(
            engine.activity(host(41), 10).await,
            Err(DiscoverError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn reverse_dns_names_feed_fusion() {
        let store = Arc::new(MemoryStore::new());
        let names = FixedNames {
            names: [(host(50), "nas.home.lan".to_string())].into_iter().collect(),
        };
        let mdns = slot(ScriptedProbe::new(
            DiscoveryProtocol::Mdns,
            vec![
                PartialRecord::new(host(50), DiscoveryProtocol::Mdns).with_name("nas"),
                PartialRecord::new(host(51), DiscoveryProtocol::Mdns).with_name("printer"),
            ],
        ));
        let engine = engine(&store, vec![mdns], &[]).with_name_resolver(Arc::new(names));

        let outcome = engine.scan_and_commit(None).await.unwrap();
        let named: Vec<_> = outcome
            .devices
            .iter()
            .map(|s| s.device.name.as_deref())
            .collect();
        assert_eq!(named, vec![Some("nas.home.lan"), Some("printer")]);
        assert!(outcome.devices[0].protocols.contains(&DiscoveryProtocol::Dns));
        assert!(!outcome.devices[1].protocols.contains(&DiscoveryProtocol::Dns));
        assert!(outcome.warnings.is_empty());
    }
}
