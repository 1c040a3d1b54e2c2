//! Discovery probes and the runner that drives them within one cycle.
//!
//! Every probe owns its sockets and pushes [`PartialRecord`]s into a
//! [`ProbeSink`] as soon as it observes them. The runner gives each probe
//! its own task and deadline; a probe cancelled at the deadline still
//! contributes what it pushed so far, while a probe that fails outright
//! contributes nothing and leaves a warning.

pub mod arp;
pub mod icmp;
pub mod mdns;
pub mod netbios;
pub mod ssdp;
pub mod tcp;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netguard_core::{DiscoveryProtocol, HardwareAddr, ProbeWarning, WarningKind};
use tokio::time::Instant;

use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::scope::Scope;

/// Slack granted past a probe's own timeout before the runner cancels it.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// What one probe learned about one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRecord {
    pub address: IpAddr,
    pub mac: Option<HardwareAddr>,
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub open_ports: BTreeSet<u16>,
    pub protocol: DiscoveryProtocol,
}

impl PartialRecord {
    pub fn new(address: IpAddr, protocol: DiscoveryProtocol) -> Self {
        Self {
            address,
            mac: None,
            name: None,
            device_type: None,
            open_ports: BTreeSet::new(),
            protocol,
        }
    }

    pub fn with_mac(mut self, mac: HardwareAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.open_ports.extend(ports);
        self
    }
}

/// Collector for one probe's records.
///
/// Cloning shares the buffer. Once closed, further pushes are dropped and
/// blocking probe loops can poll [`ProbeSink::is_closed`] to stop early.
#[derive(Clone, Default)]
pub struct ProbeSink {
    inner: Arc<SinkInner>,
}

#[derive(Default)]
struct SinkInner {
    records: Mutex<Vec<PartialRecord>>,
    closed: AtomicBool,
}

impl ProbeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: PartialRecord) {
        if self.is_closed() {
            return;
        }
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the sink and take everything pushed so far, in push order.
    pub fn drain(&self) -> Vec<PartialRecord> {
        self.close();
        std::mem::take(&mut *self.inner.records.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// A discovery protocol.
#[async_trait]
pub trait Probe: Send + Sync {
    fn protocol(&self) -> DiscoveryProtocol;

    /// Discover hosts in `scope`, returning within roughly `timeout`.
    ///
    /// Records go into `sink`; an `Err` discards them.
    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError>;
}

/// A probe with its cycle settings.
#[derive(Clone)]
pub struct ProbeSlot {
    pub probe: Arc<dyn Probe>,
    pub timeout: Duration,
    /// Runs only when the concurrent phase produced no ARP records.
    pub fallback_only: bool,
}

impl ProbeSlot {
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            fallback_only: false,
        }
    }

    pub fn fallback(mut self) -> Self {
        self.fallback_only = true;
        self
    }
}

/// Result of running one probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub protocol: DiscoveryProtocol,
    pub records: Vec<PartialRecord>,
    pub elapsed: Duration,
    pub warning: Option<ProbeWarning>,
}

/// Probe slots for every enabled protocol, in precedence order.
pub fn network_probes(config: &ProbeConfig) -> Vec<ProbeSlot> {
    let mut slots = Vec::new();

    if config.arp.enabled {
        slots.push(ProbeSlot::new(
            Arc::new(arp::ArpProbe::new()),
            Duration::from_millis(config.arp.timeout_ms),
        ));
    }
    if config.icmp.enabled {
        let slot = ProbeSlot::new(
            Arc::new(icmp::IcmpSweep::new(
                Duration::from_millis(config.icmp.per_host_timeout_ms),
                Duration::from_millis(config.icmp.max_duration_ms),
            )),
            Duration::from_millis(config.icmp.max_duration_ms),
        );
        slots.push(if config.icmp.fallback_only {
            slot.fallback()
        } else {
            slot
        });
    }
    if config.tcp.enabled {
        slots.push(ProbeSlot::new(
            Arc::new(tcp::TcpPortProbe::new(
                config.tcp.ports.clone(),
                Duration::from_millis(config.tcp.connect_timeout_ms),
                config.tcp.max_concurrent_connects,
            )),
            Duration::from_millis(config.tcp.timeout_ms),
        ));
    }
    if config.ssdp.enabled {
        slots.push(ProbeSlot::new(
            Arc::new(ssdp::SsdpProbe::new()),
            Duration::from_millis(config.ssdp.timeout_ms),
        ));
    }
    if config.mdns.enabled {
        slots.push(ProbeSlot::new(
            Arc::new(mdns::MdnsProbe::new()),
            Duration::from_millis(config.mdns.timeout_ms),
        ));
    }
    if config.netbios.enabled {
        slots.push(ProbeSlot::new(
            Arc::new(netbios::NetbiosProbe::new()),
            Duration::from_millis(config.netbios.timeout_ms),
        ));
    }

    slots
}

/// Run `slots` concurrently and join them in precedence order.
///
/// Each probe is cancelled at the earlier of `deadline` and its own
/// timeout plus a short grace.
pub async fn run_probes(slots: &[ProbeSlot], scope: &Scope, deadline: Instant) -> Vec<ProbeReport> {
    let mut handles = Vec::new();

    for slot in slots {
        let probe = slot.probe.clone();
        let timeout = slot.timeout;
        let scope = scope.clone();
        let sink = ProbeSink::new();
        let task_sink = sink.clone();
        let protocol = probe.protocol();

        let started = Instant::now();
        let cutoff = deadline.min(started + timeout + PROBE_GRACE);
        let handle = tokio::spawn(async move {
            tokio::time::timeout_at(cutoff, probe.probe(&scope, timeout, &task_sink)).await
        });
        handles.push((protocol, started, sink, handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (protocol, started, sink, handle) in handles {
        let joined = handle.await;
        let elapsed = started.elapsed();
        let records = sink.drain();

        let (records, warning) = match joined {
            Ok(Ok(Ok(()))) => (records, None),
            Ok(Ok(Err(e))) => {
                tracing::warn!(protocol = %protocol, error = %e, "Probe failed");
                (Vec::new(), Some(warning(protocol, e.warning_kind(), e.to_string())))
            }
            Ok(Err(_elapsed)) => {
                tracing::warn!(
                    protocol = %protocol,
                    partial = records.len(),
                    "Probe cancelled at deadline"
                );
                let message = format!("cancelled after {} ms", elapsed.as_millis());
                (records, Some(warning(protocol, WarningKind::DeadlineExceeded, message)))
            }
            Err(e) => {
                tracing::error!(protocol = %protocol, error = %e, "Probe task aborted");
                (Vec::new(), Some(warning(protocol, WarningKind::Aborted, e.to_string())))
            }
        };

        tracing::debug!(
            protocol = %protocol,
            records = records.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Probe finished"
        );
        reports.push(ProbeReport {
            protocol,
            records,
            elapsed,
            warning,
        });
    }

    reports.sort_by_key(|r| r.protocol);
    reports
}

fn warning(protocol: DiscoveryProtocol, kind: WarningKind, message: String) -> ProbeWarning {
    ProbeWarning {
        protocol,
        kind,
        message,
    }
}
