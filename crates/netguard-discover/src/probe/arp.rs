//! ARP sweep over the local broadcast domain.
//!
//! The only probe that sees hardware addresses. Needs a layer-2 channel,
//! which normally means root or CAP_NET_RAW.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use netguard_core::{DiscoveryProtocol, HardwareAddr};
use pnet::datalink::{self, Channel, MacAddr, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;

use super::{PartialRecord, Probe, ProbeSink};
use crate::error::ProbeError;
use crate::scope::Scope;

const ETHERNET_LEN: usize = 14;
const ARP_LEN: usize = 28;
/// Poll interval of the blocking receive loop.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct ArpProbe;

impl ArpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Probe for ArpProbe {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Arp
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let (interface, source_ip) = select_interface(scope)?;
        let hosts = scope.hosts();
        let sink = sink.clone();

        tracing::debug!(interface = %interface.name, hosts = hosts.len(), "Starting ARP sweep");
        tokio::task::spawn_blocking(move || sweep(&interface, source_ip, hosts, timeout, &sink))
            .await
            .map_err(|e| ProbeError::Unsupported(format!("arp worker: {e}")))?
    }
}

/// The up, non-loopback interface holding an address inside the scope.
fn select_interface(scope: &Scope) -> Result<(NetworkInterface, Ipv4Addr), ProbeError> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback() && iface.mac.is_some())
        .find_map(|iface| {
            let source = iface.ips.iter().find_map(|net| match net.ip() {
                IpAddr::V4(v4) if scope.contains(IpAddr::V4(v4)) => Some(v4),
                _ => None,
            })?;
            Some((iface, source))
        })
        .ok_or_else(|| ProbeError::NoInterface(format!("no interface attached to {scope}")))
}

fn sweep(
    interface: &NetworkInterface,
    source_ip: Ipv4Addr,
    hosts: Vec<Ipv4Addr>,
    timeout: Duration,
    sink: &ProbeSink,
) -> Result<(), ProbeError> {
    let source_mac = interface
        .mac
        .ok_or_else(|| ProbeError::NoInterface(format!("{} has no MAC", interface.name)))?;

    let mut config = datalink::Config::default();
    config.read_timeout = Some(READ_TIMEOUT);
    let (mut tx, mut rx) = match datalink::channel(interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => return Err(ProbeError::Unsupported("non-ethernet channel".into())),
        Err(e) => return Err(ProbeError::io("arp channel", e)),
    };

    let targets: HashSet<Ipv4Addr> = hosts.iter().copied().filter(|h| *h != source_ip).collect();
    for target in &targets {
        let frame = request_frame(source_mac, source_ip, *target)?;
        if let Some(Err(e)) = tx.send_to(&frame, None) {
            tracing::debug!(target = %target, error = %e, "ARP request not sent");
        }
    }

    let started = Instant::now();
    let mut seen = HashSet::new();
    while started.elapsed() < timeout && !sink.is_closed() && seen.len() < targets.len() {
        match rx.next() {
            Ok(frame) => {
                if let Some((ip, mac)) = parse_reply(frame) {
                    if targets.contains(&ip) && seen.insert(ip) {
                        sink.push(PartialRecord::new(IpAddr::V4(ip), DiscoveryProtocol::Arp).with_mac(mac));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(ProbeError::io("arp receive", e)),
        }
    }

    tracing::debug!(replies = seen.len(), "ARP sweep complete");
    Ok(())
}

/// Broadcast who-has frame for `target`.
pub(crate) fn request_frame(
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target: Ipv4Addr,
) -> Result<Vec<u8>, ProbeError> {
    let too_small = || ProbeError::Packet("arp buffer too small".into());
    let mut buf = vec![0u8; ETHERNET_LEN + ARP_LEN];

    {
        let mut eth = MutableEthernetPacket::new(&mut buf).ok_or_else(too_small)?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(source_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }

    let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_LEN..]).ok_or_else(too_small)?;
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Request);
    arp.set_sender_hw_addr(source_mac);
    arp.set_sender_proto_addr(source_ip);
    arp.set_target_hw_addr(MacAddr::zero());
    arp.set_target_proto_addr(target);

    Ok(buf)
}

/// Sender of an ARP reply frame.
pub(crate) fn parse_reply(frame: &[u8]) -> Option<(Ipv4Addr, HardwareAddr)> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }

    let mac = hardware_addr(arp.get_sender_hw_addr());
    if mac.is_zero() || mac.is_broadcast() {
        return None;
    }
    Some((arp.get_sender_proto_addr(), mac))
}

fn hardware_addr(mac: MacAddr) -> HardwareAddr {
    let MacAddr(a, b, c, d, e, f) = mac;
    HardwareAddr::new([a, b, c, d, e, f])
}
