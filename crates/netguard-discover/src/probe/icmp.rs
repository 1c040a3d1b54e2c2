//! ICMP echo: the fallback sweep probe and the pinger used by reachability.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use netguard_core::DiscoveryProtocol;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpTypes};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};

use super::{PartialRecord, Probe, ProbeSink};
use crate::error::ProbeError;
use crate::scope::Scope;

const PAYLOAD: &[u8] = b"netguard-echo-v1";
const ECHO_LEN: usize = 8 + PAYLOAD.len();
/// Gap between consecutive requests of a sweep.
const SEND_INTERVAL: Duration = Duration::from_millis(2);

/// An ICMP socket: raw when privileged, otherwise the unprivileged
/// datagram flavour (where the kernel owns the identifier).
pub(crate) struct IcmpSocket {
    socket: UdpSocket,
    raw: bool,
    ident: u16,
}

impl IcmpSocket {
    pub fn open() -> Result<Self, ProbeError> {
        let (socket, raw) = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => (socket, true),
            Err(raw_err) => {
                match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
                    Ok(socket) => (socket, false),
                    Err(_) => return Err(ProbeError::io("icmp socket", raw_err)),
                }
            }
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| ProbeError::io("icmp socket", e))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket =
            UdpSocket::from_std(std_socket).map_err(|e| ProbeError::io("icmp socket", e))?;

        Ok(Self {
            socket,
            raw,
            ident: (std::process::id() & 0xffff) as u16,
        })
    }

    pub async fn send_echo(&self, target: Ipv4Addr, seq: u16) -> Result<(), ProbeError> {
        let packet = echo_request(self.ident, seq)?;
        self.socket
            .send_to(&packet, SocketAddr::new(IpAddr::V4(target), 0))
            .await
            .map_err(|e| ProbeError::io("icmp send", e))?;
        Ok(())
    }

    /// Wait for the next echo reply addressed to this socket.
    /// Cancel safe.
    pub async fn recv_reply(&self) -> Result<(Ipv4Addr, u16), ProbeError> {
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| ProbeError::io("icmp recv", e))?;
            let IpAddr::V4(source) = from.ip() else {
                continue;
            };
            if let Some((ident, seq)) = parse_echo_reply(&buf[..len]) {
                if !self.raw || ident == self.ident {
                    return Ok((source, seq));
                }
            }
        }
    }
}

/// Build an echo request with a valid checksum.
pub(crate) fn echo_request(ident: u16, seq: u16) -> Result<Vec<u8>, ProbeError> {
    let mut buf = vec![0u8; ECHO_LEN];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| ProbeError::Packet("echo buffer too small".into()))?;
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode(0));
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        packet.set_payload(PAYLOAD);
    }
    let checksum = pnet::util::checksum(&buf, 1);
    buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// Identifier and sequence of an echo reply. Raw sockets deliver the IPv4
/// header first; datagram sockets deliver the ICMP message alone.
pub(crate) fn parse_echo_reply(buf: &[u8]) -> Option<(u16, u16)> {
    let icmp = match buf.first() {
        Some(first) if first >> 4 == 4 => {
            let header_len = usize::from(first & 0x0f) * 4;
            buf.get(header_len..)?
        }
        _ => buf,
    };

    let reply = EchoReplyPacket::new(icmp)?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    Some((reply.get_identifier(), reply.get_sequence_number()))
}

/// Outcome of pinging one host a few times.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingStats {
    pub sent: u32,
    pub received: u32,
    pub total_rtt: Duration,
}

impl PingStats {
    pub fn mean_rtt_ms(&self) -> Option<f64> {
        if self.received == 0 {
            return None;
        }
        Some(self.total_rtt.as_secs_f64() * 1000.0 / f64::from(self.received))
    }

    pub fn loss_pct(&self) -> Option<f64> {
        if self.sent == 0 {
            return None;
        }
        Some(f64::from(self.sent - self.received) * 100.0 / f64::from(self.sent))
    }
}

/// Send `attempts` echo requests one after another, each waiting up to
/// `timeout` for its reply.
pub(crate) async fn ping(
    target: Ipv4Addr,
    attempts: u32,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let socket = IcmpSocket::open()?;
    let mut stats = PingStats::default();

    for attempt in 0..attempts {
        let seq = (attempt & 0xffff) as u16;
        let started = Instant::now();
        socket.send_echo(target, seq).await?;
        stats.sent += 1;

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match socket.recv_reply().await {
                    Ok((source, reply_seq)) if source == target && reply_seq == seq => {
                        return Ok(())
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {
                stats.received += 1;
                stats.total_rtt += started.elapsed();
            }
            Ok(Err(e)) => tracing::debug!(target = %target, error = %e, "Echo receive failed"),
            Err(_) => {}
        }
    }

    Ok(stats)
}

/// Echo sweep across every host of the scope.
pub struct IcmpSweep {
    per_host_timeout: Duration,
    max_duration: Duration,
}

impl IcmpSweep {
    pub fn new(per_host_timeout: Duration, max_duration: Duration) -> Self {
        Self {
            per_host_timeout,
            max_duration,
        }
    }
}

/// What one sweep got through before its budget ran out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sent: usize,
    pub skipped: usize,
    pub responders: usize,
}

impl IcmpSweep {
    /// Echo every host of `scope` within `budget`, pushing responders as
    /// they answer. Hosts not reached before the budget ends are skipped.
    pub async fn sweep(
        &self,
        scope: &Scope,
        budget: Duration,
        sink: &ProbeSink,
    ) -> Result<SweepStats, ProbeError> {
        let socket = IcmpSocket::open()?;
        let hosts = scope.hosts();
        let targets: HashSet<Ipv4Addr> = hosts.iter().copied().collect();
        let sweep_end = Instant::now() + budget.min(self.max_duration);

        let mut pending = hosts.iter().copied().enumerate();
        let mut sent = 0usize;
        let mut sending_done: Option<Instant> = None;
        let mut seen = HashSet::new();
        let mut pacer = tokio::time::interval(SEND_INTERVAL);

        loop {
            let cutoff = match sending_done {
                Some(at) => sweep_end.min(at + self.per_host_timeout),
                None => sweep_end,
            };

            tokio::select! {
                _ = sleep_until(cutoff) => break,
                reply = socket.recv_reply() => {
                    let (source, _) = reply?;
                    if targets.contains(&source) && seen.insert(source) {
                        sink.push(PartialRecord::new(IpAddr::V4(source), DiscoveryProtocol::Icmp));
                    }
                }
                _ = pacer.tick(), if sending_done.is_none() => {
                    match pending.next() {
                        Some((index, host)) => {
                            if let Err(e) = socket.send_echo(host, (index & 0xffff) as u16).await {
                                tracing::debug!(host = %host, error = %e, "Echo send failed");
                            }
                            sent += 1;
                        }
                        None => sending_done = Some(Instant::now()),
                    }
                }
            }
        }

        let stats = SweepStats {
            sent,
            skipped: hosts.len() - sent,
            responders: seen.len(),
        };
        if stats.skipped > 0 {
            tracing::debug!(skipped = stats.skipped, "ICMP sweep budget exhausted before every host was probed");
        }
        Ok(stats)
    }
}

#[async_trait]
impl Probe for IcmpSweep {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Icmp
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let stats = self.sweep(scope, timeout, sink).await?;
        tracing::debug!(scope = %scope, responders = stats.responders, "ICMP sweep complete");
        Ok(())
    }
}
