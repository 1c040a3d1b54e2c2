//! Reverse DNS name hints for hosts the probes found.
//!
//! Runs after the probe phase: one PTR query per fused IPv4 address goes
//! to a single resolver, and whatever answers arrive inside the window
//! come back as [`PartialRecord`]s so fusion treats them like any other
//! name hint.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use dns_parser::{Builder, Packet, QueryClass, QueryType, RData, ResponseCode};
use netguard_core::DiscoveryProtocol;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::config::ReverseDnsConfig;
use crate::error::ProbeError;
use crate::probe::PartialRecord;

const DNS_PORT: u16 = 53;
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Looks up names for addresses that are already known.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Name records for whichever `addresses` resolve before `deadline`.
    async fn resolve(
        &self,
        addresses: &[IpAddr],
        deadline: Instant,
    ) -> Result<Vec<PartialRecord>, ProbeError>;
}

/// `d.c.b.a.in-addr.arpa` for `a.b.c.d`.
pub(crate) fn ptr_name(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{d}.{c}.{b}.{a}.in-addr.arpa")
}

pub(crate) fn ptr_query(id: u16, addr: Ipv4Addr) -> Result<Vec<u8>, ProbeError> {
    let mut builder = Builder::new_query(id, true);
    builder.add_question(&ptr_name(addr), false, QueryType::PTR, QueryClass::IN);
    builder
        .build()
        .map_err(|_| ProbeError::Packet("ptr query truncated".into()))
}

/// One resolver answer. `name` is `None` for NXDOMAIN and empty answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PtrAnswer {
    pub id: u16,
    pub question: String,
    pub name: Option<String>,
}

pub(crate) fn parse_ptr_response(payload: &[u8]) -> Result<Option<PtrAnswer>, ProbeError> {
    let packet = Packet::parse(payload).map_err(|e| ProbeError::Packet(e.to_string()))?;
    if packet.header.query {
        return Ok(None);
    }
    let Some(question) = packet.questions.first() else {
        return Ok(None);
    };

    let name = if packet.header.response_code == ResponseCode::NoError {
        packet.answers.iter().find_map(|record| match &record.data {
            RData::PTR(ptr) => Some(ptr.0.to_string().trim_end_matches('.').to_string()),
            _ => None,
        })
    } else {
        None
    };

    Ok(Some(PtrAnswer {
        id: packet.header.id,
        question: question.qname.to_string(),
        name: name.filter(|n| !n.is_empty()),
    }))
}

/// `addr` or `addr:port`; port 53 when omitted.
pub(crate) fn parse_server(raw: &str) -> Option<SocketAddr> {
    let raw = raw.trim();
    raw.parse::<SocketAddr>()
        .ok()
        .or_else(|| raw.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, DNS_PORT)))
}

/// First IPv4 `nameserver` line of a resolv.conf.
pub(crate) fn nameserver_from_resolv_conf(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("nameserver") => parts.next(),
                _ => None,
            }
        })
        .find_map(|addr| addr.parse::<Ipv4Addr>().ok())
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), DNS_PORT))
}

/// PTR lookups against one resolver over UDP.
pub struct DnsReverseResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsReverseResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    /// Resolver from `config`, or `None` when disabled or no server is known.
    pub fn from_config(config: &ReverseDnsConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let server = match config.server.as_deref() {
            Some(raw) => {
                let parsed = parse_server(raw);
                if parsed.is_none() {
                    tracing::warn!(server = %raw, "Invalid reverse DNS server, lookups disabled");
                }
                parsed
            }
            None => match std::fs::read_to_string(RESOLV_CONF) {
                Ok(contents) => nameserver_from_resolv_conf(&contents),
                Err(e) => {
                    tracing::debug!(path = RESOLV_CONF, error = %e, "No resolver configuration");
                    None
                }
            },
        }?;

        tracing::debug!(server = %server, "Reverse DNS enabled");
        Some(Self::new(server, Duration::from_millis(config.timeout_ms)))
    }
}

#[async_trait]
impl NameResolver for DnsReverseResolver {
    async fn resolve(
        &self,
        addresses: &[IpAddr],
        deadline: Instant,
    ) -> Result<Vec<PartialRecord>, ProbeError> {
        let targets: Vec<Ipv4Addr> = addresses
            .iter()
            .filter_map(|addr| match addr {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let bind = match self.server {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ProbeError::io("dns bind", e))?;

        let mut pending: HashMap<u16, Ipv4Addr> = HashMap::with_capacity(targets.len());
        for (index, addr) in targets.into_iter().enumerate() {
            let id = (index & 0xffff) as u16;
            let query = ptr_query(id, addr)?;
            match socket.send_to(&query, self.server).await {
                Ok(_) => {
                    pending.insert(id, addr);
                }
                Err(e) => tracing::debug!(addr = %addr, error = %e, "PTR query not sent"),
            }
        }

        let window_end = deadline.min(Instant::now() + self.timeout);
        let mut records = Vec::new();
        let mut buf = [0u8; 1500];

        while !pending.is_empty() {
            let Ok(received) = timeout_at(window_end, socket.recv_from(&mut buf)).await else {
                break;
            };
            let (len, from) = received.map_err(|e| ProbeError::io("dns recv", e))?;
            if from.ip() != self.server.ip() {
                continue;
            }
            let answer = match parse_ptr_response(&buf[..len]) {
                Ok(Some(answer)) => answer,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Unparsable DNS response");
                    continue;
                }
            };

            let Some(&addr) = pending.get(&answer.id) else {
                continue;
            };
            if !answer.question.eq_ignore_ascii_case(&ptr_name(addr)) {
                continue;
            }
            pending.remove(&answer.id);
            if let Some(name) = answer.name {
                records.push(PartialRecord::new(IpAddr::V4(addr), DiscoveryProtocol::Dns).with_name(name));
            }
        }

        tracing::debug!(
            named = records.len(),
            unanswered = pending.len(),
            "Reverse DNS lookups finished"
        );
        Ok(records)
    }
}
