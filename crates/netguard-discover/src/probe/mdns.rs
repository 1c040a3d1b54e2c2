//! mDNS service enumeration.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use dns_parser::{Builder, Packet, QueryClass, QueryType, RData};
use netguard_core::DiscoveryProtocol;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use super::{PartialRecord, Probe, ProbeSink};
use crate::error::ProbeError;
use crate::scope::Scope;

const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
const SERVICES_QUERY: &str = "_services._dns-sd._udp.local";

/// PTR query for the service list with the unicast-response bit set.
pub(crate) fn services_query() -> Result<Vec<u8>, ProbeError> {
    let mut builder = Builder::new_query(0, false);
    builder.add_question(SERVICES_QUERY, true, QueryType::PTR, QueryClass::IN);
    builder
        .build()
        .map_err(|_| ProbeError::Packet("mdns query truncated".into()))
}

/// `.local` host name whose A record points at the responder.
///
/// Names announced for other addresses (sleep proxies, cached answers)
/// are ignored.
pub(crate) fn host_name(payload: &[u8], responder: IpAddr) -> Result<Option<String>, ProbeError> {
    let packet = Packet::parse(payload).map_err(|e| ProbeError::Packet(e.to_string()))?;

    for record in packet.answers.iter().chain(packet.additional.iter()) {
        let RData::A(a) = &record.data else {
            continue;
        };
        if IpAddr::V4(a.0) != responder {
            continue;
        }
        let name = record.name.to_string();
        if let Some(host) = name.strip_suffix(".local") {
            return Ok(Some(host.to_string()));
        }
    }
    Ok(None)
}

pub struct MdnsProbe {
    target: SocketAddr,
}

impl MdnsProbe {
    pub fn new() -> Self {
        Self {
            target: SocketAddr::from((MDNS_ADDR, MDNS_PORT)),
        }
    }

    /// Send the query to `target` instead of the mDNS multicast group.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }
}

impl Default for MdnsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for MdnsProbe {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Mdns
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let query = services_query()?;
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| ProbeError::io("mdns bind", e))?;
        socket
            .send_to(&query, self.target)
            .await
            .map_err(|e| ProbeError::io("mdns send", e))?;

        let window_end = Instant::now() + timeout;
        let mut named = HashSet::new();
        let mut seen = HashSet::new();
        let mut buf = [0u8; 9000];

        while let Ok(received) = timeout_at(window_end, socket.recv_from(&mut buf)).await {
            let (len, from) = received.map_err(|e| ProbeError::io("mdns recv", e))?;
            let responder = from.ip();
            if !scope.contains(responder) {
                continue;
            }

            let name = match host_name(&buf[..len], responder) {
                Ok(name) => name,
                Err(e) => {
                    tracing::debug!(responder = %responder, error = %e, "Unparsable mDNS response");
                    None
                }
            };

            // One bare record per responder, plus one more once a name shows up.
            let record = PartialRecord::new(responder, DiscoveryProtocol::Mdns);
            match name {
                Some(name) if named.insert(responder) => {
                    seen.insert(responder);
                    sink.push(record.with_name(name));
                }
                _ => {
                    if seen.insert(responder) {
                        sink.push(record);
                    }
                }
            }
        }

        Ok(())
    }
}
