//! NetBIOS node-status (NBSTAT) sweep.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use netguard_core::DiscoveryProtocol;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use super::{PartialRecord, Probe, ProbeSink};
use crate::error::ProbeError;
use crate::scope::Scope;

const NBNS_PORT: u16 = 137;
const HEADER_LEN: usize = 12;
const NAME_ENTRY_LEN: usize = 18;
const TYPE_NBSTAT: u16 = 0x0021;
const CLASS_IN: u16 = 0x0001;
const GROUP_FLAG: u16 = 0x8000;

/// Node-status query for the wildcard name `*`.
pub(crate) fn node_status_query(transaction_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 34 + 4);
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x00]); // flags: query
    buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    buf.push(0x20);
    buf.extend_from_slice(&encode_name(b"*"));
    buf.push(0x00);
    buf.extend_from_slice(&TYPE_NBSTAT.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf
}

/// First-level encoding: pad to 16 bytes with NUL, split each byte into
/// nibbles and offset them from 'A'.
fn encode_name(name: &[u8]) -> [u8; 32] {
    let mut padded = [0u8; 16];
    let len = name.len().min(16);
    padded[..len].copy_from_slice(&name[..len]);

    let mut encoded = [0u8; 32];
    for (i, byte) in padded.iter().enumerate() {
        encoded[i * 2] = b'A' + (byte >> 4);
        encoded[i * 2 + 1] = b'A' + (byte & 0x0f);
    }
    encoded
}

/// One row of a node-status name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NameEntry {
    pub name: String,
    pub suffix: u8,
    pub group: bool,
}

/// Parse a node-status response into its name table.
pub(crate) fn parse_node_status(payload: &[u8]) -> Option<Vec<NameEntry>> {
    let flags = u16::from_be_bytes([*payload.get(2)?, *payload.get(3)?]);
    let answers = u16::from_be_bytes([*payload.get(6)?, *payload.get(7)?]);
    if flags & 0x8000 == 0 || answers == 0 {
        return None;
    }

    let mut pos = HEADER_LEN;
    if *payload.get(pos)? & 0xc0 == 0xc0 {
        pos += 2;
    } else {
        loop {
            let len = usize::from(*payload.get(pos)?);
            pos += 1;
            if len == 0 {
                break;
            }
            pos += len;
        }
    }

    let rtype = u16::from_be_bytes([*payload.get(pos)?, *payload.get(pos + 1)?]);
    if rtype != TYPE_NBSTAT {
        return None;
    }
    pos += 10; // type, class, ttl, rdlength

    let count = usize::from(*payload.get(pos)?);
    pos += 1;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let start = pos + i * NAME_ENTRY_LEN;
        let entry = payload.get(start..start + NAME_ENTRY_LEN)?;
        let flags = u16::from_be_bytes([entry[16], entry[17]]);
        entries.push(NameEntry {
            name: String::from_utf8_lossy(&entry[..15])
                .trim_end_matches([' ', '\0'])
                .to_string(),
            suffix: entry[15],
            group: flags & GROUP_FLAG != 0,
        });
    }
    Some(entries)
}

/// The first unique, non-empty name in a table.
pub(crate) fn first_unique_name(entries: &[NameEntry]) -> Option<&str> {
    entries
        .iter()
        .find(|e| !e.group && !e.name.is_empty())
        .map(|e| e.name.as_str())
}

pub struct NetbiosProbe {
    port: u16,
}

impl NetbiosProbe {
    pub fn new() -> Self {
        Self { port: NBNS_PORT }
    }

    /// Query hosts on `port` instead of the name service port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl Default for NetbiosProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for NetbiosProbe {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Netbios
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| ProbeError::io("netbios bind", e))?;

        let window_end = Instant::now() + timeout;
        for (index, host) in scope.hosts().into_iter().enumerate() {
            let query = node_status_query((index & 0xffff) as u16);
            if let Err(e) = socket
                .send_to(&query, SocketAddr::new(IpAddr::V4(host), self.port))
                .await
            {
                tracing::debug!(host = %host, error = %e, "NBSTAT query not sent");
            }
        }

        let mut seen = HashSet::new();
        let mut buf = [0u8; 1500];
        while let Ok(received) = timeout_at(window_end, socket.recv_from(&mut buf)).await {
            let (len, from) = received.map_err(|e| ProbeError::io("netbios recv", e))?;
            let responder = from.ip();
            if !scope.contains(responder) || !seen.insert(responder) {
                continue;
            }
            let Some(entries) = parse_node_status(&buf[..len]) else {
                seen.remove(&responder);
                continue;
            };

            let mut record = PartialRecord::new(responder, DiscoveryProtocol::Netbios);
            if let Some(name) = first_unique_name(&entries) {
                record = record.with_name(name);
            }
            sink.push(record);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(entries: &[(&str, u8, bool)]) -> Vec<u8> {
        let mut buf = vec![0x00, 0x07, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        buf.push(0x20);
        buf.extend_from_slice(&encode_name(b"*"));
        buf.push(0x00);
        buf.extend_from_slice(&TYPE_NBSTAT.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let rdlength = 1 + entries.len() * NAME_ENTRY_LEN + 6;
        buf.extend_from_slice(&(rdlength as u16).to_be_bytes());
        buf.push(entries.len() as u8);
        for (name, suffix, group) in entries {
            let mut padded = [b' '; 15];
            padded[..name.len()].copy_from_slice(name.as_bytes());
            buf.extend_from_slice(&padded);
            buf.push(*suffix);
            let flags: u16 = if *group { 0x8400 } else { 0x0400 };
            buf.extend_from_slice(&flags.to_be_bytes());
        }
        buf.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        buf
    }

    #[test]
    fn query_encodes_wildcard_name() {
        let query = node_status_query(0x0102);
        assert_eq!(query.len(), 50);
        assert_eq!(&query[..2], &[0x01, 0x02]);
        assert_eq!(query[12], 0x20);
        assert_eq!(&query[13..15], b"CK");
        assert!(query[15..45].iter().all(|b| *b == b'A'));
        assert_eq!(&query[46..], &[0x00, 0x21, 0x00, 0x01]);
    }

    #[test]
    fn parses_name_table() {
        let payload = response(&[("WORKGROUP", 0x00, true), ("NAS-01", 0x00, false), ("NAS-01", 0x20, false)]);
        let entries = parse_node_status(&payload).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].group);
        assert_eq!(entries[1].name, "NAS-01");
        assert_eq!(entries[2].suffix, 0x20);
        assert_eq!(first_unique_name(&entries), Some("NAS-01"));
    }

    #[test]
    fn group_only_table_has_no_name() {
        let payload = response(&[("WORKGROUP", 0x00, true)]);
        let entries = parse_node_status(&payload).unwrap();
        assert_eq!(first_unique_name(&entries), None);
    }

    #[test]
    fn queries_and_truncated_payloads_are_rejected() {
        assert!(parse_node_status(&node_status_query(1)).is_none());
        let mut truncated = response(&[("NAS-01", 0x00, false)]);
        truncated.truncate(60);
        assert!(parse_node_status(&truncated).is_none());
    }

    #[tokio::test]
    async fn names_hosts_from_their_status_reply() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 50);
            responder.send_to(&[0x00, 0x01], from).await.unwrap();
            let reply = response(&[("WORKGROUP", 0x00, true), ("NAS-01", 0x20, false)]);
            responder.send_to(&reply, from).await.unwrap();
            responder.send_to(&reply, from).await.unwrap();
        });

        let scope = crate::scope::parse_override("127.0.0.1/32", 24, 16).unwrap();
        let sink = ProbeSink::new();
        NetbiosProbe::new()
            .with_port(port)
            .probe(&scope, Duration::from_millis(300), &sink)
            .await
            .unwrap();

        let records = sink.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(records[0].name.as_deref(), Some("NAS-01"));
    }
}
