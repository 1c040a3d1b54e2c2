//! UPnP discovery via SSDP M-SEARCH.

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

const SSDP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1900;

const M_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 2\r\n\
ST: ssdp:all\r\n\
\r\n";

/// Fallback hint for anything that answers SSDP.
const DEFAULT_TYPE: &str = "IoT device";

/// Keyword groups checked in order against the lower-cased headers.
const TYPE_KEYWORDS: &[(&[&str], &str)] = &[
    (&["camera", "ipcam", "webcam", "nvr", "dvr", "onvif"], "IP camera"),
    (&["printer", "print"], "Printer"),
    (&["internetgatewaydevice", "router", "gateway", "wanconnection"], "Router"),
    (&["speaker", "sonos", "zoneplayer", "audio"], "Speaker"),
    (&["tv", "television", "bravia", "webos", "tizen", "roku"], "Smart TV"),
    (&["mediarenderer", "mediaserver", "dlna", "chromecast", "kodi", "plex"], "Media player"),
];

/// Header values of one SSDP response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SsdpResponse {
    pub server: Option<String>,
    pub st: Option<String>,
    pub usn: Option<String>,
}

impl SsdpResponse {
    pub fn device_type(&self) -> &'static str {
        let haystack = [&self.server, &self.st, &self.usn]
            .into_iter()
            .flatten()
            .map(|v| v.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        TYPE_KEYWORDS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| contains_word(&haystack, k)))
            .map(|(_, label)| *label)
            .unwrap_or(DEFAULT_TYPE)
    }
}

/// Short keywords must match a whole token so "tv" does not hit "ntv" or "stv".
fn contains_word(haystack: &str, keyword: &str) -> bool {
    if keyword.len() > 3 {
        return haystack.contains(keyword);
    }
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == keyword)
}

/// Pull SERVER, ST and USN out of a response. Header names are case-insensitive.
pub(crate) fn parse_response(payload: &str) -> Option<SsdpResponse> {
    let mut lines = payload.lines();
    let status = lines.next()?;
    if !status.to_ascii_uppercase().starts_with("HTTP/") && !status.to_ascii_uppercase().starts_with("NOTIFY") {
        return None;
    }

    let mut response = SsdpResponse::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match name.trim().to_ascii_uppercase().as_str() {
            "SERVER" => response.server = Some(value.to_string()),
            "ST" | "NT" => response.st = Some(value.to_string()),
            "USN" => response.usn = Some(value.to_string()),
            _ => {}
        }
    }
    Some(response)
}

pub struct SsdpProbe {
    target: SocketAddr,
}

impl SsdpProbe {
    pub fn new() -> Self {
        Self {
            target: SocketAddr::from((SSDP_ADDR, SSDP_PORT)),
        }
    }

    /// Send the M-SEARCH to `target` instead of the SSDP multicast group.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }
}

impl Default for SsdpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for SsdpProbe {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Ssdp
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| ProbeError::io("ssdp bind", e))?;
        socket
            .set_multicast_ttl_v4(2)
            .map_err(|e| ProbeError::io("ssdp ttl", e))?;
        socket
            .send_to(M_SEARCH.as_bytes(), self.target)
            .await
            .map_err(|e| ProbeError::io("ssdp send", e))?;

        let window_end = Instant::now() + timeout;
        let mut seen = HashSet::new();
        let mut buf = [0u8; 2048];

        while let Ok(received) = timeout_at(window_end, socket.recv_from(&mut buf)).await {
            let (len, from) = received.map_err(|e| ProbeError::io("ssdp recv", e))?;
            if !scope.contains(from.ip()) {
                continue;
            }
            let Some(response) = parse_response(&String::from_utf8_lossy(&buf[..len])) else {
                continue;
            };

            let device_type = response.device_type();
            if seen.insert((from.ip(), device_type)) {
                sink.push(record(from.ip(), device_type));
            }
        }

        Ok(())
    }
}

fn record(address: IpAddr, device_type: &str) -> PartialRecord {
    PartialRecord::new(address, DiscoveryProtocol::Ssdp).with_device_type(device_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_case_insensitively() {
        let payload = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
server: Linux/3.10 UPnP/1.0 IpBridge/1.26.0\r\n\
St: urn:schemas-upnp-org:device:basic:1\r\n\
USN: uuid:2f402f80-da50-11e1-9b23-001788255acd\r\n\r\n";

        let response = parse_response(payload).unwrap();
        assert_eq!(
            response.server.as_deref(),
            Some("Linux/3.10 UPnP/1.0 IpBridge/1.26.0")
        );
        assert_eq!(response.st.as_deref(), Some("urn:schemas-upnp-org:device:basic:1"));
        assert!(response.usn.unwrap().starts_with("uuid:2f402f80"));
    }

    #[test]
    fn rejects_non_http_payloads() {
        assert!(parse_response("").is_none());
        assert!(parse_response("garbage\r\nSERVER: x\r\n").is_none());
    }

    #[test]
    fn keyword_matching_picks_coarse_type() {
        let typed = |server: &str, st: &str| {
            SsdpResponse {
                server: Some(server.to_string()),
                st: Some(st.to_string()),
                usn: None,
            }
            .device_type()
        };

        assert_eq!(typed("Hikvision-Webs", "urn:schemas-upnp-org:device:IPCamera:1"), "IP camera");
        assert_eq!(
            typed("Linux UPnP/1.0", "urn:schemas-upnp-org:device:InternetGatewayDevice:1"),
            "Router"
        );
        assert_eq!(typed("Sonos/70.3", "urn:schemas-upnp-org:device:ZonePlayer:1"), "Speaker");
        assert_eq!(typed("WebOS/4.1 UPnP/1.0", "urn:lge-com:service:webos-second-screen:1"), "Smart TV");
        assert_eq!(
            typed("Linux DLNADOC/1.50", "urn:schemas-upnp-org:device:MediaRenderer:1"),
            "Media player"
        );
        assert_eq!(typed("HP LaserJet", "urn:schemas-upnp-org:device:Printer:1"), "Printer");
        assert_eq!(typed("Linux/3.10 UPnP/1.0", "upnp:rootdevice"), DEFAULT_TYPE);
    }

    #[test]
    fn short_keywords_need_whole_tokens() {
        assert!(contains_word("samsung tv upnp", "tv"));
        assert!(!contains_word("rootdevice kodi-ntv", "tv"));
    }

    #[tokio::test]
    async fn collects_typed_responders_from_a_unicast_target() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            assert!(buf[..len].starts_with(b"M-SEARCH"));
            let reply = "HTTP/1.1 200 OK\r\n\
SERVER: Linux UPnP/1.0 Hikvision\r\n\
ST: urn:schemas-upnp-org:device:IPCamera:1\r\n\r\n";
            for _ in 0..2 {
                responder.send_to(reply.as_bytes(), from).await.unwrap();
            }
            responder.send_to(b"not ssdp", from).await.unwrap();
        });

        let scope = crate::scope::parse_override("127.0.0.1/32", 24, 16).unwrap();
        let sink = ProbeSink::new();
        SsdpProbe::new()
            .with_target(target)
            .probe(&scope, Duration::from_millis(300), &sink)
            .await
            .unwrap();

        let records = sink.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(records[0].device_type.as_deref(), Some("IP camera"));
    }
}
