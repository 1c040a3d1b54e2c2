//! Local scope resolution: which IPv4 network a cycle scans.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use ipnet::Ipv4Net;

use crate::config::DiscoverConfig;
use crate::error::{DiscoverError, Result};

/// Destination used to learn the outbound route. UDP `connect` sends nothing.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// How the scope was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSource {
    Override,
    Route,
    Hostname,
    Interface,
}

/// The network scanned by one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    network: Ipv4Net,
    /// Address of this host inside the network, when known.
    local_addr: Option<Ipv4Addr>,
    source: ScopeSource,
}

impl Scope {
    pub fn new(network: Ipv4Net, local_addr: Option<Ipv4Addr>, source: ScopeSource) -> Self {
        Self {
            network: network.trunc(),
            local_addr,
            source,
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn local_addr(&self) -> Option<Ipv4Addr> {
        self.local_addr
    }

    pub fn source(&self) -> ScopeSource {
        self.source
    }

    /// Host addresses, excluding network and broadcast (except on /31 and /32).
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        self.network.hosts().collect()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => self.network.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Parse an override given as CIDR or a bare address.
pub fn parse_override(raw: &str, default_prefix: u8, min_prefix: u8) -> Result<Scope> {
    let trimmed = raw.trim();
    let invalid = |reason: String| DiscoverError::InvalidScope {
        scope: raw.to_string(),
        reason,
    };

    let network = if trimmed.contains('/') {
        trimmed
            .parse::<Ipv4Net>()
            .map_err(|e| invalid(e.to_string()))?
    } else {
        let addr: Ipv4Addr = trimmed
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid(e.to_string()))?;
        Ipv4Net::new(addr, default_prefix).map_err(|e| invalid(e.to_string()))?
    };

    if network.prefix_len() < min_prefix {
        return Err(invalid(format!(
            "prefix /{} is shorter than the minimum /{min_prefix}",
            network.prefix_len()
        )));
    }

    Ok(Scope::new(network, None, ScopeSource::Override))
}

/// Resolve the scope for a cycle: explicit override first, then the
/// configured scope, then detection of the local network.
///
/// Detection resolves the hostname and lists interfaces, so it runs on the
/// blocking pool.
pub async fn resolve(config: &DiscoverConfig, requested: Option<&str>) -> Result<Scope> {
    if let Some(raw) = requested.or(config.scope.as_deref()) {
        return parse_override(raw, config.default_prefix_len, config.min_prefix_len);
    }

    let (local, source) = tokio::task::spawn_blocking(detect_local_addr)
        .await
        .map_err(|e| DiscoverError::ScopeUndetermined {
            reason: format!("detection task failed: {e}"),
        })??;
    let network = Ipv4Net::new(local, config.default_prefix_len).map_err(|e| {
        DiscoverError::InvalidScope {
            scope: format!("{local}/{}", config.default_prefix_len),
            reason: e.to_string(),
        }
    })?;

    tracing::debug!(local = %local, source = ?source, network = %network.trunc(), "Scope detected");
    Ok(Scope::new(network, Some(local), source))
}

fn detect_local_addr() -> Result<(Ipv4Addr, ScopeSource)> {
    let mut failures = Vec::new();

    match route_local_addr() {
        Ok(addr) => return Ok((addr, ScopeSource::Route)),
        Err(e) => failures.push(format!("route: {e}")),
    }
    match hostname_local_addr() {
        Ok(addr) => return Ok((addr, ScopeSource::Hostname)),
        Err(e) => failures.push(format!("hostname: {e}")),
    }
    match interface_local_addr() {
        Some(addr) => return Ok((addr, ScopeSource::Interface)),
        None => failures.push("interfaces: no private IPv4 address on an up interface".into()),
    }

    Err(DiscoverError::ScopeUndetermined {
        reason: failures.join("; "),
    })
}

/// Source address the kernel picks for the default route.
fn route_local_addr() -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) if usable(*v4.ip()) => Ok(*v4.ip()),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("route yielded unusable address {}", other.ip()),
        )),
    }
}

fn hostname_local_addr() -> std::io::Result<Ipv4Addr> {
    let hostname = system_hostname()?;
    (hostname.as_str(), 0)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) if usable(v4) => Some(v4),
            _ => None,
        })
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{hostname} resolves only to loopback or nothing"),
            )
        })
}

fn system_hostname() -> std::io::Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }
    let name = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))?;
    Ok(name.trim().to_string())
}

fn interface_local_addr() -> Option<Ipv4Addr> {
    pnet::datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .flat_map(|iface| iface.ips)
        .find_map(|net| match net.ip() {
            IpAddr::V4(v4) if v4.is_private() => Some(v4),
            _ => None,
        })
}

fn usable(addr: Ipv4Addr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}
