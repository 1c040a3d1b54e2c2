//! Core domain types for the NetGuard engine.
//!
//! These types are shared by the engine, the storage collaborators and the
//! cycle journal. Everything here is serializable; the ephemeral per-probe
//! records live in `netguard-discover`.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{NetguardError, Result};

/// Namespace UUID for deterministic device IDs.
const NETGUARD_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x5e, 0x92, 0x7a, 0x40, 0x4b, 0x1e, 0x9d, 0x63, 0x0a, 0xc4, 0x52, 0xe8, 0x17, 0xb6,
]);

// ── Identifiers ───────────────────────────────────────────────────

/// Stable identifier of a device, derived from its address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Deterministic ID for an address, so the same host always maps to
    /// the same device across cycles and stores.
    pub fn for_address(address: IpAddr) -> Self {
        Self(Uuid::new_v5(
            &NETGUARD_NS,
            format!("device:{address}").as_bytes(),
        ))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 48-bit Ethernet hardware address.
///
/// Displayed and serialized as upper-case, colon separated hex
/// (`AA:BB:CC:DD:EE:FF`). Parsing accepts `:`, `-` or `.` separators, or none.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr([u8; 6]);

impl HardwareAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The organizationally unique identifier (first three octets).
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareAddr({self})")
    }
}

impl FromStr for HardwareAddr {
    type Err = NetguardError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NetguardError::InvalidHardwareAddr(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| NetguardError::InvalidHardwareAddr(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for HardwareAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Verdicts ──────────────────────────────────────────────────────

/// The classifier's persisted verdict for a device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Unknown,
    New,
    Safe,
    Suspicious,
    Blocked,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::New => "new",
            Self::Safe => "safe",
            Self::Suspicious => "suspicious",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = NetguardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "new" => Ok(Self::New),
            "safe" => Ok(Self::Safe),
            "suspicious" => Ok(Self::Suspicious),
            "blocked" => Ok(Self::Blocked),
            _ => Err(NetguardError::UnknownLifecycleState(s.to_string())),
        }
    }
}

/// Exposure derived from a device's open ports.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Medium and high risk devices count as vulnerable in scan summaries.
    pub fn is_vulnerable(&self) -> bool {
        matches!(self, Self::Medium | Self::High)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = NetguardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(NetguardError::UnknownRiskLevel(s.to_string())),
        }
    }
}

/// Discovery protocols, declared in fusion precedence order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryProtocol {
    Arp,
    Icmp,
    Tcp,
    Ssdp,
    Mdns,
    Netbios,
    /// Reverse (PTR) lookup of an address another protocol found.
    Dns,
}

impl DiscoveryProtocol {
    pub const ALL: [DiscoveryProtocol; 7] = [
        Self::Arp,
        Self::Icmp,
        Self::Tcp,
        Self::Ssdp,
        Self::Mdns,
        Self::Netbios,
        Self::Dns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arp => "arp",
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Ssdp => "ssdp",
            Self::Mdns => "mdns",
            Self::Netbios => "netbios",
            Self::Dns => "dns",
        }
    }
}

impl fmt::Display for DiscoveryProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Persisted records ─────────────────────────────────────────────

/// The persisted record of one device, keyed by address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceState {
    pub id: DeviceId,
    pub address: IpAddr,
    pub mac: Option<HardwareAddr>,
    /// Best name discovered by the probes.
    pub name: Option<String>,
    /// Operator-assigned name; discovery never overwrites it.
    pub alias: Option<String>,
    pub device_type: Option<String>,
    pub vendor: Option<String>,
    pub state: LifecycleState,
    pub risk: RiskLevel,
    pub activity_score: f64,
    pub open_ports: BTreeSet<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceState {
    /// A blank record for an address seen for the first time.
    pub fn new(address: IpAddr, now: DateTime<Utc>) -> Self {
        Self {
            id: DeviceId::for_address(address),
            address,
            mac: None,
            name: None,
            alias: None,
            device_type: None,
            vendor: None,
            state: LifecycleState::Unknown,
            risk: RiskLevel::Low,
            activity_score: 0.0,
            open_ports: BTreeSet::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Alias if set, otherwise the discovered name.
    pub fn display_name(&self) -> Option<&str> {
        self.alias.as_deref().or(self.name.as_deref())
    }
}

/// Who caused a lifecycle change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransitionOrigin {
    Classifier,
    Operator,
}

/// Append-only audit record of one lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub device_id: DeviceId,
    pub address: IpAddr,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: String,
    pub origin: TransitionOrigin,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(
        device: &DeviceState,
        from: LifecycleState,
        to: LifecycleState,
        reason: impl Into<String>,
        origin: TransitionOrigin,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device.id,
            address: device.address,
            from,
            to,
            reason: reason.into(),
            origin,
            at,
        }
    }
}

/// What one cycle observed about one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSnapshot {
    pub scan_id: Uuid,
    pub observed_at: DateTime<Utc>,
    /// Device record after classification.
    pub device: DeviceState,
    pub protocols: BTreeSet<DiscoveryProtocol>,
    pub reachable: bool,
    pub rtt_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub activity_score: f64,
}

/// Aggregate counters for one scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub total_devices: u32,
    pub vulnerable_devices: u32,
    pub new_devices: u32,
    pub transitions: u32,
    pub duration_ms: u64,
}

// ── Probe diagnostics ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The probe returned an error; its records were discarded.
    Failed,
    /// The probe lacked privileges for its socket.
    PermissionDenied,
    /// The cycle deadline cancelled the probe; partial records were kept.
    DeadlineExceeded,
    /// The probe task panicked or was aborted.
    Aborted,
}

/// A recoverable per-probe problem reported alongside a cycle's results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeWarning {
    pub protocol: DiscoveryProtocol,
    pub kind: WarningKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn hardware_addr_accepts_common_notations() {
        let expected = HardwareAddr::new([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        for raw in [
            "aa:bb:cc:01:02:03",
            "AA-BB-CC-01-02-03",
            "aabb.cc01.0203",
            "AABBCC010203",
            "  aa:bb:cc:01:02:03 ",
        ] {
            assert_eq!(raw.parse::<HardwareAddr>().unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn hardware_addr_rejects_garbage() {
        assert!("".parse::<HardwareAddr>().is_err());
        assert!("aa:bb:cc".parse::<HardwareAddr>().is_err());
        assert!("zz:bb:cc:01:02:03".parse::<HardwareAddr>().is_err());
        assert!("aa:bb:cc:01:02:03:04".parse::<HardwareAddr>().is_err());
    }

    #[test]
    fn hardware_addr_serializes_as_uppercase_string() {
        let mac: HardwareAddr = "de:ad:be:ef:00:01".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"DE:AD:BE:EF:00:01\"");
        let back: HardwareAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
        assert_eq!(mac.oui(), [0xde, 0xad, 0xbe]);
    }

    #[test]
    fn device_id_is_deterministic_per_address() {
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let b = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(DeviceId::for_address(a), DeviceId::for_address(a));
        assert_ne!(DeviceId::for_address(a), DeviceId::for_address(b));
    }

    #[test]
    fn lifecycle_state_parses_case_insensitively() {
        assert_eq!("Blocked".parse::<LifecycleState>().unwrap(), LifecycleState::Blocked);
        assert_eq!(" safe ".parse::<LifecycleState>().unwrap(), LifecycleState::Safe);
        assert!("quarantined".parse::<LifecycleState>().is_err());
        assert_eq!(
            serde_json::to_string(&LifecycleState::Suspicious).unwrap(),
            "\"suspicious\""
        );
    }

    #[test]
    fn only_medium_and_high_risk_are_vulnerable() {
        assert!(!RiskLevel::Low.is_vulnerable());
        assert!(RiskLevel::Medium.is_vulnerable());
        assert!(RiskLevel::High.is_vulnerable());
        assert!(RiskLevel::High > RiskLevel::Medium);
    }

    #[test]
    fn protocol_order_follows_fusion_precedence() {
        let mut shuffled = vec![
            DiscoveryProtocol::Netbios,
            DiscoveryProtocol::Tcp,
            DiscoveryProtocol::Arp,
            DiscoveryProtocol::Mdns,
        ];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![
                DiscoveryProtocol::Arp,
                DiscoveryProtocol::Tcp,
                DiscoveryProtocol::Mdns,
                DiscoveryProtocol::Netbios,
            ]
        );
    }

    #[test]
    fn display_name_prefers_alias() {
        let mut device = DeviceState::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), Utc::now());
        assert_eq!(device.display_name(), None);
        device.name = Some("printer".to_string());
        assert_eq!(device.display_name(), Some("printer"));
        device.alias = Some("office printer".to_string());
        assert_eq!(device.display_name(), Some("office printer"));
    }
}
