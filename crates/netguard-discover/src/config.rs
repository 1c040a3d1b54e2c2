//! Configuration for the NetGuard discovery engine.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

/// Top-level engine configuration.
///
/// Loaded from the `[discover]` table of `netguard.toml` or
/// `NETGUARD_DISCOVER__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Scope override (CIDR or bare address). Detected when unset.
    #[serde(default)]
    pub scope: Option<String>,

    /// Prefix applied to a detected address or a bare-address override.
    #[serde(default = "default_prefix_len")]
    pub default_prefix_len: u8,

    /// Shortest prefix accepted as a scope.
    #[serde(default = "default_min_prefix_len")]
    pub min_prefix_len: u8,

    /// Upper bound on the probe phase of one cycle.
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_secs: u64,

    /// Scheduler interval in daemon mode.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Location of the JSON device store.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Directory for cycle journal entries. Journaling is off when unset.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: Option<String>,

    /// OUI reference table (CSV). No vendor hints when unset.
    #[serde(default)]
    pub vendor_db: Option<String>,

    #[serde(default)]
    pub probes: ProbeConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub reachability: ReachabilityConfig,

    #[serde(default)]
    pub reverse_dns: ReverseDnsConfig,
}

impl DiscoverConfig {
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

/// Per-protocol probe settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub arp: ArpConfig,
    #[serde(default)]
    pub icmp: IcmpConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub ssdp: WindowConfig,
    #[serde(default)]
    pub mdns: WindowConfig,
    #[serde(default)]
    pub netbios: WindowConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long to collect replies after the requests go out.
    #[serde(default = "default_arp_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IcmpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run the sweep only when ARP found nothing.
    #[serde(default = "default_true")]
    pub fallback_only: bool,
    #[serde(default = "default_icmp_host_timeout")]
    pub per_host_timeout_ms: u64,
    /// Wall-clock budget of the whole sweep; remaining hosts are skipped.
    #[serde(default = "default_icmp_max_duration")]
    pub max_duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_candidate_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,
    #[serde(default = "default_tcp_timeout")]
    pub timeout_ms: u64,
}

/// Settings for probes that listen for a fixed window.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_critical_ports")]
    pub critical_ports: BTreeSet<u16>,
    #[serde(default = "default_elevated_ports")]
    pub elevated_ports: BTreeSet<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReachabilityConfig {
    #[serde(default = "default_echo_attempts")]
    pub echo_attempts: u32,
    #[serde(default = "default_echo_timeout")]
    pub echo_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reachability_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_reachability_concurrency")]
    pub max_concurrent: usize,
}

/// PTR lookups that name hosts found by the probes.
#[derive(Debug, Clone, Deserialize)]
pub struct ReverseDnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Resolver as `addr` or `addr:port`. The first IPv4 nameserver of
    /// `/etc/resolv.conf` when unset.
    #[serde(default)]
    pub server: Option<String>,
    /// Window for all answers of one cycle.
    #[serde(default = "default_reverse_dns_timeout")]
    pub timeout_ms: u64,
}

fn default_prefix_len() -> u8 {
    24
}

fn default_min_prefix_len() -> u8 {
    16
}

fn default_cycle_deadline() -> u64 {
    30
}

fn default_interval() -> u64 {
    300
}

fn default_store_path() -> String {
    "./netguard-devices.json".to_string()
}

fn default_journal_dir() -> Option<String> {
    Some("./journal".to_string())
}

fn default_true() -> bool {
    true
}

fn default_arp_timeout() -> u64 {
    2_000
}

fn default_icmp_host_timeout() -> u64 {
    1_000
}

fn default_icmp_max_duration() -> u64 {
    20_000
}

fn default_candidate_ports() -> Vec<u16> {
    vec![21, 22, 23, 80, 443, 445, 554, 2323, 3389, 7547, 8080, 9100]
}

fn default_connect_timeout() -> u64 {
    600
}

fn default_max_concurrent_connects() -> usize {
    256
}

fn default_tcp_timeout() -> u64 {
    15_000
}

fn default_window() -> u64 {
    3_000
}

fn default_critical_ports() -> BTreeSet<u16> {
    BTreeSet::from([23, 2323, 7547, 445, 21, 3389])
}

fn default_elevated_ports() -> BTreeSet<u16> {
    BTreeSet::from([80, 443, 22, 8080])
}

fn default_echo_attempts() -> u32 {
    2
}

fn default_echo_timeout() -> u64 {
    1_000
}

fn default_reachability_ports() -> Vec<u16> {
    vec![80, 443, 53, 22]
}

fn default_reachability_concurrency() -> usize {
    32
}

fn default_reverse_dns_timeout() -> u64 {
    1_500
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            scope: None,
            default_prefix_len: default_prefix_len(),
            min_prefix_len: default_min_prefix_len(),
            cycle_deadline_secs: default_cycle_deadline(),
            interval_secs: default_interval(),
            store_path: default_store_path(),
            journal_dir: default_journal_dir(),
            vendor_db: None,
            probes: ProbeConfig::default(),
            classifier: ClassifierConfig::default(),
            reachability: ReachabilityConfig::default(),
            reverse_dns: ReverseDnsConfig::default(),
        }
    }
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_arp_timeout(),
        }
    }
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_only: true,
            per_host_timeout_ms: default_icmp_host_timeout(),
            max_duration_ms: default_icmp_max_duration(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: default_candidate_ports(),
            connect_timeout_ms: default_connect_timeout(),
            max_concurrent_connects: default_max_concurrent_connects(),
            timeout_ms: default_tcp_timeout(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_window(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            critical_ports: default_critical_ports(),
            elevated_ports: default_elevated_ports(),
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            echo_attempts: default_echo_attempts(),
            echo_timeout_ms: default_echo_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            ports: default_reachability_ports(),
            max_concurrent: default_reachability_concurrency(),
        }
    }
}

impl Default for ReverseDnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: None,
            timeout_ms: default_reverse_dns_timeout(),
        }
    }
}
