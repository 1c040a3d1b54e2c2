//! netguard-discover: network discovery and device classification engine.
//!
//! Probes the local subnet with ARP, ICMP, TCP, SSDP, mDNS and NetBIOS,
//! names hosts by reverse DNS, fuses what each protocol saw into one
//! record per host, and keeps a lifecycle classification per device with
//! an auditable transition log.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod journal;
pub mod operator;
pub mod probe;
pub mod reachability;
pub mod reverse_dns;
pub mod scheduler;
pub mod scope;
pub mod scoring;
pub mod vendor;

pub use engine::{PendingCycle, ScanEngine, ScanOutcome};
pub use error::{DiscoverError, ProbeError, Result};
