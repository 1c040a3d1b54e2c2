//! netguard-core: Shared types and error handling for the NetGuard engine.
//!
//! This crate provides the foundational types used across all NetGuard crates:
//! - Persisted device records (`DeviceState`) and their lifecycle/risk verdicts
//! - The append-only audit record (`StateTransition`)
//! - Per-cycle output types (`DeviceSnapshot`, `ScanSummary`, `ProbeWarning`)
//! - Hardware address parsing and deterministic device identifiers

pub mod error;
pub mod types;

pub use error::NetguardError;
pub use types::{
    DeviceId, DeviceSnapshot, DeviceState, DiscoveryProtocol, HardwareAddr, LifecycleState,
    ProbeWarning, RiskLevel, ScanSummary, StateTransition, TransitionOrigin, WarningKind,
};
