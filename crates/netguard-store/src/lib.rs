//! NetGuard Store: device state persistence for the classification engine.
//!
//! The engine never owns a database. It reads prior device state and hands
//! back a complete cycle result through the [`DeviceStore`] trait; the store
//! is responsible for applying that result as one unit.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! embedding, and [`JsonFileStore`] which keeps the whole database in a
//! single JSON document replaced atomically on every write.

pub mod file;
pub mod memory;
mod state;

use std::net::IpAddr;

use async_trait::async_trait;
use netguard_core::{DeviceSnapshot, DeviceState, ScanSummary, StateTransition};
use serde::{Deserialize, Serialize};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown device: {0}")]
    UnknownDevice(IpAddr),

    #[error("Invalid cycle record: {0}")]
    InvalidRecord(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything one scan cycle produced, persisted as a single unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleRecord {
    pub summary: Option<ScanSummary>,
    /// Observed and absent devices after classification.
    pub devices: Vec<DeviceState>,
    pub snapshots: Vec<DeviceSnapshot>,
    pub transitions: Vec<StateTransition>,
}

/// Storage collaborator consumed by the engine.
///
/// `persist_cycle` and `apply_operator_change` must be all-or-nothing:
/// either every device, transition and summary in the call is stored, or
/// none is and an error is returned.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// The committed state of the device at `address`, if it was ever seen.
    async fn get_prior_state(&self, address: IpAddr) -> Result<Option<DeviceState>>;

    /// All persisted devices ordered by address.
    async fn list_devices(&self) -> Result<Vec<DeviceState>>;

    /// Insert or replace one device record without touching the audit log.
    async fn upsert_device(&self, device: &DeviceState) -> Result<()>;

    /// Append one transition to the audit log. The device must exist.
    async fn append_transition(&self, transition: &StateTransition) -> Result<()>;

    /// Replace a device record and append its transition atomically.
    async fn apply_operator_change(
        &self,
        device: &DeviceState,
        transition: Option<&StateTransition>,
    ) -> Result<()>;

    /// Persist a whole cycle atomically.
    async fn persist_cycle(&self, record: &CycleRecord) -> Result<()>;

    /// Transition log, oldest first, optionally restricted to one address.
    async fn transitions(&self, address: Option<IpAddr>) -> Result<Vec<StateTransition>>;

    /// Most recent scan summaries, newest first.
    async fn scan_history(&self, limit: usize) -> Result<Vec<ScanSummary>>;

    /// Most recent snapshots of one device, oldest first.
    async fn snapshots(&self, address: IpAddr, limit: usize) -> Result<Vec<DeviceSnapshot>>;
}
