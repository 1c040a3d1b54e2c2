//! Error types for the netguard-discover crate.

use std::net::IpAddr;

use netguard_core::WarningKind;
use thiserror::Error;

/// Errors that end a cycle or an operator action.
#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Scan scope could not be determined: {reason}")]
    ScopeUndetermined { reason: String },

    #[error("Invalid scan scope {scope}: {reason}")]
    InvalidScope { scope: String, reason: String },

    #[error("A scan cycle or operator action is already in progress")]
    EngineBusy,

    #[error("Unknown device: {0}")]
    UnknownDevice(IpAddr),

    #[error("No cycle journal is configured")]
    JournalDisabled,

    #[error("Journal error: {0}")]
    Journal(#[from] netguard_journal::JournalError),

    #[error("Store error: {0}")]
    Store(#[from] netguard_store::StoreError),

    #[error("Vendor table error: {0}")]
    VendorTable(#[from] csv::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;

/// Failures local to one probe. The cycle turns these into warnings.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No usable interface: {0}")]
    NoInterface(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Malformed packet: {0}")]
    Packet(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProbeError {
    /// Wrap a socket error, singling out missing privileges.
    pub fn io(context: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(format!("{context}: {source}"))
        } else {
            Self::Io {
                context: context.to_string(),
                source,
            }
        }
    }

    pub fn warning_kind(&self) -> WarningKind {
        match self {
            Self::PermissionDenied(_) => WarningKind::PermissionDenied,
            _ => WarningKind::Failed,
        }
    }
}
