use thiserror::Error;

/// Errors raised by the shared domain types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetguardError {
    #[error("Invalid hardware address: {0}")]
    InvalidHardwareAddr(String),

    #[error("Unknown lifecycle state: {0}")]
    UnknownLifecycleState(String),

    #[error("Unknown risk level: {0}")]
    UnknownRiskLevel(String),
}

pub type Result<T> = std::result::Result<T, NetguardError>;
