//! Device lifecycle classification.
//!
//! The classifier is a pure function of the prior lifecycle state, what
//! this cycle observed and whether the device answered the reachability
//! check. It never touches storage; the engine turns its decisions into
//! device records and transitions.

use std::collections::BTreeSet;

use netguard_core::{LifecycleState, RiskLevel};

use crate::config::ClassifierConfig;

pub const REASON_FIRST_SIGHTING: &str = "first sighting";
pub const REASON_NOT_SEEN: &str = "not seen in scan";
pub const REASON_UNREACHABLE: &str = "not reachable";
pub const REASON_REACHABLE: &str = "reachable, no risky ports open";

/// Port sets that drive the risk level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierPolicy {
    critical: BTreeSet<u16>,
    elevated: BTreeSet<u16>,
}

/// The classifier's verdict for one device in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub state: LifecycleState,
    /// Risk from this cycle's ports; `None` when the device was not observed.
    pub risk: Option<RiskLevel>,
    /// Why `state` was chosen. Recorded only when the state changes.
    pub reason: String,
}

impl ClassifierPolicy {
    pub fn new(critical: BTreeSet<u16>, elevated: BTreeSet<u16>) -> Self {
        Self { critical, elevated }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.critical_ports.clone(), config.elevated_ports.clone())
    }

    /// Risk level of a port set and the ports that caused it.
    pub fn assess_risk(&self, ports: &BTreeSet<u16>) -> (RiskLevel, Vec<u16>) {
        let critical: Vec<u16> = ports.intersection(&self.critical).copied().collect();
        if !critical.is_empty() {
            return (RiskLevel::High, critical);
        }
        let elevated: Vec<u16> = ports.intersection(&self.elevated).copied().collect();
        if !elevated.is_empty() {
            return (RiskLevel::Medium, elevated);
        }
        (RiskLevel::Low, Vec::new())
    }

    /// Decide the lifecycle state of one device.
    ///
    /// `prior` is the committed state (`None` for a first sighting) and
    /// `observed` the device's open ports this cycle (`None` when the
    /// device was absent from the fused set).
    pub fn classify(
        &self,
        prior: Option<LifecycleState>,
        observed: Option<&BTreeSet<u16>>,
        reachable: bool,
    ) -> Decision {
        let risk = observed.map(|ports| self.assess_risk(ports));
        let level = risk.as_ref().map(|(level, _)| *level);

        let (state, reason) = match prior {
            Some(LifecycleState::Blocked) => (LifecycleState::Blocked, String::new()),
            None => (LifecycleState::New, REASON_FIRST_SIGHTING.to_string()),
            Some(_) => match risk {
                None => (LifecycleState::Unknown, REASON_NOT_SEEN.to_string()),
                Some((level, offending)) if level.is_vulnerable() && reachable => {
                    (LifecycleState::Suspicious, risk_reason(level, &offending))
                }
                Some(_) if reachable => (LifecycleState::Safe, REASON_REACHABLE.to_string()),
                Some(_) => (LifecycleState::Unknown, REASON_UNREACHABLE.to_string()),
            },
        };

        Decision {
            state,
            risk: level,
            reason,
        }
    }
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

fn risk_reason(level: RiskLevel, ports: &[u16]) -> String {
    let ports = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{level}-risk ports open: {ports}")
}
