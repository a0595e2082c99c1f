//! Failover/failback state machine.
//!
//! States are visited in a fixed order per operation; a driver may only move
//! to the next state of its sequence, or to the terminal `FailoverFailed`.

use super::DrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrState {
    Normal,
    EmergencyMode,
    Resyncing,
    DbPromoting,
    DnsCutover,
    ServicesStarting,
    Validating,
    FailoverFailed,
}

impl DrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrState::Normal => "NORMAL",
            DrState::EmergencyMode => "EMERGENCY_MODE",
            DrState::Resyncing => "RESYNCING",
            DrState::DbPromoting => "DB_PROMOTING",
            DrState::DnsCutover => "DNS_CUTOVER",
            DrState::ServicesStarting => "SERVICES_STARTING",
            DrState::Validating => "VALIDATING",
            DrState::FailoverFailed => "FAILOVER_FAILED",
        }
    }

    /// Whether public traffic is being held behind the maintenance response.
    pub fn in_maintenance(&self) -> bool {
        !matches!(self, DrState::Normal)
    }
}

impl fmt::Display for DrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(DrState::Normal),
            "EMERGENCY_MODE" => Ok(DrState::EmergencyMode),
            "RESYNCING" => Ok(DrState::Resyncing),
            "DB_PROMOTING" => Ok(DrState::DbPromoting),
            "DNS_CUTOVER" => Ok(DrState::DnsCutover),
            "SERVICES_STARTING" => Ok(DrState::ServicesStarting),
            "VALIDATING" => Ok(DrState::Validating),
            "FAILOVER_FAILED" => Ok(DrState::FailoverFailed),
            other => Err(format!("unknown DR state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Failover,
    Failback,
    /// Operator-driven emergency mode entry or clearance
    Manual,
}

const FAILOVER_STEPS: &[DrState] = &[
    DrState::EmergencyMode,
    DrState::DbPromoting,
    DrState::DnsCutover,
    DrState::ServicesStarting,
    DrState::Validating,
    DrState::Normal,
];

const FAILBACK_STEPS: &[DrState] = &[
    DrState::EmergencyMode,
    DrState::Resyncing,
    DrState::DbPromoting,
    DrState::DnsCutover,
    DrState::ServicesStarting,
    DrState::Validating,
    DrState::Normal,
];

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Failover => "failover",
            Operation::Failback => "failback",
            Operation::Manual => "manual",
        }
    }

    /// States entered after leaving `Normal`, in order.
    pub fn steps(&self) -> &'static [DrState] {
        match self {
            Operation::Failover => FAILOVER_STEPS,
            Operation::Failback => FAILBACK_STEPS,
            Operation::Manual => &[],
        }
    }

    /// Check that `from -> to` is a legal move for this operation.
    pub fn check_transition(&self, from: DrState, to: DrState) -> Result<(), DrError> {
        let legal = match (self, to) {
            (Operation::Manual, DrState::FailoverFailed) => false,
            (_, DrState::FailoverFailed) => from != DrState::FailoverFailed,
            (Operation::Manual, DrState::EmergencyMode) => from == DrState::Normal,
            (Operation::Manual, DrState::Normal) => {
                matches!(from, DrState::EmergencyMode | DrState::FailoverFailed)
            }
            (Operation::Manual, _) => false,
            (op, to) => {
                let steps = op.steps();
                let expected = match from {
                    DrState::Normal => steps.first(),
                    other => steps
                        .iter()
                        .position(|s| *s == other)
                        .and_then(|i| steps.get(i + 1)),
                };
                expected == Some(&to)
            }
        };

        if legal {
            Ok(())
        } else {
            Err(DrError::IllegalTransition {
                operation: *self,
                from,
                to,
            })
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failover" => Ok(Operation::Failover),
            "failback" => Ok(Operation::Failback),
            "manual" => Ok(Operation::Manual),
            other => Err(format!("unknown DR operation '{other}'")),
        }
    }
}
