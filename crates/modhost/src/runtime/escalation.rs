//! Operator decision on unrecoverable lifecycle failures

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::RuntimeError;

/// What to do when neither a load nor its rollback left working modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationDecision {
    /// Keep the process up in a degraded state
    Continue,
    /// Ask the process to shut down
    Terminate,
}

impl FromStr for EscalationDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "exit" | "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown escalation decision: {}", other)),
        }
    }
}

impl fmt::Display for EscalationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Decides between degraded operation and termination
pub trait Escalation: Send + Sync {
    fn decide(&self, error: &RuntimeError) -> EscalationDecision;
}

/// Always answers with the same decision
#[derive(Debug, Clone, Copy)]
pub struct FixedEscalation(pub EscalationDecision);

impl Escalation for FixedEscalation {
    fn decide(&self, error: &RuntimeError) -> EscalationDecision {
        tracing::error!(decision = %self.0, "Unrecoverable runtime failure: {}", error);
        self.0
    }
}

impl Default for FixedEscalation {
    fn default() -> Self {
        Self(EscalationDecision::Terminate)
    }
}
