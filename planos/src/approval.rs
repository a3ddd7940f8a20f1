//! Approval decision types.
//!
//! A step parked in `waiting_approval` is resolved by an external decision
//! submitted against (plan id, step id). Decisions for steps in any other
//! state are conflicts and must not mutate state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The decision itself, as received from the approval surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalChoice {
    Approve,
    Reject,
}

impl fmt::Display for ApprovalChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalChoice::Approve => write!(f, "approve"),
            ApprovalChoice::Reject => write!(f, "reject"),
        }
    }
}

/// External approval input: `{decision: "approve"|"reject", rationale?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: ApprovalChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            decision: ApprovalChoice::Approve,
            rationale: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            decision: ApprovalChoice::Reject,
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn is_approval(&self) -> bool {
        self.decision == ApprovalChoice::Approve
    }
}

/// A decision as recorded on the plan, with its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedDecision {
    pub decision: ApprovalChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl RecordedDecision {
    pub fn from_decision(decision: &ApprovalDecision) -> Self {
        Self {
            decision: decision.decision,
            rationale: decision.rationale.clone(),
            decided_at: Utc::now(),
        }
    }

    pub fn is_approval(&self) -> bool {
        self.decision == ApprovalChoice::Approve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_wire_shape() {
        let json: ApprovalDecision =
            serde_json::from_str(r#"{"decision": "reject", "rationale": "too risky"}"#).unwrap();
        assert_eq!(json.decision, ApprovalChoice::Reject);
        assert_eq!(json.rationale.as_deref(), Some("too risky"));

        let bare: ApprovalDecision = serde_json::from_str(r#"{"decision": "approve"}"#).unwrap();
        assert!(bare.is_approval());
        assert!(bare.rationale.is_none());
    }
}
