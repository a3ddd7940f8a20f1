//! Capability policy gate.
//!
//! The gate is the mandatory intermediary between plan submission and step
//! dispatch: a pure decision function over a subject's current grants and an
//! action's requirements. It holds no state beyond the loaded ruleset, so it
//! is safe to re-evaluate at submission time and again at delivery time to
//! catch grants revoked in between.
//!
//! If the ruleset fails to load the gate fails closed: every action is denied
//! rather than default-allowed.

use crate::config::PolicyConfig;
use crate::types::CapabilityId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Deployment posture constraining which actions are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Consumer,
    Enterprise,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Consumer => write!(f, "consumer"),
            RunMode::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Run-mode constraint an action may declare. Defaults to `Any`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunModeConstraint {
    Consumer,
    Enterprise,
    #[default]
    Any,
}

impl RunModeConstraint {
    pub fn permits(&self, mode: RunMode) -> bool {
        match self {
            RunModeConstraint::Any => true,
            RunModeConstraint::Consumer => mode == RunMode::Consumer,
            RunModeConstraint::Enterprise => mode == RunMode::Enterprise,
        }
    }
}

/// The acting identity: an agent, the capabilities it currently holds, the
/// approvals recorded against it, and its run mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub agent: String,
    pub capabilities: Vec<CapabilityId>,
    /// Capability → approval granted. Absence means no approval recorded.
    #[serde(default)]
    pub approvals: HashMap<CapabilityId, bool>,
    pub run_mode: RunMode,
}

impl Subject {
    pub fn new(agent: impl Into<String>, run_mode: RunMode) -> Self {
        Self {
            agent: agent.into(),
            capabilities: Vec::new(),
            approvals: HashMap::new(),
            run_mode,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<CapabilityId>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_approval(mut self, capability: impl Into<CapabilityId>, granted: bool) -> Self {
        self.approvals.insert(capability.into(), granted);
        self
    }

    pub fn holds(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn approval_granted(&self, capability: &str) -> bool {
        self.approvals.get(capability).copied().unwrap_or(false)
    }
}

/// The requirements side of a policy check: an action type, the capability
/// set it needs, and an optional run-mode constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    pub capabilities: Vec<CapabilityId>,
    #[serde(default)]
    pub run_mode: RunModeConstraint,
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>, capabilities: Vec<CapabilityId>) -> Self {
        Self {
            action_type: action_type.into(),
            capabilities,
            run_mode: RunModeConstraint::Any,
        }
    }

    pub fn with_run_mode(mut self, constraint: RunModeConstraint) -> Self {
        self.run_mode = constraint;
        self
    }
}

/// One structured denial reason. Serialized as `{reason, capability?}` per
/// the policy ruleset output contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    MissingCapability { capability: CapabilityId },
    ApprovalRequired { capability: CapabilityId },
    RunModeMismatch,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::MissingCapability { capability } => {
                write!(f, "missing capability '{}'", capability)
            }
            DenialReason::ApprovalRequired { capability } => {
                write!(f, "approval required for '{}'", capability)
            }
            DenialReason::RunModeMismatch => write!(f, "run mode mismatch"),
        }
    }
}

/// Gate output: `allow` iff the denial set is empty. Denials accumulate and
/// are never short-circuited, so a caller can present every remediation step
/// at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default)]
    pub deny: Vec<DenialReason>,
}

impl PolicyDecision {
    pub fn allowed() -> Self {
        Self {
            allow: true,
            deny: Vec::new(),
        }
    }

    pub fn denied(reasons: Vec<DenialReason>) -> Self {
        Self {
            allow: reasons.is_empty(),
            deny: reasons,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    /// True when the only obstacles are missing approvals; such a step may be
    /// parked for a human decision instead of being rejected outright.
    pub fn only_approval_denials(&self) -> bool {
        !self.allow
            && self
                .deny
                .iter()
                .all(|r| matches!(r, DenialReason::ApprovalRequired { .. }))
    }

    /// Human-readable one-line summary of the denial set.
    pub fn summary(&self) -> String {
        if self.allow {
            return "allowed".to_string();
        }
        let reasons: Vec<String> = self.deny.iter().map(|r| r.to_string()).collect();
        reasons.join("; ")
    }
}

/// Compiled policy ruleset: which capabilities are approval-gated.
///
/// The table is explicit configuration, not an inline literal, so deployments
/// can override which capabilities require a standing approval.
#[derive(Debug, Clone)]
pub struct Ruleset {
    approval_gated: HashSet<CapabilityId>,
}

impl Ruleset {
    pub fn new(approval_gated: HashSet<CapabilityId>) -> Self {
        Self { approval_gated }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        let approval_gated = config
            .approval_gated
            .iter()
            .filter(|(_, gated)| **gated)
            .map(|(capability, _)| capability.clone())
            .collect();
        Self { approval_gated }
    }

    pub fn requires_approval(&self, capability: &str) -> bool {
        self.approval_gated.contains(capability)
    }
}

impl Default for Ruleset {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

enum GateState {
    Ready(Ruleset),
    /// Ruleset failed to load or compile; deny everything.
    FailedClosed(String),
}

/// The policy gate. `evaluate` is pure and side-effect free; the compiled
/// ruleset is the only cached state, and decisions are never cached.
pub struct PolicyGate {
    state: GateState,
}

impl PolicyGate {
    pub fn new(ruleset: Ruleset) -> Self {
        Self {
            state: GateState::Ready(ruleset),
        }
    }

    /// Construct a gate that denies every action, used when the ruleset
    /// could not be loaded. The load error is kept for logging.
    pub fn fail_closed(error: impl Into<String>) -> Self {
        let error = error.into();
        log::warn!("policy ruleset unavailable, gate failing closed: {}", error);
        Self {
            state: GateState::FailedClosed(error),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(Ruleset::from_config(config))
    }

    /// Evaluate an action against a subject's current grants.
    pub fn evaluate(&self, subject: &Subject, action: &ActionSpec) -> PolicyDecision {
        let ruleset = match &self.state {
            GateState::Ready(ruleset) => ruleset,
            GateState::FailedClosed(_) => {
                // No infrastructure-failure reason exists in the output
                // contract; report every required capability as missing.
                let reasons = action
                    .capabilities
                    .iter()
                    .map(|capability| DenialReason::MissingCapability {
                        capability: capability.clone(),
                    })
                    .collect();
                return PolicyDecision::denied(reasons);
            }
        };

        let mut reasons = Vec::new();
        for capability in &action.capabilities {
            if !subject.holds(capability) {
                reasons.push(DenialReason::MissingCapability {
                    capability: capability.clone(),
                });
            }
            if ruleset.requires_approval(capability) && !subject.approval_granted(capability) {
                reasons.push(DenialReason::ApprovalRequired {
                    capability: capability.clone(),
                });
            }
        }
        if !action.run_mode.permits(subject.run_mode) {
            reasons.push(DenialReason::RunModeMismatch);
        }

        if reasons.is_empty() {
            PolicyDecision::allowed()
        } else {
            PolicyDecision::denied(reasons)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> PolicyGate {
        PolicyGate::new(Ruleset::default())
    }

    fn subject_with(caps: &[&str]) -> Subject {
        Subject::new("agent-1", RunMode::Consumer)
            .with_capabilities(caps.iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn allow_iff_denial_set_is_empty() {
        let subject = subject_with(&["repo.read"]);
        let action = ActionSpec::new("read_repository", vec!["repo.read".to_string()]);
        let decision = gate().evaluate(&subject, &action);
        assert!(decision.allow);
        assert!(decision.deny.is_empty());
    }

    #[test]
    fn missing_capability_is_denied() {
        let subject = subject_with(&[]);
        let action = ActionSpec::new("read_repository", vec!["repo.read".to_string()]);
        let decision = gate().evaluate(&subject, &action);
        assert!(!decision.allow);
        assert_eq!(
            decision.deny,
            vec![DenialReason::MissingCapability {
                capability: "repo.read".to_string()
            }]
        );
    }

    #[test]
    fn approval_gated_capability_denied_even_when_held() {
        let subject = subject_with(&["repo.write"]);
        let action = ActionSpec::new("write_diff", vec!["repo.write".to_string()]);
        let decision = gate().evaluate(&subject, &action);
        assert!(!decision.allow);
        assert_eq!(
            decision.deny,
            vec![DenialReason::ApprovalRequired {
                capability: "repo.write".to_string()
            }]
        );
        assert!(decision.only_approval_denials());
    }

    #[test]
    fn recorded_approval_clears_the_approval_denial() {
        let subject = subject_with(&["repo.write"]).with_approval("repo.write", true);
        let action = ActionSpec::new("write_diff", vec!["repo.write".to_string()]);
        let decision = gate().evaluate(&subject, &action);
        assert!(decision.allow, "got: {}", decision.summary());
    }

    #[test]
    fn denials_accumulate_without_short_circuit() {
        let subject = subject_with(&["network.egress"]);
        let action = ActionSpec::new(
            "call_service",
            vec!["repo.write".to_string(), "network.egress".to_string()],
        )
        .with_run_mode(RunModeConstraint::Enterprise);
        let decision = gate().evaluate(&subject, &action);
        assert!(!decision.allow);
        // repo.write missing + approval-gated, network.egress approval-gated,
        // and the run-mode constraint all report at once.
        assert_eq!(decision.deny.len(), 4);
        assert!(decision
            .deny
            .contains(&DenialReason::MissingCapability {
                capability: "repo.write".to_string()
            }));
        assert!(decision
            .deny
            .contains(&DenialReason::ApprovalRequired {
                capability: "repo.write".to_string()
            }));
        assert!(decision
            .deny
            .contains(&DenialReason::ApprovalRequired {
                capability: "network.egress".to_string()
            }));
        assert!(decision.deny.contains(&DenialReason::RunModeMismatch));
    }

    #[test]
    fn run_mode_any_permits_both_modes() {
        let action = ActionSpec::new("read_repository", vec!["repo.read".to_string()]);
        for mode in [RunMode::Consumer, RunMode::Enterprise] {
            let subject = Subject::new("agent-1", mode)
                .with_capabilities(vec!["repo.read".to_string()]);
            assert!(gate().evaluate(&subject, &action).allow);
        }
    }

    #[test]
    fn decisions_are_stable_for_identical_inputs() {
        let subject = subject_with(&["repo.write"]);
        let action = ActionSpec::new("write_diff", vec!["repo.write".to_string()]);
        let gate = gate();
        let first = gate.evaluate(&subject, &action);
        let second = gate.evaluate(&subject, &action);
        assert_eq!(first, second);
    }

    #[test]
    fn failed_ruleset_fails_closed() {
        let gate = PolicyGate::fail_closed("ruleset parse error");
        let subject = subject_with(&["repo.read"]);
        let action = ActionSpec::new("read_repository", vec!["repo.read".to_string()]);
        let decision = gate.evaluate(&subject, &action);
        assert!(!decision.allow, "fail-closed gate must deny");
        assert!(!decision.deny.is_empty());
    }

    #[test]
    fn denial_reason_wire_shape() {
        let reason = DenialReason::MissingCapability {
            capability: "repo.read".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "missing_capability");
        assert_eq!(json["capability"], "repo.read");

        let mismatch = serde_json::to_value(&DenialReason::RunModeMismatch).unwrap();
        assert_eq!(mismatch["reason"], "run_mode_mismatch");
        assert!(mismatch.get("capability").is_none());
    }
}
