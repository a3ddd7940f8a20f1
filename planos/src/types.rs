//! Core data model for the plan orchestration engine.
//!
//! A `Plan` decomposes a goal into an ordered sequence of capability-scoped
//! `PlanStep`s. The orchestrator exclusively owns step mutation; every other
//! component only ever sees read-only snapshots (`StepSnapshot` inside a
//! `StepEvent`) or ephemeral per-call requests (`ToolInvocation`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type PlanId = String;
pub type StepId = String;
pub type CapabilityId = String;
pub type TraceId = String;

/// Lifecycle state of a single plan step.
///
/// Transitions are monotonic: once a step reaches a terminal state it never
/// leaves it, and later queue deliveries for that step are no-ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Queued,
    Running,
    Retrying,
    WaitingApproval,
    Approved,
    Rejected,
    Completed,
    Failed,
    DeadLettered,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed
                | StepState::Failed
                | StepState::Rejected
                | StepState::DeadLettered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Queued => "queued",
            StepState::Running => "running",
            StepState::Retrying => "retrying",
            StepState::WaitingApproval => "waiting_approval",
            StepState::Approved => "approved",
            StepState::Rejected => "rejected",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One patched file inside a step's diff payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub patch: String,
}

/// Ordered set of file patches produced by a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDiff {
    pub files: Vec<DiffEntry>,
}

/// A single capability-scoped unit of work within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique within the owning plan.
    pub id: StepId,
    /// Action name, e.g. `read_repository`.
    pub action: String,
    /// Identifier of the tool backend this step is dispatched to.
    pub tool: String,
    /// Capability required to run this step, e.g. `repo.write`.
    pub capability: CapabilityId,
    /// Human-readable label for the capability, shown on approval surfaces.
    pub capability_label: String,
    /// Free-form labels; treated as a set, order irrelevant.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Timeout budget in seconds; the engine default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Park this step for a human decision before it may dispatch.
    #[serde(default)]
    pub approval_required: bool,
    /// Run-mode constraint of the step's action; `any` by default.
    #[serde(default)]
    pub run_mode: crate::policy_gate::RunModeConstraint,
    #[serde(default)]
    pub state: StepState,
    /// Outer (queue-driven) attempt counter. Dispatch-client RPC retries are
    /// invisible here.
    #[serde(default)]
    pub attempt: u32,
    /// Last human-readable transition summary.
    #[serde(default)]
    pub summary: String,
    /// Opaque payload handed to the tool backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Opaque structured output recorded from the tool backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<StepDiff>,
}

impl PlanStep {
    pub fn new(
        id: impl Into<StepId>,
        action: impl Into<String>,
        tool: impl Into<String>,
        capability: impl Into<CapabilityId>,
    ) -> Self {
        let capability = capability.into();
        Self {
            id: id.into(),
            action: action.into(),
            tool: tool.into(),
            capability_label: capability.clone(),
            capability,
            labels: Vec::new(),
            timeout_seconds: None,
            approval_required: false,
            run_mode: crate::policy_gate::RunModeConstraint::Any,
            state: StepState::Queued,
            attempt: 0,
            summary: String::new(),
            input: None,
            output: None,
            diff: None,
        }
    }

    pub fn with_capability_label(mut self, label: impl Into<String>) -> Self {
        self.capability_label = label.into();
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }

    pub fn with_run_mode(mut self, constraint: crate::policy_gate::RunModeConstraint) -> Self {
        self.run_mode = constraint;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// A goal decomposed into an ordered set of steps.
///
/// Immutable once created except for step state, which the orchestrator owns
/// exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Agent the plan runs as; resolved against the subject directory at
    /// submission and again at every delivery.
    pub agent: String,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, agent: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: format!("plan-{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            steps,
            success_criteria: Vec::new(),
            agent: agent.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_success_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }
}

/// Read-only snapshot of the step fields relevant to a transition, embedded
/// in every `StepEvent`. Serialized camelCase per the streaming wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub id: StepId,
    pub action: String,
    pub state: StepState,
    pub capability: CapabilityId,
    pub capability_label: String,
    pub labels: Vec<String>,
    pub tool: String,
    pub timeout_seconds: u64,
    pub approval_required: bool,
    pub attempt: u32,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StepSnapshot {
    /// Capture a step at transition time. `default_timeout_seconds` fills the
    /// wire field when the submitter left the budget unset.
    pub fn capture(step: &PlanStep, default_timeout_seconds: u64) -> Self {
        Self {
            id: step.id.clone(),
            action: step.action.clone(),
            state: step.state,
            capability: step.capability.clone(),
            capability_label: step.capability_label.clone(),
            labels: step.labels.clone(),
            tool: step.tool.clone(),
            timeout_seconds: step.timeout_seconds.unwrap_or(default_timeout_seconds),
            approval_required: step.approval_required,
            attempt: step.attempt,
            summary: step.summary.clone(),
            output: step.output.clone(),
        }
    }
}

/// Event kind tag carried by every step event.
pub const STEP_EVENT_KIND: &str = "plan.step";

/// Immutable record of a single step-state transition. Append-only; never
/// mutated after publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    /// Always `plan.step`.
    pub event: String,
    pub trace_id: TraceId,
    pub plan_id: PlanId,
    /// Assigned by the event bus at publication when the producer omits it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    pub step: StepSnapshot,
}

impl StepEvent {
    pub fn new(trace_id: impl Into<TraceId>, plan_id: impl Into<PlanId>, step: StepSnapshot) -> Self {
        Self {
            event: STEP_EVENT_KIND.to_string(),
            trace_id: trace_id.into(),
            plan_id: plan_id.into(),
            occurred_at: None,
            step,
        }
    }

    pub fn state(&self) -> StepState {
        self.step.state
    }
}

/// Ephemeral request handed to the dispatch client. Not persisted beyond the
/// RPC's lifetime; results fold back into `PlanStep`/`StepEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Stable id derived from (plan id, step id, attempt); backends that have
    /// already completed this id must return the prior result rather than
    /// re-executing.
    pub invocation_id: String,
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub tool: String,
    pub capability: CapabilityId,
    pub capability_label: String,
    pub labels: Vec<String>,
    pub input: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Per-call timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolInvocation {
    /// Derive the stable invocation id for a given outer attempt.
    pub fn derive_id(plan_id: &str, step_id: &str, attempt: u32) -> String {
        format!("{}:{}:{}", plan_id, step_id, attempt)
    }
}

/// One result record emitted by a tool backend. A single call may emit a
/// sequence of progress-like results; the final record settles the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: String,
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub state: StepState,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<StepDiff>,
    pub occurred_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn completed(invocation: &ToolInvocation, summary: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation.invocation_id.clone(),
            plan_id: invocation.plan_id.clone(),
            step_id: invocation.step_id.clone(),
            state: StepState::Completed,
            summary: summary.into(),
            output: None,
            diff: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn progress(invocation: &ToolInvocation, summary: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation.invocation_id.clone(),
            plan_id: invocation.plan_id.clone(),
            step_id: invocation.step_id.clone(),
            state: StepState::Running,
            summary: summary.into(),
            output: None,
            diff: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_diff(mut self, diff: StepDiff) -> Self {
        self.diff = Some(diff);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_the_four_terminals() {
        let terminals = [
            StepState::Completed,
            StepState::Failed,
            StepState::Rejected,
            StepState::DeadLettered,
        ];
        for state in terminals {
            assert!(state.is_terminal(), "{} should be terminal", state);
        }
        for state in [
            StepState::Queued,
            StepState::Running,
            StepState::Retrying,
            StepState::WaitingApproval,
            StepState::Approved,
        ] {
            assert!(!state.is_terminal(), "{} should not be terminal", state);
        }
    }

    #[test]
    fn step_event_wire_shape_is_camel_case() {
        let step = PlanStep::new("s1", "read_repository", "repo-tool", "repo.read");
        let event = StepEvent::new("trace-1", "plan-1", StepSnapshot::capture(&step, 900));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "plan.step");
        assert_eq!(json["traceId"], "trace-1");
        assert_eq!(json["planId"], "plan-1");
        assert_eq!(json["step"]["capabilityLabel"], "repo.read");
        assert_eq!(json["step"]["timeoutSeconds"], 900);
        assert_eq!(json["step"]["state"], "queued");
        // bus has not assigned a timestamp yet
        assert!(json.get("occurredAt").is_none());
    }

    #[test]
    fn invocation_id_is_stable_per_attempt() {
        assert_eq!(ToolInvocation::derive_id("p1", "s1", 0), "p1:s1:0");
        assert_eq!(ToolInvocation::derive_id("p1", "s1", 2), "p1:s1:2");
    }
}
