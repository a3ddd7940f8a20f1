// Planos Library
// Plan orchestration engine for capability-scoped agent steps

pub mod approval;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod event_bus;
pub mod orchestrator;
pub mod policy_gate;
pub mod queue;
pub mod subject;
pub mod types;

pub use approval::{ApprovalChoice, ApprovalDecision};
pub use config::{DispatchConfig, EngineConfig, EventBusConfig, PolicyConfig};
pub use dispatch::{RetryPolicy, ToolBackend, ToolDispatchClient};
pub use errors::{ConfigError, DispatchError, DispatchErrorCode, EngineError, QueueError};
pub use event_bus::{HistoryQuery, StepEventBus, StepEventListener, Subscription};
pub use orchestrator::{Orchestrator, PlanProgress, PlanSubmission, SubmissionReceipt};
pub use policy_gate::{
    ActionSpec, DenialReason, PolicyDecision, PolicyGate, RunMode, RunModeConstraint, Ruleset,
    Subject,
};
pub use queue::{DeliveryHandler, DurableQueue, InMemoryQueue, StepDelivery};
pub use subject::SubjectDirectory;
pub use types::{
    DiffEntry, Plan, PlanId, PlanStep, StepDiff, StepEvent, StepId, StepSnapshot, StepState,
    ToolInvocation, ToolResult,
};
