//! Plan orchestration engine.
//!
//! The orchestrator owns the step state machine per plan. It validates
//! submissions, gates every step through the capability policy, pushes
//! dispatchable steps onto the durable queue, consumes deliveries, re-checks
//! policy before execution (grants can change between submission and
//! delivery), parks approval-gated steps for a human decision, drives the
//! dispatch client, and publishes every transition to the event bus.
//!
//! Transitions for one plan are serialized behind the plan record's lock;
//! the lock is released while a dispatch RPC is in flight, so approvals and
//! cancellation stay responsive. Steps of different plans run concurrently.

use crate::approval::{ApprovalDecision, RecordedDecision};
use crate::config::EngineConfig;
use crate::dispatch::ToolDispatchClient;
use crate::errors::{EngineError, QueueError};
use crate::event_bus::StepEventBus;
use crate::policy_gate::{ActionSpec, PolicyDecision, PolicyGate, Subject};
use crate::queue::{DeliveryHandler, DurableQueue, StepDelivery};
use crate::subject::SubjectDirectory;
use crate::types::{
    CapabilityId, PlanId, PlanStep, StepEvent, StepId, StepSnapshot, StepState, ToolInvocation,
    TraceId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// A plan handed to the engine for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSubmission {
    pub goal: String,
    /// Agent the plan runs as; must be registered in the subject directory.
    pub agent: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl PlanSubmission {
    pub fn new(goal: impl Into<String>, agent: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            goal: goal.into(),
            agent: agent.into(),
            steps,
            success_criteria: Vec::new(),
        }
    }

    pub fn with_success_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }
}

/// Outcome of a submission: the assigned ids plus the denial decision for
/// every step rejected at submission time.
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub plan_id: PlanId,
    pub trace_id: TraceId,
    pub rejected_steps: Vec<(StepId, PolicyDecision)>,
}

/// Per-plan aggregate for operator surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProgress {
    pub plan_id: PlanId,
    pub counts: HashMap<StepState, usize>,
    /// True once every step has reached a terminal state.
    pub settled: bool,
}

struct PlanRecord {
    plan_id: PlanId,
    trace_id: TraceId,
    goal: String,
    agent: String,
    created_at: DateTime<Utc>,
    success_criteria: Vec<String>,
    steps: IndexMap<StepId, PlanStep>,
    /// Steps that must park for a human decision before dispatch: the
    /// submitter's `approval_required` flag plus every step whose only
    /// submission-time denials were missing approvals.
    needs_approval: HashSet<StepId>,
    decisions: HashMap<StepId, RecordedDecision>,
    /// Capabilities approved through step decisions on this plan; these
    /// augment the subject snapshot at delivery-time re-checks.
    approved_capabilities: HashSet<CapabilityId>,
}

/// The engine. Construct once per process with its collaborators injected,
/// then `start` to attach the queue consumer.
pub struct Orchestrator {
    config: EngineConfig,
    gate: Arc<PolicyGate>,
    subjects: Arc<SubjectDirectory>,
    queue: Arc<dyn DurableQueue>,
    dispatch: Arc<ToolDispatchClient>,
    bus: Arc<StepEventBus>,
    plans: RwLock<HashMap<PlanId, Arc<Mutex<PlanRecord>>>>,
    /// Invocation ids already dispatched, kept for the dedupe window to
    /// absorb the queue's at-least-once redeliveries.
    seen_invocations: DashMap<String, DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        gate: Arc<PolicyGate>,
        subjects: Arc<SubjectDirectory>,
        queue: Arc<dyn DurableQueue>,
        dispatch: Arc<ToolDispatchClient>,
        bus: Arc<StepEventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            gate,
            subjects,
            queue,
            dispatch,
            bus,
            plans: RwLock::new(HashMap::new()),
            seen_invocations: DashMap::new(),
        })
    }

    /// Attach this engine as the queue consumer.
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        self.queue.consume(self.clone()).await
    }

    /// Validate, normalize, policy-gate, and enqueue a plan.
    ///
    /// Steps with a hard denial (missing capability, run-mode mismatch) are
    /// rejected at submission and never enqueued; steps whose only denials
    /// are missing approvals are enqueued and will park for a decision.
    pub async fn submit_plan(
        &self,
        submission: PlanSubmission,
    ) -> Result<SubmissionReceipt, EngineError> {
        if submission.goal.trim().is_empty() {
            return Err(EngineError::InvalidPlan("goal must not be empty".into()));
        }
        if submission.steps.is_empty() {
            return Err(EngineError::InvalidPlan(
                "plan must contain at least one step".into(),
            ));
        }
        let subject = self
            .subjects
            .subject(&submission.agent)
            .ok_or_else(|| EngineError::UnknownSubject(submission.agent.clone()))?;

        let plan_id = format!("plan-{}", Uuid::new_v4());
        let trace_id = Uuid::new_v4().to_string();

        let mut steps: IndexMap<StepId, PlanStep> = IndexMap::new();
        let mut needs_approval = HashSet::new();
        let mut rejected_steps = Vec::new();
        for mut step in submission.steps {
            if steps.contains_key(&step.id) {
                return Err(EngineError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            step.state = StepState::Queued;
            step.attempt = 0;
            step.labels.sort();
            step.labels.dedup();

            let decision = self.gate.evaluate(&subject, &step_action(&step));
            if !decision.is_allowed() {
                if decision.only_approval_denials() {
                    needs_approval.insert(step.id.clone());
                } else {
                    step.state = StepState::Rejected;
                    step.summary = format!("rejected at submission: {}", decision.summary());
                    rejected_steps.push((step.id.clone(), decision));
                }
            }
            if step.approval_required {
                needs_approval.insert(step.id.clone());
            }
            steps.insert(step.id.clone(), step);
        }
        let step_count = steps.len();

        let record_arc = Arc::new(Mutex::new(PlanRecord {
            plan_id: plan_id.clone(),
            trace_id: trace_id.clone(),
            goal: submission.goal,
            agent: submission.agent,
            created_at: Utc::now(),
            success_criteria: submission.success_criteria,
            steps,
            needs_approval,
            decisions: HashMap::new(),
            approved_capabilities: HashSet::new(),
        }));
        self.plans
            .write()
            .await
            .insert(plan_id.clone(), record_arc.clone());

        // Publish the initial transitions and enqueue admissible steps. The
        // record lock keeps deliveries from interleaving with submission.
        {
            let mut record = record_arc.lock().await;
            let step_ids: Vec<StepId> = record.steps.keys().cloned().collect();
            for step_id in step_ids {
                let step = record.steps[&step_id].clone();
                self.publish_step(&record, &step);
                if step.state == StepState::Queued {
                    let delivery = StepDelivery::new(plan_id.clone(), step, 0);
                    if let Err(err) = self.queue.enqueue(delivery).await {
                        self.fail_step(
                            &mut record,
                            &step_id,
                            format!("queue unavailable: {}", err),
                        );
                    }
                }
            }
        }

        log::info!(
            "plan {} submitted ({} steps, {} rejected at submission)",
            plan_id,
            step_count,
            rejected_steps.len()
        );
        Ok(SubmissionReceipt {
            plan_id,
            trace_id,
            rejected_steps,
        })
    }

    /// Record a human decision for a step parked in `waiting_approval`.
    ///
    /// Decisions for steps in any other state are conflicts and mutate
    /// nothing.
    pub async fn submit_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), EngineError> {
        let record_arc = self.plan_record(plan_id).await?;
        let mut record = record_arc.lock().await;
        let state = record
            .steps
            .get(step_id)
            .map(|s| s.state)
            .ok_or_else(|| EngineError::StepNotFound {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        if state != StepState::WaitingApproval {
            return Err(EngineError::ApprovalConflict {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
                state,
            });
        }

        let recorded = RecordedDecision::from_decision(&decision);
        let approved = recorded.is_approval();
        record.decisions.insert(step_id.to_string(), recorded);

        if approved {
            let snapshot = {
                let step = match record.steps.get_mut(step_id) {
                    Some(step) => step,
                    None => return Ok(()),
                };
                step.state = StepState::Approved;
                step.summary = match &decision.rationale {
                    Some(r) => format!("approved: {}", r),
                    None => format!("approved for {}", step.capability_label),
                };
                step.clone()
            };
            record.approved_capabilities.insert(snapshot.capability.clone());
            self.publish_step(&record, &snapshot);

            // Re-enter the dispatch path at the current attempt.
            let attempt = snapshot.attempt;
            let delivery = StepDelivery::new(plan_id.to_string(), snapshot, attempt);
            if let Err(err) = self.queue.enqueue(delivery).await {
                self.fail_step(&mut record, step_id, format!("queue unavailable: {}", err));
            }
        } else {
            let snapshot = {
                let step = match record.steps.get_mut(step_id) {
                    Some(step) => step,
                    None => return Ok(()),
                };
                step.state = StepState::Rejected;
                step.summary = match &decision.rationale {
                    Some(r) => format!("rejected by approver: {}", r),
                    None => "rejected by approver".to_string(),
                };
                step.clone()
            };
            self.publish_step(&record, &snapshot);
        }
        Ok(())
    }

    /// Fail every non-terminal step of a plan with reason `cancelled`.
    pub async fn cancel_plan(&self, plan_id: &str) -> Result<(), EngineError> {
        let record_arc = self.plan_record(plan_id).await?;
        let mut record = record_arc.lock().await;
        let open_steps: Vec<StepId> = record
            .steps
            .values()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        for step_id in open_steps {
            self.fail_step(&mut record, &step_id, "cancelled".to_string());
        }
        log::info!("plan {} cancelled", plan_id);
        Ok(())
    }

    /// Current per-state step counts for a plan.
    pub async fn plan_progress(&self, plan_id: &str) -> Result<PlanProgress, EngineError> {
        let record_arc = self.plan_record(plan_id).await?;
        let record = record_arc.lock().await;
        let mut counts: HashMap<StepState, usize> = HashMap::new();
        for step in record.steps.values() {
            *counts.entry(step.state).or_insert(0) += 1;
        }
        let settled = record.steps.values().all(|s| s.state.is_terminal());
        Ok(PlanProgress {
            plan_id: plan_id.to_string(),
            counts,
            settled,
        })
    }

    /// Snapshot of one step's current fields.
    pub async fn step(&self, plan_id: &str, step_id: &str) -> Result<PlanStep, EngineError> {
        let record_arc = self.plan_record(plan_id).await?;
        let record = record_arc.lock().await;
        record
            .steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| EngineError::StepNotFound {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
            })
    }

    /// Reconstruct the immutable plan view with current step states.
    pub async fn plan(&self, plan_id: &str) -> Result<crate::types::Plan, EngineError> {
        let record_arc = self.plan_record(plan_id).await?;
        let record = record_arc.lock().await;
        Ok(crate::types::Plan {
            plan_id: record.plan_id.clone(),
            goal: record.goal.clone(),
            steps: record.steps.values().cloned().collect(),
            success_criteria: record.success_criteria.clone(),
            agent: record.agent.clone(),
            created_at: record.created_at,
        })
    }

    async fn plan_record(&self, plan_id: &str) -> Result<Arc<Mutex<PlanRecord>>, EngineError> {
        self.plans
            .read()
            .await
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))
    }

    fn publish_step(&self, record: &PlanRecord, step: &PlanStep) {
        let snapshot = StepSnapshot::capture(step, self.config.default_timeout_secs);
        self.bus.publish(StepEvent::new(
            record.trace_id.clone(),
            record.plan_id.clone(),
            snapshot,
        ));
    }

    /// The subject's current grants, augmented with approvals recorded
    /// through step decisions on this plan.
    fn effective_subject(&self, record: &PlanRecord) -> Option<Subject> {
        let mut subject = self.subjects.subject(&record.agent)?;
        for capability in &record.approved_capabilities {
            subject.approvals.insert(capability.clone(), true);
        }
        Some(subject)
    }

    fn prune_seen_invocations(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.dedupe_window_secs as i64);
        self.seen_invocations.retain(|_, seen_at| *seen_at > cutoff);
    }

    /// Handle one queue delivery. The plan lock is taken and released around
    /// each transition so no lock is held while the RPC is in flight.
    async fn process_delivery(&self, record_arc: Arc<Mutex<PlanRecord>>, delivery: StepDelivery) {
        let Some(invocation) = self.begin_dispatch(&record_arc, &delivery).await else {
            return;
        };

        // RPC in flight with no plan lock held.
        let outcome = self.dispatch.execute_tool(&invocation).await;

        let mut record = record_arc.lock().await;
        let state = match record.steps.get(&delivery.step_id) {
            Some(step) => step.state,
            None => return,
        };
        if state.is_terminal() {
            // Cancelled (or otherwise settled) while the RPC was in flight;
            // terminal states absorb the result.
            log::debug!(
                "discarding dispatch result for settled step {} of plan {}",
                delivery.step_id,
                delivery.plan_id
            );
            return;
        }

        match outcome {
            Ok(results) => self.complete_step(&mut record, &delivery, results),
            Err(err) if err.retryable => {
                self.retry_or_dead_letter(&mut record, &record_arc, &delivery, &err)
            }
            Err(err) => {
                self.fail_step(&mut record, &delivery.step_id, err.to_string());
            }
        }
    }

    /// Run the pre-dispatch checks under the plan lock: terminal no-op,
    /// duplicate-delivery dedupe, policy re-check, approval parking. Returns
    /// the invocation to execute, or `None` when the delivery is consumed
    /// without an RPC.
    async fn begin_dispatch(
        &self,
        record_arc: &Arc<Mutex<PlanRecord>>,
        delivery: &StepDelivery,
    ) -> Option<ToolInvocation> {
        let mut record = record_arc.lock().await;
        let step = match record.steps.get(&delivery.step_id) {
            Some(step) => step.clone(),
            None => {
                log::warn!(
                    "delivery for unknown step {} of plan {}",
                    delivery.step_id,
                    delivery.plan_id
                );
                return None;
            }
        };
        if step.state.is_terminal() {
            log::debug!(
                "delivery for settled step {} of plan {} ignored",
                delivery.step_id,
                delivery.plan_id
            );
            return None;
        }

        self.prune_seen_invocations();
        if self.seen_invocations.contains_key(&delivery.invocation_id) {
            log::debug!("duplicate delivery {} absorbed", delivery.invocation_id);
            return None;
        }

        // Re-check policy against current grants: approvals or capabilities
        // may have been revoked between submission and delivery.
        let Some(subject) = self.effective_subject(&record) else {
            self.fail_step(
                &mut record,
                &delivery.step_id,
                "subject no longer registered".to_string(),
            );
            return None;
        };
        let decision = self.gate.evaluate(&subject, &step_action(&step));
        let decided_approved = record
            .decisions
            .get(&delivery.step_id)
            .map(|d| d.is_approval())
            .unwrap_or(false);

        if !decision.is_allowed() {
            let may_park = decision.only_approval_denials()
                && record.needs_approval.contains(&delivery.step_id)
                && !decided_approved;
            if may_park {
                self.park_step(&mut record, &delivery.step_id);
            } else {
                self.fail_step(
                    &mut record,
                    &delivery.step_id,
                    format!("policy_revoked: {}", decision.summary()),
                );
            }
            return None;
        }

        if step.approval_required && !decided_approved {
            self.park_step(&mut record, &delivery.step_id);
            return None;
        }

        // Clear to dispatch.
        let snapshot = {
            let step = record.steps.get_mut(&delivery.step_id)?;
            step.state = StepState::Running;
            step.attempt = delivery.attempt;
            step.summary = format!("dispatching to {}", step.tool);
            step.clone()
        };
        self.publish_step(&record, &snapshot);
        self.seen_invocations
            .insert(delivery.invocation_id.clone(), Utc::now());

        let timeout_secs = snapshot
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_secs);
        let mut metadata = HashMap::new();
        metadata.insert("goal".to_string(), record.goal.clone());
        metadata.insert("trace_id".to_string(), record.trace_id.clone());
        Some(ToolInvocation {
            invocation_id: delivery.invocation_id.clone(),
            plan_id: record.plan_id.clone(),
            step_id: snapshot.id.clone(),
            tool: snapshot.tool.clone(),
            capability: snapshot.capability.clone(),
            capability_label: snapshot.capability_label.clone(),
            labels: snapshot.labels.clone(),
            input: snapshot.input.clone().unwrap_or(serde_json::Value::Null),
            metadata,
            timeout_ms: Some(timeout_secs * 1_000),
        })
    }

    /// Fold the backend's ordered result sequence into the step: progress
    /// results update the summary and publish as `running`; the final result
    /// settles the step as `completed`.
    fn complete_step(
        &self,
        record: &mut PlanRecord,
        delivery: &StepDelivery,
        results: Vec<crate::types::ToolResult>,
    ) {
        let total = results.len();
        let mut snapshots = Vec::new();
        if let Some(step) = record.steps.get_mut(&delivery.step_id) {
            if total == 0 {
                step.state = StepState::Completed;
                step.summary = "completed with no result".to_string();
                snapshots.push(step.clone());
            } else {
                for (index, result) in results.into_iter().enumerate() {
                    step.summary = result.summary;
                    if let Some(output) = result.output {
                        step.output = Some(output);
                    }
                    if let Some(diff) = result.diff {
                        step.diff = Some(diff);
                    }
                    if index + 1 == total {
                        step.state = StepState::Completed;
                    }
                    snapshots.push(step.clone());
                }
            }
        }
        for snapshot in &snapshots {
            self.publish_step(record, snapshot);
        }
    }

    /// Transient dispatch failure: consume one outer attempt, then either
    /// schedule a redelivery after backoff or dead-letter the step.
    fn retry_or_dead_letter(
        &self,
        record: &mut PlanRecord,
        record_arc: &Arc<Mutex<PlanRecord>>,
        delivery: &StepDelivery,
        err: &crate::errors::DispatchError,
    ) {
        let consumed = delivery.attempt + 1;
        let budget = self.config.outer_retry.max_attempts;
        if consumed < budget {
            let snapshot = {
                let Some(step) = record.steps.get_mut(&delivery.step_id) else {
                    return;
                };
                step.state = StepState::Retrying;
                step.attempt = consumed;
                step.summary = format!("retrying after transient failure: {}", err);
                step.clone()
            };
            self.publish_step(record, &snapshot);
            log::warn!(
                "step {} of plan {} retrying (attempt {} of {})",
                delivery.step_id,
                delivery.plan_id,
                consumed,
                budget
            );
            self.schedule_redelivery(record_arc.clone(), snapshot, consumed);
        } else {
            let snapshot = {
                let Some(step) = record.steps.get_mut(&delivery.step_id) else {
                    return;
                };
                step.state = StepState::DeadLettered;
                step.attempt = consumed;
                step.summary = format!("dead-lettered after {} attempts: {}", consumed, err);
                step.clone()
            };
            self.publish_step(record, &snapshot);
            log::warn!(
                "step {} of plan {} dead-lettered after {} attempts",
                delivery.step_id,
                delivery.plan_id,
                consumed
            );
        }
    }

    fn park_step(&self, record: &mut PlanRecord, step_id: &str) {
        let snapshot = {
            let Some(step) = record.steps.get_mut(step_id) else {
                return;
            };
            if step.state == StepState::WaitingApproval {
                return;
            }
            step.state = StepState::WaitingApproval;
            step.summary = format!("awaiting approval for {}", step.capability_label);
            step.clone()
        };
        self.publish_step(record, &snapshot);
    }

    fn fail_step(&self, record: &mut PlanRecord, step_id: &str, summary: String) {
        let snapshot = {
            let Some(step) = record.steps.get_mut(step_id) else {
                return;
            };
            step.state = StepState::Failed;
            step.summary = summary;
            step.clone()
        };
        log::warn!(
            "step {} of plan {} failed: {}",
            step_id,
            record.plan_id,
            snapshot.summary
        );
        self.publish_step(record, &snapshot);
    }

    /// Re-enqueue a retrying step after the outer backoff delay. If the
    /// queue is unavailable at redelivery time the step is failed rather
    /// than left in `retrying` forever.
    fn schedule_redelivery(
        &self,
        record_arc: Arc<Mutex<PlanRecord>>,
        step: PlanStep,
        attempt: u32,
    ) {
        let delay = self.config.outer_retry.delay_for_attempt(attempt - 1);
        let queue = self.queue.clone();
        let bus = self.bus.clone();
        let default_timeout = self.config.default_timeout_secs;
        let step_id = step.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let plan_id = {
                let record = record_arc.lock().await;
                record.plan_id.clone()
            };
            let delivery = StepDelivery::new(plan_id, step, attempt);
            if let Err(err) = queue.enqueue(delivery).await {
                let mut record = record_arc.lock().await;
                let snapshot = {
                    let Some(step) = record.steps.get_mut(&step_id) else {
                        return;
                    };
                    if step.state.is_terminal() {
                        return;
                    }
                    step.state = StepState::Failed;
                    step.summary = format!("queue unavailable: {}", err);
                    step.clone()
                };
                log::warn!(
                    "step {} of plan {} failed: could not re-enqueue: {}",
                    step_id,
                    record.plan_id,
                    err
                );
                bus.publish(StepEvent::new(
                    record.trace_id.clone(),
                    record.plan_id.clone(),
                    StepSnapshot::capture(&snapshot, default_timeout),
                ));
            }
        });
    }
}

#[async_trait]
impl DeliveryHandler for Orchestrator {
    async fn handle_delivery(&self, delivery: StepDelivery) {
        let record_arc = match self.plan_record(&delivery.plan_id).await {
            Ok(record) => record,
            Err(_) => {
                log::warn!("delivery for unknown plan {} dropped", delivery.plan_id);
                return;
            }
        };
        self.process_delivery(record_arc, delivery).await;
    }
}

fn step_action(step: &PlanStep) -> ActionSpec {
    ActionSpec::new(step.action.clone(), vec![step.capability.clone()]).with_run_mode(step.run_mode)
}
