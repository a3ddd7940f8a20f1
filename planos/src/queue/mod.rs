//! Durable queue contract for the outer dispatch loop.
//!
//! The engine depends on an at-least-once delivery abstraction (RabbitMQ,
//! Kafka, or equivalent) and must tolerate duplicate deliveries; the broker
//! behind the trait is an external collaborator. `InMemoryQueue` is the
//! reference implementation used by tests and single-process deployments —
//! it preserves enqueue order and supports the duplicate deliveries the
//! contract allows.

use crate::errors::QueueError;
use crate::types::{PlanId, PlanStep, StepId, ToolInvocation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One queued step delivery. Carries enough step data to resume dispatch
/// without re-reading the full plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDelivery {
    pub plan_id: PlanId,
    pub step_id: StepId,
    /// Outer attempt number this delivery represents (0-based).
    pub attempt: u32,
    /// Stable idempotency key derived from (plan id, step id, attempt).
    pub invocation_id: String,
    pub step: PlanStep,
    pub enqueued_at: DateTime<Utc>,
}

impl StepDelivery {
    pub fn new(plan_id: impl Into<PlanId>, step: PlanStep, attempt: u32) -> Self {
        let plan_id = plan_id.into();
        let invocation_id = ToolInvocation::derive_id(&plan_id, &step.id, attempt);
        Self {
            step_id: step.id.clone(),
            plan_id,
            attempt,
            invocation_id,
            step,
            enqueued_at: Utc::now(),
        }
    }
}

/// Consumer side of the queue contract.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle_delivery(&self, delivery: StepDelivery);
}

/// At-least-once durable queue. Implementations may redeliver; the handler
/// must be idempotent.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, delivery: StepDelivery) -> Result<(), QueueError>;

    /// Attach the consumer and start delivering. At most one consumer may be
    /// attached; a second call is an error.
    async fn consume(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), QueueError>;
}

/// In-memory reference queue: unbounded channel, sequential delivery in
/// enqueue order on a dedicated task.
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<StepDelivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StepDelivery>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, delivery: StepDelivery) -> Result<(), QueueError> {
        self.tx.send(delivery).map_err(|_| QueueError::Closed)
    }

    async fn consume(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), QueueError> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| QueueError::Unavailable("queue already has a consumer".to_string()))?;

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                log::debug!(
                    "delivering step {} of plan {} (attempt {})",
                    delivery.step_id,
                    delivery.plan_id,
                    delivery.attempt
                );
                handler.handle_delivery(delivery).await;
            }
        });
        Ok(())
    }
}
