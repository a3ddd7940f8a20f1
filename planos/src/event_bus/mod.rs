//! Step event bus.
//!
//! Records every step-state transition per plan in a bounded replay buffer
//! and fans transitions out to per-plan subscribers in publication order.
//! The bus is an explicit, injectable service constructed once per process
//! (or per test) — never an ambient singleton — and it only ever receives
//! read-only snapshots; it never mutates a step.
//!
//! History is in-memory with no durability across process restarts: a
//! restart loses in-flight history. Subscribers needing full durability must
//! persist events themselves through the external persistence collaborator.

use crate::config::EventBusConfig;
use crate::types::{PlanId, StepEvent, StepId, StepState};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Per-plan transition observer. Callbacks run on the publisher's task and
/// must not block.
pub trait StepEventListener: Send + Sync {
    fn on_event(&self, event: &StepEvent);
}

impl<F> StepEventListener for F
where
    F: Fn(&StepEvent) + Send + Sync,
{
    fn on_event(&self, event: &StepEvent) {
        self(event)
    }
}

/// Flexible history filter, all fields optional.
#[derive(Debug, Default, Clone)]
pub struct HistoryQuery {
    pub step_id: Option<StepId>,
    pub state: Option<StepState>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, event: &StepEvent) -> bool {
        if let Some(ref step_id) = self.step_id {
            if &event.step.id != step_id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if event.step.state != state {
                return false;
            }
        }
        if let Some((start, end)) = self.time_range {
            match event.occurred_at {
                Some(at) if at >= start && at <= end => {}
                _ => return false,
            }
        }
        true
    }
}

struct PlanChannel {
    history: VecDeque<StepEvent>,
    latest: HashMap<StepId, StepEvent>,
    listeners: Vec<(Uuid, Arc<dyn StepEventListener>)>,
    /// Bumped on every publish; pending eviction timers carry the generation
    /// they were scheduled at and fire only if it is still current.
    generation: u64,
}

impl PlanChannel {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            latest: HashMap::new(),
            listeners: Vec::new(),
            generation: 0,
        }
    }

    fn all_settled(&self) -> bool {
        !self.latest.is_empty() && self.latest.values().all(|e| e.step.state.is_terminal())
    }
}

/// Handle returned by `subscribe`; unsubscribes on drop.
pub struct Subscription {
    id: Uuid,
    plan_id: PlanId,
    bus: Weak<StepEventBus>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_listener(&self.plan_id, self.id);
        }
    }
}

/// Bounded, replayable publish/subscribe store for step transitions.
pub struct StepEventBus {
    config: EventBusConfig,
    plans: Mutex<HashMap<PlanId, PlanChannel>>,
}

impl StepEventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            plans: Mutex::new(HashMap::new()),
        })
    }

    /// Publish one transition: append to history (FIFO-capped), update the
    /// per-step latest index, notify subscribers in publication order, and
    /// (re)schedule history eviction once every step of the plan is
    /// terminal. Assigns the occurrence timestamp if the producer omitted it.
    pub fn publish(self: &Arc<Self>, mut event: StepEvent) {
        if event.occurred_at.is_none() {
            event.occurred_at = Some(Utc::now());
        }

        let schedule = {
            let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
            let channel = plans
                .entry(event.plan_id.clone())
                .or_insert_with(PlanChannel::new);

            channel.generation += 1;
            channel.history.push_back(event.clone());
            while channel.history.len() > self.config.history_cap {
                channel.history.pop_front();
            }
            channel.latest.insert(event.step.id.clone(), event.clone());

            log::debug!(
                "plan {} step {} -> {}",
                event.plan_id,
                event.step.id,
                event.step.state
            );
            for (_, listener) in &channel.listeners {
                listener.on_event(&event);
            }

            channel
                .all_settled()
                .then(|| (event.plan_id.clone(), channel.generation))
        };

        if let Some((plan_id, generation)) = schedule {
            self.schedule_eviction(plan_id, generation);
        }
    }

    /// Full replay buffer for a plan, oldest first.
    pub fn history(&self, plan_id: &str) -> Vec<StepEvent> {
        let plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans
            .get(plan_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Filtered replay for observers that resume selectively.
    pub fn query(&self, plan_id: &str, query: &HistoryQuery) -> Vec<StepEvent> {
        let plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans
            .get(plan_id)
            .map(|c| {
                c.history
                    .iter()
                    .filter(|e| query.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent event for one step, if any.
    pub fn latest(&self, plan_id: &str, step_id: &str) -> Option<StepEvent> {
        let plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans.get(plan_id).and_then(|c| c.latest.get(step_id).cloned())
    }

    /// Register a listener scoped to one plan. The returned subscription
    /// unsubscribes when dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        plan_id: impl Into<PlanId>,
        listener: Arc<dyn StepEventListener>,
    ) -> Subscription {
        let plan_id = plan_id.into();
        let id = Uuid::new_v4();
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans
            .entry(plan_id.clone())
            .or_insert_with(PlanChannel::new)
            .listeners
            .push((id, listener));
        Subscription {
            id,
            plan_id,
            bus: Arc::downgrade(self),
        }
    }

    fn remove_listener(&self, plan_id: &str, id: Uuid) {
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = plans.get_mut(plan_id) {
            channel.listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, plan_id: PlanId, generation: u64) {
        // Outside a runtime (pure-sync callers) there is no timer to arm;
        // history then lives until process exit, which the bounds already cap.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let retention = Duration::from_secs(self.config.retention_secs);
        let bus = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(bus) = bus.upgrade() {
                bus.evict_if_current(&plan_id, generation);
            }
        });
    }

    fn evict_if_current(&self, plan_id: &str, generation: u64) {
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        let evict = plans
            .get(plan_id)
            .map(|c| c.generation == generation && c.all_settled())
            .unwrap_or(false);
        if evict {
            plans.remove(plan_id);
            log::debug!("evicted settled plan {} from event history", plan_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanStep, StepSnapshot};

    fn bus_with(config: EventBusConfig) -> Arc<StepEventBus> {
        StepEventBus::new(config)
    }

    fn event_for(plan_id: &str, step_id: &str, state: StepState) -> StepEvent {
        let mut step = PlanStep::new(step_id, "read_repository", "repo-tool", "repo.read");
        step.state = state;
        StepEvent::new("trace-1", plan_id, StepSnapshot::capture(&step, 900))
    }

    #[derive(Default)]
    struct VecListener {
        events: Mutex<Vec<StepEvent>>,
    }

    impl StepEventListener for VecListener {
        fn on_event(&self, event: &StepEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn publication_assigns_a_timestamp_when_omitted() {
        let bus = bus_with(EventBusConfig::default());
        bus.publish(event_for("p1", "s1", StepState::Queued));
        let history = bus.history("p1");
        assert_eq!(history.len(), 1);
        assert!(history[0].occurred_at.is_some());
    }

    #[tokio::test]
    async fn history_caps_with_fifo_eviction() {
        let bus = bus_with(EventBusConfig {
            history_cap: 3,
            ..EventBusConfig::default()
        });
        for state in [
            StepState::Queued,
            StepState::Running,
            StepState::Retrying,
            StepState::Running,
        ] {
            bus.publish(event_for("p1", "s1", state));
        }
        let history = bus.history("p1");
        assert_eq!(history.len(), 3);
        // the oldest (queued) was evicted
        assert_eq!(history[0].step.state, StepState::Running);
        assert_eq!(history[2].step.state, StepState::Running);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publication_order() {
        let bus = bus_with(EventBusConfig::default());
        let listener = Arc::new(VecListener::default());
        let subscription = bus.subscribe("p1", listener.clone());

        let states = [StepState::Queued, StepState::Running, StepState::Completed];
        for state in states {
            bus.publish(event_for("p1", "s1", state));
        }
        // events for other plans are not delivered
        bus.publish(event_for("p2", "s1", StepState::Queued));

        let seen: Vec<StepState> = listener
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.step.state)
            .collect();
        assert_eq!(seen, states);
        drop(subscription);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = bus_with(EventBusConfig::default());
        let listener = Arc::new(VecListener::default());
        let subscription = bus.subscribe("p1", listener.clone());
        bus.publish(event_for("p1", "s1", StepState::Queued));
        drop(subscription);
        bus.publish(event_for("p1", "s1", StepState::Running));
        assert_eq!(listener.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_tracks_the_most_recent_event_per_step() {
        let bus = bus_with(EventBusConfig::default());
        bus.publish(event_for("p1", "s1", StepState::Queued));
        bus.publish(event_for("p1", "s2", StepState::Queued));
        bus.publish(event_for("p1", "s1", StepState::Running));

        assert_eq!(
            bus.latest("p1", "s1").map(|e| e.step.state),
            Some(StepState::Running)
        );
        assert_eq!(
            bus.latest("p1", "s2").map(|e| e.step.state),
            Some(StepState::Queued)
        );
        assert!(bus.latest("p1", "missing").is_none());
    }

    #[tokio::test]
    async fn query_filters_by_step_and_state() {
        let bus = bus_with(EventBusConfig::default());
        bus.publish(event_for("p1", "s1", StepState::Queued));
        bus.publish(event_for("p1", "s2", StepState::Queued));
        bus.publish(event_for("p1", "s1", StepState::Completed));

        let s1_events = bus.query(
            "p1",
            &HistoryQuery {
                step_id: Some("s1".to_string()),
                ..HistoryQuery::new()
            },
        );
        assert_eq!(s1_events.len(), 2);

        let completed = bus.query(
            "p1",
            &HistoryQuery {
                state: Some(StepState::Completed),
                ..HistoryQuery::new()
            },
        );
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].step.id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn settled_plan_history_evicts_after_retention() {
        let bus = bus_with(EventBusConfig {
            retention_secs: 10,
            ..EventBusConfig::default()
        });
        bus.publish(event_for("p1", "s1", StepState::Queued));
        bus.publish(event_for("p1", "s1", StepState::Completed));
        assert!(!bus.history("p1").is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(bus.history("p1").is_empty(), "settled history should evict");
    }

    #[tokio::test(start_paused = true)]
    async fn publication_before_eviction_reschedules_the_timer() {
        let bus = bus_with(EventBusConfig {
            retention_secs: 10,
            ..EventBusConfig::default()
        });
        bus.publish(event_for("p1", "s1", StepState::Completed));

        tokio::time::sleep(Duration::from_secs(5)).await;
        // a further terminal publication before eviction restarts the clock
        bus.publish(event_for("p1", "s2", StepState::Failed));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(
            !bus.history("p1").is_empty(),
            "original timer must have been cancelled"
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(bus.history("p1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_settled_plan_is_never_evicted() {
        let bus = bus_with(EventBusConfig {
            retention_secs: 10,
            ..EventBusConfig::default()
        });
        bus.publish(event_for("p1", "s1", StepState::Completed));
        bus.publish(event_for("p1", "s2", StepState::Running));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!bus.history("p1").is_empty());
    }
}
