/// Background cron trigger scheduler
///
/// Triggers live in a `TriggerStore` and are re-read on every tick, so
/// enable/disable/delete/reschedule take effect at the next minute boundary
/// without touching an in-flight fire. Fires go through
/// `Executor::submit_with_origin`, which only queues; a slow flow never holds
/// up the tick loop or other triggers.
///
/// Coalescing: a trigger whose previous execution is still pending or running
/// is skipped for that boundary and a misfire is recorded. Boundaries that
/// passed while the scheduler was not ticking collapse into at most one fire,
/// and only if the latest of them is within the misfire grace window.

use crate::error::{EngineError, EngineResult};
use crate::history::ExecutionOrigin;
use crate::runtime::cron::{truncate_to_minute, CronSchedule};
use crate::runtime::executor::{ExecutionHandle, Executor};
use crate::trigger::{MisfireEvent, MisfireReason, Trigger, TriggerStore};
use crate::workflow::Params;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Scheduler timing knobs
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// How often the loop wakes to check for due boundaries
    pub heartbeat: Duration,
    /// How late a boundary may be evaluated and still fire
    pub misfire_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(1),
            misfire_grace: Duration::from_secs(30),
        }
    }
}

/// A trigger fired during a tick
#[derive(Debug, Clone)]
pub struct FiredTrigger {
    pub trigger_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub handle: ExecutionHandle,
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub fired: Vec<FiredTrigger>,
    /// Due fires that were skipped, already recorded in the misfire log
    pub skipped: Vec<MisfireEvent>,
    /// Per-trigger failures keyed by trigger id (empty when the store
    /// itself failed); other triggers still ran
    pub errors: Vec<(String, EngineError)>,
}

#[derive(Default)]
struct TickState {
    /// Last evaluated minute boundary
    last_boundary: Option<DateTime<Utc>>,
    /// Latest execution per trigger, used for coalescing
    in_flight: HashMap<String, ExecutionHandle>,
    /// Parsed schedules keyed by trigger id, with the expression they came from
    schedules: HashMap<String, CronSchedule>,
}

/// Cron scheduler over a trigger store and an executor
pub struct TriggerScheduler {
    executor: Executor,
    store: Arc<dyn TriggerStore>,
    config: SchedulerConfig,
    state: Mutex<TickState>,
    shutdown: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(executor: Executor, store: Arc<dyn TriggerStore>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            store,
            config,
            state: Mutex::new(TickState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Create an enabled trigger for an existing flow; returns its id
    pub async fn create(&self, flow_id: &str, cron_expression: &str, params: Params) -> EngineResult<String> {
        let trigger = self
            .create_trigger(Trigger::new(flow_id, cron_expression, params))
            .await?;
        Ok(trigger.id)
    }

    /// Store a fully built trigger after validating its flow and cron
    pub async fn create_trigger(&self, mut trigger: Trigger) -> EngineResult<Trigger> {
        self.executor.registry().get_flow(&trigger.flow_id)?;
        let schedule = CronSchedule::parse(&trigger.cron_expression)?;
        trigger.cron_expression = schedule.expression().to_string();

        self.store.insert(&trigger).await?;
        tracing::info!(
            trigger_id = %trigger.id,
            "📅 Trigger '{}' created for flow '{}' ({})",
            trigger.name, trigger.flow_id, trigger.cron_expression
        );
        Ok(trigger)
    }

    pub async fn enable(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.set_enabled(trigger_id, true).await
    }

    pub async fn disable(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.set_enabled(trigger_id, false).await
    }

    async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> EngineResult<Trigger> {
        let mut trigger = self.get(trigger_id).await?;
        trigger.enabled = enabled;
        trigger.touch();
        self.store.update(&trigger).await?;
        tracing::info!(
            trigger_id,
            "{} Trigger '{}' {}",
            if enabled { "▶️" } else { "⏸️" },
            trigger.name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(trigger)
    }

    /// Replace the cron expression; rejected expressions leave the trigger untouched
    pub async fn reschedule(&self, trigger_id: &str, cron_expression: &str) -> EngineResult<Trigger> {
        let schedule = CronSchedule::parse(cron_expression)?;
        let mut trigger = self.get(trigger_id).await?;
        trigger.cron_expression = schedule.expression().to_string();
        trigger.last_error = None;
        trigger.touch();
        self.store.update(&trigger).await?;
        tracing::info!(trigger_id, "🔄 Trigger '{}' rescheduled to {}", trigger.name, trigger.cron_expression);
        Ok(trigger)
    }

    /// Replace the static parameters passed on each fire
    pub async fn set_params(&self, trigger_id: &str, params: Params) -> EngineResult<Trigger> {
        let mut trigger = self.get(trigger_id).await?;
        trigger.params = params;
        trigger.touch();
        self.store.update(&trigger).await?;
        Ok(trigger)
    }

    pub async fn delete(&self, trigger_id: &str) -> EngineResult<()> {
        self.store.delete(trigger_id).await?;
        tracing::info!(trigger_id, "🗑️ Trigger deleted");
        Ok(())
    }

    pub async fn get(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.store
            .get(trigger_id)
            .await?
            .ok_or_else(|| EngineError::trigger_not_found(trigger_id))
    }

    pub async fn list(&self) -> EngineResult<Vec<Trigger>> {
        self.store.list().await
    }

    pub async fn list_for_flow(&self, flow_id: &str) -> EngineResult<Vec<Trigger>> {
        self.store.list_for_flow(flow_id).await
    }

    pub async fn misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>> {
        self.get(trigger_id).await?;
        self.store.misfires(trigger_id).await
    }

    /// Evaluate every minute boundary up to `now` and fire due triggers.
    ///
    /// The run loop calls this with the wall clock; tests drive it with a
    /// simulated one. Each boundary is evaluated at most once.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let boundary = truncate_to_minute(now);
        let mut state = self.state.lock().await;

        if state.last_boundary.is_some_and(|last| boundary <= last) {
            return report;
        }

        let triggers = match self.store.list().await {
            Ok(triggers) => triggers,
            Err(e) => {
                tracing::error!("❌ Failed to load triggers: {}", e);
                report.errors.push((String::new(), e));
                return report;
            }
        };

        // Forget state of deleted triggers and finished fires
        state
            .schedules
            .retain(|id, _| triggers.iter().any(|t| &t.id == id));
        state
            .in_flight
            .retain(|id, handle| !handle.is_finished() && triggers.iter().any(|t| &t.id == id));

        let previous = state.last_boundary;
        for trigger in triggers.into_iter().filter(|t| t.enabled) {
            let schedule = match cached_schedule(&mut state.schedules, &trigger) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::error!(trigger_id = %trigger.id, "❌ Trigger '{}' has a bad schedule: {}", trigger.name, e);
                    let trigger_id = trigger.id.clone();
                    self.record_error(&trigger, &e).await;
                    report.errors.push((trigger_id, e));
                    continue;
                }
            };

            let Some(due) = latest_due(&schedule, previous, boundary) else {
                continue;
            };

            let lateness = (now - due).to_std().unwrap_or_default();
            if lateness > self.config.misfire_grace {
                let event = MisfireEvent::new(&trigger.id, due, MisfireReason::Missed);
                tracing::warn!(trigger_id = %trigger.id, "⏰ Trigger '{}' missed {} by {:?}", trigger.name, due, lateness);
                self.record_misfire(&event).await;
                report.skipped.push(event);
                continue;
            }

            if let Some(running) = state.in_flight.get(&trigger.id) {
                let err = EngineError::SchedulerMisfire {
                    trigger_id: trigger.id.clone(),
                    reason: format!("execution {} is still {}", running.execution_id(), running.status()),
                };
                tracing::warn!(trigger_id = %trigger.id, "⏭️ {}", err);
                let mut event = MisfireEvent::new(&trigger.id, due, MisfireReason::StillRunning);
                event.blocking_execution_id = Some(running.execution_id().to_string());
                self.record_misfire(&event).await;
                report.skipped.push(event);
                continue;
            }

            match self.fire(&trigger, due).await {
                Ok(handle) => {
                    state.in_flight.insert(trigger.id.clone(), handle.clone());
                    let trigger_id = trigger.id.clone();
                    if let Err(e) = self.store.mark_fired(&trigger_id, due).await {
                        // deleted between list and fire
                        tracing::debug!(trigger_id = %trigger_id, "Could not update fired trigger: {}", e);
                    }
                    report.fired.push(FiredTrigger {
                        trigger_id,
                        scheduled_for: due,
                        handle,
                    });
                }
                Err(e) => {
                    tracing::error!(trigger_id = %trigger.id, "❌ Failed to fire trigger '{}': {}", trigger.name, e);
                    let trigger_id = trigger.id.clone();
                    self.record_error(&trigger, &e).await;
                    report.errors.push((trigger_id, e));
                }
            }
        }

        state.last_boundary = Some(boundary);
        report
    }

    async fn fire(&self, trigger: &Trigger, due: DateTime<Utc>) -> EngineResult<ExecutionHandle> {
        tracing::info!(trigger_id = %trigger.id, "🔔 Firing trigger '{}' for flow '{}'", trigger.name, trigger.flow_id);
        let origin = ExecutionOrigin::Scheduled {
            trigger_id: trigger.id.clone(),
            trigger_name: trigger.name.clone(),
            scheduled_for: due,
        };
        self.executor
            .submit_with_origin(&trigger.flow_id, trigger.params.clone(), origin)
            .await
    }

    async fn record_misfire(&self, event: &MisfireEvent) {
        if let Err(e) = self.store.record_misfire(event).await {
            tracing::error!(trigger_id = %event.trigger_id, "❌ Failed to record misfire: {}", e);
        }
    }

    async fn record_error(&self, trigger: &Trigger, error: &EngineError) {
        let message = error.to_string();
        if trigger.last_error.as_deref() == Some(message.as_str()) {
            return;
        }
        if let Err(e) = self.store.set_last_error(&trigger.id, Some(&message)).await {
            tracing::error!(trigger_id = %trigger.id, "❌ Failed to record trigger error: {}", e);
        }
    }

    /// Load stored triggers and spawn the tick loop.
    ///
    /// Triggers with unparsable schedules are reported and left in place.
    pub async fn start(self: Arc<Self>) -> EngineResult<JoinHandle<()>> {
        let triggers = self.store.list().await?;
        let enabled = triggers.iter().filter(|t| t.enabled).count();
        for trigger in triggers.iter().filter(|t| t.enabled) {
            if let Err(e) = CronSchedule::parse(&trigger.cron_expression) {
                tracing::error!(trigger_id = %trigger.id, "❌ Trigger '{}' will not fire: {}", trigger.name, e);
                self.record_error(trigger, &e).await;
            }
        }
        tracing::info!(
            "⏰ Starting trigger scheduler: {} trigger(s), {} enabled, heartbeat {:?}",
            triggers.len(),
            enabled,
            self.config.heartbeat
        );

        let scheduler = Arc::clone(&self);
        Ok(tokio::spawn(async move { scheduler.run().await }))
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.fired.is_empty() || !report.skipped.is_empty() {
                        tracing::debug!(
                            "Tick fired {} trigger(s), skipped {}",
                            report.fired.len(),
                            report.skipped.len()
                        );
                    }
                }
            }
        }
        tracing::info!("⏹️ Trigger scheduler stopped");
    }

    /// Stop the tick loop; in-flight executions keep running
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Parse (or reuse) the schedule for a trigger
fn cached_schedule(
    cache: &mut HashMap<String, CronSchedule>,
    trigger: &Trigger,
) -> EngineResult<CronSchedule> {
    if let Some(schedule) = cache.get(&trigger.id) {
        if schedule.expression() == trigger.cron_expression {
            return Ok(schedule.clone());
        }
    }
    let schedule = CronSchedule::parse(&trigger.cron_expression)?;
    cache.insert(trigger.id.clone(), schedule.clone());
    Ok(schedule)
}

/// Latest matching boundary in (previous, boundary]; just `boundary` on the first tick
fn latest_due(
    schedule: &CronSchedule,
    previous: Option<DateTime<Utc>>,
    boundary: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Some(previous) = previous else {
        return schedule.matches(boundary).then_some(boundary);
    };

    let mut due = None;
    let mut cursor = previous;
    while let Some(next) = schedule.next_after(cursor) {
        if next > boundary {
            break;
        }
        due = Some(next);
        cursor = next;
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ExecutionStatus, MemoryHistoryStore};
    use crate::trigger::MemoryTriggerStore;
    use crate::workflow::Registry;
    use chrono::TimeZone;
    use serde_json::json;

    fn scheduler(registry: Registry) -> TriggerScheduler {
        let executor = Executor::new(Arc::new(registry), Arc::new(MemoryHistoryStore::new()), 4);
        TriggerScheduler::new(executor, Arc::new(MemoryTriggerStore::new()), SchedulerConfig::default())
    }

    fn noop_registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_flow("noop", "Noop", "", |_| async { Ok(json!(null)) })
            .unwrap();
        registry
    }

    #[test]
    fn latest_due_collapses_backlog() {
        let hourly = CronSchedule::parse("0 * * * *").unwrap();
        let t = |h, m| Utc.with_ymd_and_hms(2026, 1, 1, h, m, 0).unwrap();

        assert_eq!(latest_due(&hourly, None, t(3, 0)), Some(t(3, 0)));
        assert_eq!(latest_due(&hourly, None, t(3, 1)), None);
        assert_eq!(latest_due(&hourly, Some(t(0, 30)), t(3, 30)), Some(t(3, 0)));
        assert_eq!(latest_due(&hourly, Some(t(3, 0)), t(3, 59)), None);
    }

    #[tokio::test]
    async fn create_validates_flow_and_cron() {
        let scheduler = scheduler(noop_registry());

        let err = scheduler.create("noop", "61 * * * *", Params::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCron { .. }));

        let err = scheduler.create("ghost", "* * * * *", Params::new()).await.unwrap_err();
        assert_eq!(err, EngineError::flow_not_found("ghost"));

        let id = scheduler.create("noop", "  0 2 * * *", Params::new()).await.unwrap();
        assert_eq!(scheduler.get(&id).await.unwrap().cron_expression, "0 2 * * *");

        let err = scheduler.reschedule(&id, "bad").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCron { .. }));
        assert_eq!(scheduler.get(&id).await.unwrap().cron_expression, "0 2 * * *");
    }

    #[tokio::test]
    async fn disabled_triggers_are_kept_but_not_fired() {
        let scheduler = scheduler(noop_registry());
        let id = scheduler.create("noop", "* * * * *", Params::new()).await.unwrap();
        scheduler.disable(&id).await.unwrap();

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let report = scheduler.tick(start).await;
        assert!(report.fired.is_empty());
        assert!(!scheduler.get(&id).await.unwrap().enabled);

        scheduler.enable(&id).await.unwrap();
        let report = scheduler.tick(start + chrono::Duration::minutes(1)).await;
        assert_eq!(report.fired.len(), 1);
        let execution = report.fired[0].handle.wait().await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert!(matches!(execution.origin, ExecutionOrigin::Scheduled { ref trigger_id, .. } if trigger_id == &id));
    }

    #[tokio::test]
    async fn late_boundary_beyond_grace_is_missed() {
        let scheduler = scheduler(noop_registry());
        let id = scheduler.create("noop", "0 * * * *", Params::new()).await.unwrap();

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        scheduler.tick(start).await;
        // next evaluation happens 45s after the 01:00 boundary
        let report = scheduler
            .tick(Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 45).unwrap())
            .await;

        assert!(report.fired.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, MisfireReason::Missed);
        assert_eq!(scheduler.misfires(&id).await.unwrap().len(), 1);
    }

    /// Trigger store whose rows get disabled right after the scheduler lists them
    struct DisableAfterList {
        inner: MemoryTriggerStore,
    }

    #[async_trait::async_trait]
    impl TriggerStore for DisableAfterList {
        async fn insert(&self, trigger: &Trigger) -> EngineResult<()> {
            self.inner.insert(trigger).await
        }
        async fn update(&self, trigger: &Trigger) -> EngineResult<()> {
            self.inner.update(trigger).await
        }
        async fn mark_fired(&self, trigger_id: &str, fired_at: DateTime<Utc>) -> EngineResult<()> {
            self.inner.mark_fired(trigger_id, fired_at).await
        }
        async fn set_last_error(&self, trigger_id: &str, error: Option<&str>) -> EngineResult<()> {
            self.inner.set_last_error(trigger_id, error).await
        }
        async fn get(&self, trigger_id: &str) -> EngineResult<Option<Trigger>> {
            self.inner.get(trigger_id).await
        }
        async fn list(&self) -> EngineResult<Vec<Trigger>> {
            let listed = self.inner.list().await?;
            for trigger in &listed {
                let mut disabled = trigger.clone();
                disabled.enabled = false;
                self.inner.update(&disabled).await?;
            }
            Ok(listed)
        }
        async fn delete(&self, trigger_id: &str) -> EngineResult<()> {
            self.inner.delete(trigger_id).await
        }
        async fn record_misfire(&self, event: &MisfireEvent) -> EngineResult<()> {
            self.inner.record_misfire(event).await
        }
        async fn misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>> {
            self.inner.misfires(trigger_id).await
        }
    }

    #[tokio::test]
    async fn disable_during_a_tick_is_not_reverted() {
        let executor = Executor::new(Arc::new(noop_registry()), Arc::new(MemoryHistoryStore::new()), 1);
        let store = Arc::new(DisableAfterList {
            inner: MemoryTriggerStore::new(),
        });
        let scheduler = TriggerScheduler::new(executor, store.clone(), SchedulerConfig::default());
        let id = scheduler.create("noop", "* * * * *", Params::new()).await.unwrap();

        let due = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let report = scheduler.tick(due).await;
        assert_eq!(report.fired.len(), 1);
        report.fired[0].handle.wait().await.unwrap();

        let stored = store.inner.get(&id).await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.last_fired_at, Some(due));
    }

    #[tokio::test]
    async fn bad_stored_schedule_does_not_stop_other_triggers() {
        let scheduler = scheduler(noop_registry());
        let good = scheduler.create("noop", "* * * * *", Params::new()).await.unwrap();

        let mut broken = Trigger::new("noop", "not a cron", Params::new());
        broken.name = "broken".into();
        scheduler.store.insert(&broken).await.unwrap();

        let report = scheduler
            .tick(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
            .await;

        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.fired[0].trigger_id, good);
        assert_eq!(report.errors.len(), 1);
        assert!(scheduler.get(&broken.id).await.unwrap().last_error.is_some());
    }
}
