use crate::db::store::AlarmStore;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// Deadline index over per-alarm pending windows.
///
/// One wait loop sleeps until the earliest armed deadline and hands due alarms
/// to the handler; arming a nearer deadline wakes the loop. The heap may hold
/// stale entries after re-arms, so each popped entry is checked against the
/// authoritative map before firing, and the lifecycle engine re-validates
/// against the persisted pending_until on top of that. The whole structure is
/// rebuildable from the store, never an authority of its own.
pub struct DeadlineScheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
    armed: HashMap<Uuid, DateTime<Utc>>,
}

/// Receiver of due deadlines, implemented by the lifecycle engine
#[async_trait::async_trait]
pub trait DeadlineHandler: Send + Sync {
    async fn deadline_elapsed(&self, alarm_id: Uuid, deadline: DateTime<Utc>) -> Result<()>;
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
        }
    }

    /// Arm a deadline for an alarm, replacing any previous one
    pub fn arm(&self, alarm_id: Uuid, deadline: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.armed.insert(alarm_id, deadline);
        state.heap.push(Reverse((deadline, alarm_id)));
        drop(state);
        self.notify.notify_one();
    }

    /// Remove the armed deadline for an alarm; stale heap entries are skipped
    /// when they surface
    pub fn disarm(&self, alarm_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.armed.remove(&alarm_id);
        drop(state);
        self.notify.notify_one();
    }

    pub fn armed_deadline(&self, alarm_id: Uuid) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().armed.get(&alarm_id).copied()
    }

    /// Reconstruct the timer set from persisted pending_until values. Called
    /// on startup so restarts do not lose armed windows.
    pub async fn rebuild(&self, store: &dyn AlarmStore) -> Result<usize> {
        let deadlines = store.pending_deadlines().await?;
        let count = deadlines.len();
        let mut state = self.state.lock().unwrap();
        state.armed.clear();
        state.heap.clear();
        for (alarm_id, deadline) in deadlines {
            state.armed.insert(alarm_id, deadline);
            state.heap.push(Reverse((deadline, alarm_id)));
        }
        drop(state);
        self.notify.notify_one();
        info!("Rebuilt deadline scheduler with {} armed timers", count);
        Ok(count)
    }

    /// Pop the next currently-armed deadline if it is due; otherwise report
    /// how long to sleep
    fn next_due(&self, now: DateTime<Utc>) -> NextStep {
        let mut state = self.state.lock().unwrap();
        while let Some(Reverse((deadline, alarm_id))) = state.heap.peek().copied() {
            if state.armed.get(&alarm_id) != Some(&deadline) {
                // re-armed or disarmed since this entry was pushed
                state.heap.pop();
                debug!(
                    "{}",
                    Error::StaleTimer(format!(
                        "Deadline {} for alarm {} was superseded before firing",
                        deadline, alarm_id
                    ))
                );
                continue;
            }
            if deadline <= now {
                state.heap.pop();
                state.armed.remove(&alarm_id);
                return NextStep::Fire(alarm_id, deadline);
            }
            return NextStep::SleepUntil(deadline);
        }
        NextStep::Idle
    }

    /// Run the wait loop, delivering due deadlines to the handler. Intended to
    /// be spawned once.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn DeadlineHandler>) {
        info!("Starting deadline scheduler loop");
        loop {
            match self.next_due(Utc::now()) {
                NextStep::Fire(alarm_id, deadline) => {
                    debug!("Deadline elapsed for alarm {}", alarm_id);
                    if let Err(e) = handler.deadline_elapsed(alarm_id, deadline).await {
                        warn!("Deadline handling failed for alarm {}: {}", alarm_id, e);
                    }
                }
                NextStep::SleepUntil(deadline) => {
                    let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                NextStep::Idle => {
                    self.notify.notified().await;
                }
            }
        }
    }
}

enum NextStep {
    Fire(Uuid, DateTime<Utc>),
    SleepUntil(DateTime<Utc>),
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex as StdMutex;

    struct RecordingHandler {
        fired: StdMutex<Vec<(Uuid, DateTime<Utc>)>>,
        notify: Notify,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                fired: StdMutex::new(Vec::new()),
                notify: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl DeadlineHandler for RecordingHandler {
        async fn deadline_elapsed(&self, alarm_id: Uuid, deadline: DateTime<Utc>) -> Result<()> {
            self.fired.lock().unwrap().push((alarm_id, deadline));
            self.notify.notify_one();
            Ok(())
        }
    }

    #[test]
    fn rearm_replaces_previous_deadline() {
        let scheduler = DeadlineScheduler::new();
        let id = Uuid::new_v4();
        let first = Utc::now() + Duration::seconds(30);
        let second = Utc::now() + Duration::seconds(60);
        scheduler.arm(id, first);
        scheduler.arm(id, second);
        assert_eq!(scheduler.armed_deadline(id), Some(second));

        // the first (stale) heap entry must not fire
        match scheduler.next_due(first + Duration::seconds(1)) {
            NextStep::SleepUntil(deadline) => assert_eq!(deadline, second),
            _ => panic!("stale entry fired"),
        }
    }

    #[test]
    fn disarmed_deadline_never_fires() {
        let scheduler = DeadlineScheduler::new();
        let id = Uuid::new_v4();
        scheduler.arm(id, Utc::now() - Duration::seconds(1));
        scheduler.disarm(id);
        assert!(matches!(scheduler.next_due(Utc::now()), NextStep::Idle));
    }

    #[test]
    fn due_deadlines_fire_in_order() {
        let scheduler = DeadlineScheduler::new();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        let now = Utc::now();
        scheduler.arm(late, now - Duration::seconds(5));
        scheduler.arm(early, now - Duration::seconds(10));

        match scheduler.next_due(now) {
            NextStep::Fire(id, _) => assert_eq!(id, early),
            _ => panic!("expected a due deadline"),
        }
        match scheduler.next_due(now) {
            NextStep::Fire(id, _) => assert_eq!(id, late),
            _ => panic!("expected a due deadline"),
        }
        assert!(matches!(scheduler.next_due(now), NextStep::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_delivers_due_deadline_to_handler() {
        let scheduler = Arc::new(DeadlineScheduler::new());
        let handler = Arc::new(RecordingHandler::new());
        let id = Uuid::new_v4();

        tokio::spawn(scheduler.clone().run(handler.clone()));
        tokio::task::yield_now().await;

        scheduler.arm(id, Utc::now() - Duration::seconds(1));
        handler.notify.notified().await;

        let fired = handler.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, id);
    }

    #[tokio::test]
    async fn rebuild_restores_armed_timers_from_store() {
        use crate::db::memory::MemoryStore;
        use crate::db::models::AlarmHistoryEntry;
        use crate::detection::AlarmType;
        use crate::lifecycle::state::{actions, ConfirmationState, LifecycleState};

        let store = MemoryStore::new();
        let alarm_id = Uuid::new_v4();
        let deadline = Utc::now() + Duration::seconds(90);
        let alarm = crate::db::models::AlarmEvent {
            id: alarm_id,
            subject_id: Uuid::new_v4(),
            area_id: Uuid::new_v4(),
            camera_ids: vec![Uuid::new_v4()],
            event_type: AlarmType::Fall,
            confidence: 0.8,
            reliability: 0.8,
            lifecycle_state: LifecycleState::Active,
            confirmation_state: ConfirmationState::AwaitingConfirmation,
            created_at: Utc::now(),
            pending_until: Some(deadline),
            escalation_count: 0,
            canceled: false,
            proposed_event_type: None,
            proposed_status: None,
            proposed_reason: None,
            last_actor: None,
            last_action_at: Utc::now(),
            context: serde_json::json!({}),
        };
        let entry = AlarmHistoryEntry {
            id: Uuid::new_v4(),
            alarm_id,
            action: actions::CREATED.to_string(),
            actor: None,
            actor_role: None,
            previous_lifecycle_state: LifecycleState::Detected,
            previous_confirmation_state: ConfirmationState::AwaitingConfirmation,
            new_lifecycle_state: LifecycleState::Active,
            new_confirmation_state: ConfirmationState::AwaitingConfirmation,
            reason: None,
            created_at: Utc::now(),
            response_time_ms: None,
        };
        AlarmStore::commit(&store, &alarm, &entry).await.unwrap();

        let scheduler = DeadlineScheduler::new();
        let restored = scheduler.rebuild(&store).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(scheduler.armed_deadline(alarm_id), Some(deadline));
    }
}
