//! Alarm lifecycle: create, cancel, fire.
//!
//! The engine is the only writer of the [`AlarmStore`] and the only owner of
//! the [`TimerRegistry`]. It keeps one invariant across every thread that
//! calls it: an alarm is `active` in the store exactly when a live timer
//! exists for it.
//!
//! ```text
//!            create_alarm
//!                 │
//!                 ▼
//!              active ──── fire ────► triggered
//!                 │
//!                 └──── cancel_alarm ──► cancelled
//! ```
//!
//! Two scoped locks serialize the critical sections:
//!
//! - per `(owner, time)` across duplicate check, insert and arm, so two
//!   concurrent creates for the same slot cannot both succeed. Cancel and
//!   restore take it too, so they never see a stored alarm whose timer is
//!   not armed yet.
//! - per alarm id across cancel and fire, so the first one to write a
//!   terminal status wins and the other observes it.
//!
//! The slot lock is always taken before the id lock. Neither is held while
//! a timer waits.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alarm::locks::KeyedLocks;
use crate::alarm::model::{Alarm, AlarmId, AlarmStatus, OwnerId};
use crate::alarm::ring::{FireEvent, RingNotifier};
use crate::alarm::store::{AlarmStore, StoreError};
use crate::alarm::time::{CanonicalTime, Clock, TimeFormatError, normalize, seconds_until};
use crate::alarm::timer::{TimerError, TimerRegistry};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total attempts at recording a fire before giving up on it.
    pub fire_retry_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub fire_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fire_retry_attempts: 3,
            fire_retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidTime(#[from] TimeFormatError),

    #[error("owner '{owner_id}' already has an active alarm at {time} (alarm {existing})")]
    DuplicateAlarm {
        existing: AlarmId,
        owner_id: OwnerId,
        time: CanonicalTime,
    },

    #[error("alarm {0} not found")]
    NotFound(AlarmId),

    #[error("alarm {id} is already {status}")]
    Conflict { id: AlarmId, status: AlarmStatus },

    #[error(transparent)]
    Store(StoreError),

    #[error("could not schedule alarm {id}: {source}")]
    Scheduling {
        id: AlarmId,
        #[source]
        source: TimerError,
    },
}

impl EngineError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(err) => err.is_transient(),
            EngineError::Scheduling { .. } => true,
            _ => false,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Conflict { id, from, .. } => EngineError::Conflict { id, status: from },
            other => EngineError::Store(other),
        }
    }
}

/// Shared handle to the alarm lifecycle; clones refer to the same engine.
#[derive(Clone)]
pub struct AlarmEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn AlarmStore>,
    notifier: Arc<dyn RingNotifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    timers: TimerRegistry,
    alarm_locks: KeyedLocks<AlarmId>,
    slot_locks: KeyedLocks<(OwnerId, CanonicalTime)>,
}

impl AlarmEngine {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        notifier: Arc<dyn RingNotifier>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                notifier,
                clock,
                config,
                timers: TimerRegistry::new(),
                alarm_locks: KeyedLocks::new(),
                slot_locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn create_alarm(&self, owner_id: &OwnerId, raw_time: &str) -> Result<Alarm, EngineError> {
        let time = normalize(raw_time)?;
        let slot = (owner_id.clone(), time);
        self.inner
            .slot_locks
            .with_lock(&slot, || self.inner.create_locked(owner_id, time))
    }

    pub fn cancel_alarm(&self, id: AlarmId) -> Result<Alarm, EngineError> {
        let alarm = self.inner.store.get(id)?;
        self.inner.with_alarm_locks(&alarm, || self.inner.cancel_locked(id))
    }

    /// Like [`cancel_alarm`](Self::cancel_alarm), but an alarm that is
    /// already cancelled counts as success. A triggered alarm still reports
    /// `Conflict`.
    pub fn ensure_cancelled(&self, id: AlarmId) -> Result<Alarm, EngineError> {
        match self.cancel_alarm(id) {
            Err(EngineError::Conflict {
                status: AlarmStatus::Cancelled,
                ..
            }) => self.get_alarm(id),
            outcome => outcome,
        }
    }

    /// Non-cancelled alarms of `owner_id`, earliest time of day first.
    pub fn list_alarms(&self, owner_id: &OwnerId) -> Result<Vec<Alarm>, EngineError> {
        Ok(self.inner.store.list_by_owner(owner_id, true)?)
    }

    pub fn get_alarm(&self, id: AlarmId) -> Result<Alarm, EngineError> {
        Ok(self.inner.store.get(id)?)
    }

    #[cfg(test)]
    pub fn is_armed(&self, id: AlarmId) -> bool {
        self.inner.timers.contains(id)
    }

    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        self.inner.timers.len()
    }

    /// Arms a timer for every persisted `active` alarm that lacks one.
    ///
    /// Times already passed today roll over to tomorrow, the same as a fresh
    /// create. Returns how many timers were armed.
    pub fn restore(&self) -> Result<usize, EngineError> {
        let active = self.inner.store.list_active()?;
        let mut armed = 0;
        for alarm in active {
            let id = alarm.id;
            let newly_armed = self
                .inner
                .with_alarm_locks(&alarm, || self.inner.restore_locked(id))?;
            if newly_armed {
                armed += 1;
            }
        }
        info!(armed, "restored active alarms");
        Ok(armed)
    }

    /// Stops every pending timer. Stored alarms stay `active` so the next
    /// [`restore`](Self::restore) picks them up again.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.inner.timers.cancel_all();
        info!(cancelled, "alarm timers stopped");
        cancelled
    }
}

impl EngineInner {
    /// Holds the slot lock of `alarm`, then its id lock, around `critical`.
    fn with_alarm_locks<R>(&self, alarm: &Alarm, critical: impl FnOnce() -> R) -> R {
        let slot = (alarm.owner_id.clone(), alarm.time_of_day);
        self.slot_locks
            .with_lock(&slot, || self.alarm_locks.with_lock(&alarm.id, critical))
    }

    fn create_locked(
        self: &Arc<Self>,
        owner_id: &OwnerId,
        time: CanonicalTime,
    ) -> Result<Alarm, EngineError> {
        if let Some(existing) = self.store.find_active(owner_id, time)? {
            debug!(
                alarm_id = %existing.id,
                owner_id = %owner_id,
                time = %time,
                "duplicate alarm rejected"
            );
            return Err(EngineError::DuplicateAlarm {
                existing: existing.id,
                owner_id: owner_id.clone(),
                time,
            });
        }

        let now = self.clock.now();
        let alarm = self.store.create(owner_id, time, now)?;
        let delay = seconds_until(time, now.naive_local());
        if let Err(source) = self.arm(alarm.id, delay) {
            if let Err(rollback) = self.store.delete(alarm.id) {
                error!(
                    alarm_id = %alarm.id,
                    error = %rollback,
                    "could not remove alarm after its timer failed to arm"
                );
            }
            return Err(EngineError::Scheduling {
                id: alarm.id,
                source,
            });
        }

        info!(
            alarm_id = %alarm.id,
            owner_id = %owner_id,
            time = %time,
            delay_secs = delay.as_secs(),
            "alarm armed"
        );
        Ok(alarm)
    }

    fn cancel_locked(self: &Arc<Self>, id: AlarmId) -> Result<Alarm, EngineError> {
        let alarm = self.store.get(id)?;
        if alarm.status.is_terminal() {
            return Err(EngineError::Conflict {
                id,
                status: alarm.status,
            });
        }

        let stopped = self.timers.cancel(id);
        let claimed_by_fire = !stopped && self.timers.contains(id);
        if claimed_by_fire {
            let current = self.store.get(id)?;
            if current.status.is_terminal() {
                return Err(EngineError::Conflict {
                    id,
                    status: current.status,
                });
            }
            debug!(alarm_id = %id, "timer already elapsed; cancelling before the fire is recorded");
        }

        match self.store.set_status(id, AlarmStatus::Cancelled) {
            Ok(cancelled) => {
                self.timers.remove(id);
                info!(alarm_id = %id, owner_id = %cancelled.owner_id, "alarm cancelled");
                Ok(cancelled)
            }
            Err(err) => {
                let still_active = !matches!(
                    err,
                    StoreError::NotFound(_) | StoreError::Conflict { .. }
                );
                if still_active && !claimed_by_fire {
                    self.rearm(&alarm, &err);
                }
                Err(err.into())
            }
        }
    }

    /// Puts a fresh timer back under an alarm whose cancellation could not be
    /// persisted, so the record is not left `active` without one.
    fn rearm(self: &Arc<Self>, alarm: &Alarm, cause: &StoreError) {
        self.timers.remove(alarm.id);
        let delay = seconds_until(alarm.time_of_day, self.clock.now().naive_local());
        match self.arm(alarm.id, delay) {
            Ok(()) => warn!(
                alarm_id = %alarm.id,
                error = %cause,
                "cancel was not persisted; timer re-armed"
            ),
            Err(err) => error!(
                alarm_id = %alarm.id,
                error = %err,
                "cancel was not persisted and the timer could not be re-armed"
            ),
        }
    }

    fn restore_locked(self: &Arc<Self>, id: AlarmId) -> Result<bool, EngineError> {
        if self.timers.contains(id) {
            return Ok(false);
        }
        let alarm = self.store.get(id)?;
        if alarm.status.is_terminal() {
            return Ok(false);
        }
        let delay = seconds_until(alarm.time_of_day, self.clock.now().naive_local());
        self.arm(id, delay)
            .map_err(|source| EngineError::Scheduling { id, source })?;
        debug!(
            alarm_id = %id,
            owner_id = %alarm.owner_id,
            time = %alarm.time_of_day,
            delay_secs = delay.as_secs(),
            "alarm re-armed from store"
        );
        Ok(true)
    }

    fn arm(self: &Arc<Self>, id: AlarmId, delay: Duration) -> Result<(), TimerError> {
        let engine = Arc::downgrade(self);
        self.timers.arm(id, delay, move |id| {
            if let Some(engine) = engine.upgrade() {
                engine.fire(id);
            }
        })?;
        Ok(())
    }

    /// Timer callback. Runs on the timer's own thread.
    fn fire(&self, id: AlarmId) {
        let attempts = self.config.fire_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.alarm_locks.with_lock(&id, || self.record_fire(id)) {
                Ok(Some(event)) => {
                    self.ring(&event);
                    return;
                }
                Ok(None) => return,
                Err(err) if attempt < attempts && err.is_transient() => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        alarm_id = %id,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "could not record alarm fire; retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(err) => {
                    error!(
                        alarm_id = %id,
                        attempts = attempt,
                        error = %err,
                        "giving up on recording alarm fire"
                    );
                    self.timers.remove(id);
                    return;
                }
            }
        }
    }

    /// Moves `id` to `triggered` unless something else settled it first.
    fn record_fire(&self, id: AlarmId) -> Result<Option<FireEvent>, StoreError> {
        let alarm = match self.store.get(id) {
            Ok(alarm) => alarm,
            Err(StoreError::NotFound(_)) => {
                self.timers.remove(id);
                debug!(alarm_id = %id, "timer elapsed for an alarm that no longer exists");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if alarm.status.is_terminal() {
            self.timers.remove(id);
            debug!(alarm_id = %id, status = %alarm.status, "timer elapsed for a settled alarm");
            return Ok(None);
        }

        let event = match self.store.set_status(id, AlarmStatus::Triggered) {
            Ok(triggered) => Some(FireEvent::from(&triggered)),
            Err(StoreError::Conflict { from, .. }) => {
                debug!(
                    alarm_id = %id,
                    status = %from,
                    "alarm settled before the fire was recorded"
                );
                None
            }
            Err(err) => return Err(err),
        };
        self.timers.remove(id);
        if let Some(event) = &event {
            info!(
                alarm_id = %id,
                owner_id = %event.owner_id,
                time = %event.time_of_day,
                "alarm triggered"
            );
        }
        Ok(event)
    }

    fn ring(&self, event: &FireEvent) {
        if let Err(err) = self.notifier.ring(event) {
            warn!(
                alarm_id = %event.alarm_id,
                error = %format!("{err:#}"),
                "ring notifier failed; alarm stays triggered"
            );
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config
            .fire_retry_backoff
            .saturating_mul(1_u32 << exponent)
    }
}
