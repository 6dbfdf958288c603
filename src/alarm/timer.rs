use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::alarm::lock_unpoisoned;
use crate::alarm::model::AlarmId;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("alarm {0} already has a live timer")]
    AlreadyArmed(AlarmId),

    #[error("could not spawn timer thread for alarm {id}: {source}")]
    Spawn {
        id: AlarmId,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SlotState {
    Pending,
    Cancelled,
    Running,
}

#[derive(Debug)]
struct TimerSlot {
    state: Mutex<SlotState>,
    wake: Condvar,
}

impl TimerSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            wake: Condvar::new(),
        }
    }

    /// Blocks until `deadline` or cancellation. Returns `true` when this call
    /// claimed the slot for running the callback.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        loop {
            match *state {
                SlotState::Cancelled | SlotState::Running => return false,
                SlotState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                *state = SlotState::Running;
                return true;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn cancel(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if *state != SlotState::Pending {
            return false;
        }
        *state = SlotState::Cancelled;
        self.wake.notify_all();
        true
    }
}

/// One-shot, cancellable delayed callbacks keyed by alarm id.
///
/// Each armed timer sleeps on its own thread. At most one handle exists per
/// id; the callback runs at most once and never after a successful
/// [`cancel`](Self::cancel).
#[derive(Debug, Default)]
pub struct TimerRegistry {
    handles: Mutex<HashMap<AlarmId, Arc<TimerSlot>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&self, id: AlarmId, delay: Duration, callback: F) -> Result<(), TimerError>
    where
        F: FnOnce(AlarmId) + Send + 'static,
    {
        let mut handles = lock_unpoisoned(&self.handles);
        if handles.contains_key(&id) {
            return Err(TimerError::AlreadyArmed(id));
        }

        let deadline = Instant::now() + delay;
        let slot = Arc::new(TimerSlot::new());
        let thread_slot = Arc::clone(&slot);
        thread::Builder::new()
            .name(format!("alarm-timer-{id}"))
            .spawn(move || {
                if thread_slot.wait_until(deadline) {
                    trace!(alarm_id = %id, "timer elapsed");
                    callback(id);
                }
            })
            .map_err(|source| TimerError::Spawn { id, source })?;

        handles.insert(id, slot);
        Ok(())
    }

    /// Stops a pending callback. `false` means there was no handle, or the
    /// callback has already started.
    pub fn cancel(&self, id: AlarmId) -> bool {
        let handles = lock_unpoisoned(&self.handles);
        match handles.get(&id) {
            Some(slot) => slot.cancel(),
            None => false,
        }
    }

    pub fn remove(&self, id: AlarmId) -> bool {
        lock_unpoisoned(&self.handles).remove(&id).is_some()
    }

    pub fn contains(&self, id: AlarmId) -> bool {
        lock_unpoisoned(&self.handles).contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.handles).len()
    }

    /// Cancels every pending timer and forgets all handles. Returns how many
    /// callbacks were prevented.
    pub fn cancel_all(&self) -> usize {
        let mut handles = lock_unpoisoned(&self.handles);
        let cancelled = handles
            .values()
            .filter(|slot| slot.cancel())
            .count();
        handles.clear();
        cancelled
    }
}
