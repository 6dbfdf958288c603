use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::alarm::model::{Alarm, AlarmId, OwnerId};
use crate::alarm::time::CanonicalTime;

/// What a fired alarm hands to the sound/hardware side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub alarm_id: AlarmId,
    pub owner_id: OwnerId,
    pub time_of_day: CanonicalTime,
}

impl From<&Alarm> for FireEvent {
    fn from(alarm: &Alarm) -> Self {
        Self {
            alarm_id: alarm.id,
            owner_id: alarm.owner_id.clone(),
            time_of_day: alarm.time_of_day,
        }
    }
}

/// Produces the audible or physical alarm. Runs on the timer's thread, after
/// the alarm is already recorded as triggered; errors are only logged.
pub trait RingNotifier: Send + Sync {
    fn ring(&self, event: &FireEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleRingNotifier {
    pub bell: bool,
}

impl RingNotifier for ConsoleRingNotifier {
    fn ring(&self, event: &FireEvent) -> Result<()> {
        info!(
            alarm_id = %event.alarm_id,
            owner_id = %event.owner_id,
            time = %event.time_of_day,
            "alarm ringing"
        );
        if self.bell {
            let mut stdout = io::stdout().lock();
            write!(stdout, "\x07").context("could not write terminal bell")?;
            stdout.flush().context("could not flush terminal bell")?;
        }
        Ok(())
    }
}
