use std::collections::BTreeSet;
use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::alarm::model::{Alarm, AlarmStatus};
use crate::alarm::time::seconds_until;

pub fn run_diagnostics(store_label: &str, alarms: &[Alarm], now: NaiveDateTime) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_diagnostics(&mut out, store_label, alarms, now)?;
    out.flush()?;
    Ok(())
}

fn write_diagnostics(
    out: &mut impl Write,
    store_label: &str,
    alarms: &[Alarm],
    now: NaiveDateTime,
) -> io::Result<()> {
    let count = |status: AlarmStatus| alarms.iter().filter(|a| a.status == status).count();
    let owners = alarms
        .iter()
        .map(|alarm| alarm.owner_id.as_str())
        .collect::<BTreeSet<_>>();

    writeln!(out, "voicealarm diagnostics")?;
    writeln!(out, "Alarm store: {store_label}")?;
    writeln!(
        out,
        "Stored alarms: {} (triggered {}, cancelled {})",
        alarms.len(),
        count(AlarmStatus::Triggered),
        count(AlarmStatus::Cancelled)
    )?;
    writeln!(out, "Owners: {}", owners.len())?;
    writeln!(out, "Active alarms: {}", count(AlarmStatus::Active))?;

    let mut upcoming = alarms
        .iter()
        .filter(|alarm| alarm.is_active())
        .map(|alarm| (seconds_until(alarm.time_of_day, now), alarm))
        .collect::<Vec<_>>();
    upcoming.sort_by_key(|(delay, alarm)| (*delay, alarm.id));

    for (delay, alarm) in &upcoming {
        writeln!(
            out,
            "  #{} {} at {} (in {})",
            alarm.id,
            alarm.owner_id,
            alarm.time_of_day,
            format_delay(*delay)
        )?;
    }
    match upcoming.first() {
        Some((delay, alarm)) => writeln!(
            out,
            "Next due: alarm {} in {}",
            alarm.id,
            format_delay(*delay)
        )?,
        None => writeln!(out, "Next due: none")?,
    }
    Ok(())
}

fn format_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs / 60) % 60, secs % 60)
}
