use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A time of day normalized to 24-hour `HH:MM:SS`.
///
/// Ordering follows the clock, so sorting by `CanonicalTime` sorts alarms
/// from earliest to latest in the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalTime(NaiveTime);

impl CanonicalTime {
    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, second).map(Self)
    }

    pub fn as_naive(self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for CanonicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

impl FromStr for CanonicalTime {
    type Err = TimeFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

impl Serialize for CanonicalTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        normalize(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time '{input}': {reason}")]
pub struct TimeFormatError {
    input: String,
    reason: &'static str,
}

impl TimeFormatError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }

    /// The text exactly as the caller supplied it.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Meridiem {
    Am,
    Pm,
}

const MERIDIEM_SUFFIXES: [(&str, Meridiem); 6] = [
    ("a.m.", Meridiem::Am),
    ("p.m.", Meridiem::Pm),
    ("a.m", Meridiem::Am),
    ("p.m", Meridiem::Pm),
    ("am", Meridiem::Am),
    ("pm", Meridiem::Pm),
];

/// Parses a 12-hour (`7:05 pm`, `7 pm`, `7:05:30 p.m.`) or 24-hour
/// (`19:05`, `19:05:30`) time of day.
pub fn normalize(raw: &str) -> Result<CanonicalTime, TimeFormatError> {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(TimeFormatError::new(raw, "empty time"));
    }

    let (clock, meridiem) = split_meridiem(&lowered);
    if clock.is_empty() {
        return Err(TimeFormatError::new(raw, "missing hour"));
    }

    let fields = clock.split(':').collect::<Vec<_>>();
    let (hour_text, minute_text, second_text) = match (fields.as_slice(), meridiem) {
        ([hour], Some(_)) => (*hour, None, None),
        ([hour, minute], _) => (*hour, Some(*minute), None),
        ([hour, minute, second], _) => (*hour, Some(*minute), Some(*second)),
        _ => {
            return Err(TimeFormatError::new(
                raw,
                "expected H:MM, H:MM:SS or an hour with am/pm",
            ));
        }
    };

    let hour = parse_digits(hour_text, 1..=2)
        .ok_or_else(|| TimeFormatError::new(raw, "hour must be one or two digits"))?;
    let minute = match minute_text {
        Some(text) => parse_digits(text, 2..=2)
            .ok_or_else(|| TimeFormatError::new(raw, "minute must be two digits"))?,
        None => 0,
    };
    let second = match second_text {
        Some(text) => parse_digits(text, 2..=2)
            .ok_or_else(|| TimeFormatError::new(raw, "second must be two digits"))?,
        None => 0,
    };

    let hour24 = match meridiem {
        Some(marker) => {
            if !(1..=12).contains(&hour) {
                return Err(TimeFormatError::new(
                    raw,
                    "12-hour clock hour must be between 1 and 12",
                ));
            }
            match (marker, hour) {
                (Meridiem::Am, 12) => 0,
                (Meridiem::Am, hour) => hour,
                (Meridiem::Pm, 12) => 12,
                (Meridiem::Pm, hour) => hour + 12,
            }
        }
        None => {
            if hour > 23 {
                return Err(TimeFormatError::new(raw, "hour must be between 0 and 23"));
            }
            hour
        }
    };
    if minute > 59 {
        return Err(TimeFormatError::new(raw, "minute must be between 0 and 59"));
    }
    if second > 59 {
        return Err(TimeFormatError::new(raw, "second must be between 0 and 59"));
    }

    CanonicalTime::from_hms(hour24, minute, second)
        .ok_or_else(|| TimeFormatError::new(raw, "time out of range"))
}

fn split_meridiem(lowered: &str) -> (&str, Option<Meridiem>) {
    for (suffix, marker) in MERIDIEM_SUFFIXES {
        if let Some(rest) = lowered.strip_suffix(suffix) {
            return (rest.trim_end(), Some(marker));
        }
    }
    (lowered, None)
}

fn parse_digits(text: &str, width: std::ops::RangeInclusive<usize>) -> Option<u32> {
    if !width.contains(&text.len()) || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Delay from `now` until the next wall-clock occurrence of `time`.
///
/// A time already behind `now` rolls over to the same time tomorrow; a time
/// equal to `now` is due immediately.
pub fn seconds_until(time: CanonicalTime, now: NaiveDateTime) -> Duration {
    let today = now.date().and_time(time.as_naive());
    let target = if today >= now {
        today
    } else {
        match now.date().checked_add_days(Days::new(1)) {
            Some(tomorrow) => tomorrow.and_time(time.as_naive()),
            None => return Duration::ZERO,
        }
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedClock(pub DateTime<Local>);

#[cfg(test)]
impl FixedClock {
    pub(crate) fn at(hour: u32, minute: u32, second: u32) -> Self {
        use chrono::TimeZone;

        let now = Local
            .with_ymd_and_hms(2026, 10, 19, hour, minute, second)
            .earliest()
            .expect("valid fixed clock time");
        Self(now)
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .expect("valid date")
            .and_hms_opt(hour, minute, second)
            .expect("valid time")
    }

    fn canonical(raw: &str) -> String {
        normalize(raw).expect("valid time").to_string()
    }

    #[test]
    fn twelve_and_twenty_four_hour_inputs_agree() {
        assert_eq!(
            normalize("2:30 pm").expect("12h"),
            normalize("14:30:00").expect("24h")
        );
        assert_eq!(canonical("7:00 am"), "07:00:00");
        assert_eq!(canonical("9:00 am"), canonical("09:00"));
        assert_eq!(canonical("14:30"), "14:30:00");
        assert_eq!(canonical("0:05"), "00:05:00");
        assert_eq!(canonical("23:59:59"), "23:59:59");
    }

    #[test]
    fn meridiem_spellings_are_accepted() {
        assert_eq!(canonical("2:30PM"), "14:30:00");
        assert_eq!(canonical("2:30 p.m."), "14:30:00");
        assert_eq!(canonical("2:30 p.m"), "14:30:00");
        assert_eq!(canonical("  7 AM "), "07:00:00");
        assert_eq!(canonical("11:15:20 pm"), "23:15:20");
    }

    #[test]
    fn noon_and_midnight_follow_twelve_hour_rules() {
        assert_eq!(canonical("12:00 am"), "00:00:00");
        assert_eq!(canonical("12:15 pm"), "12:15:00");
        assert_eq!(canonical("12 am"), "00:00:00");
    }

    #[test]
    fn canonical_form_is_stable_when_reparsed() {
        for raw in ["2:30 pm", "07:00", "12:00 am", "23:59:59", "6 pm"] {
            let first = normalize(raw).expect("valid");
            let second = normalize(&first.to_string()).expect("canonical reparses");
            assert_eq!(first, second, "{raw} should be stable");
        }
    }

    #[test]
    fn out_of_range_and_malformed_inputs_fail() {
        for raw in [
            "", "24:00", "13:00 pm", "0:30 am", "12:60", "12:00:60", "7:5", "7", "noon",
            "am", "1:2:3:4", "-1:00", "7:00 xm", "123:00",
        ] {
            assert!(normalize(raw).is_err(), "'{raw}' should be rejected");
        }
    }

    #[test]
    fn error_keeps_original_input() {
        let err = normalize(" 25:00 ").expect_err("out of range");
        assert_eq!(err.input(), " 25:00 ");
        assert!(err.to_string().contains("hour must be between 0 and 23"));
    }

    #[test]
    fn later_time_today_is_direct_difference() {
        let time = normalize("07:30").expect("valid");
        assert_eq!(seconds_until(time, at(7, 0, 0)), Duration::from_secs(30 * 60));
    }

    #[test]
    fn past_time_rolls_to_tomorrow() {
        let time = normalize("06:00").expect("valid");
        let now = at(7, 0, 0);
        let elapsed_since_target = 60 * 60;
        assert_eq!(
            seconds_until(time, now),
            Duration::from_secs(24 * 60 * 60 - elapsed_since_target)
        );
    }

    #[test]
    fn current_second_is_due_immediately() {
        let time = normalize("07:00:00").expect("valid");
        assert_eq!(seconds_until(time, at(7, 0, 0)), Duration::ZERO);
    }

    #[test]
    fn sub_second_past_rolls_forward_not_negative() {
        let time = normalize("07:00:00").expect("valid");
        let now = at(7, 0, 0) + chrono::Duration::milliseconds(500);
        let delay = seconds_until(time, now);
        assert_eq!(delay, Duration::from_millis(24 * 60 * 60 * 1000 - 500));
    }

    #[test]
    fn delay_never_exceeds_one_day() {
        let day = Duration::from_secs(24 * 60 * 60);
        for hour in 0..24 {
            let time = CanonicalTime::from_hms(hour, 17, 0).expect("valid");
            let delay = seconds_until(time, at(13, 45, 12));
            assert!(delay < day);
        }
    }

    #[test]
    fn serde_uses_canonical_string() {
        let time = normalize("6:05 pm").expect("valid");
        let json = serde_json::to_string(&time).expect("serialize");
        assert_eq!(json, "\"18:05:00\"");
        let back: CanonicalTime = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, time);
        assert!(serde_json::from_str::<CanonicalTime>("\"31:00\"").is_err());
    }
}
