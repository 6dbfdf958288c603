use regex::{Captures, Regex};

/// Pulls a time of day out of free-form recognised speech.
///
/// `None` means the phrase carried no actionable time; callers re-prompt
/// rather than treat it as an error. A returned string is still raw and goes
/// through the normalizer like any other input.
pub trait TimeExtractor: Send + Sync {
    fn extract(&self, phrase: &str) -> Option<String>;
}

/// Finds `2 pm`, `2:30 p.m.`, `2.30pm`, `14:30` or `14 hours` anywhere in a
/// phrase. Twelve-hour forms win over a bare number when both appear.
#[derive(Debug, Clone)]
pub struct PatternTimeExtractor {
    twelve_hour: Regex,
    twenty_four_hour: Regex,
}

impl PatternTimeExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            twelve_hour: Regex::new(r"(?i)(\d{1,2})(?:[:.](\d{2}))?\s*([ap])\.?m\.?\b")?,
            twenty_four_hour: Regex::new(r"(?i)(\d{1,2})(?::(\d{2}))?(?:\s*hours)?\b")?,
        })
    }
}

impl TimeExtractor for PatternTimeExtractor {
    fn extract(&self, phrase: &str) -> Option<String> {
        if let Some(caps) = self.twelve_hour.captures(phrase) {
            let meridiem = if caps[3].eq_ignore_ascii_case("a") { "am" } else { "pm" };
            return Some(format!("{}:{} {meridiem}", &caps[1], minutes(&caps)));
        }

        self.twenty_four_hour
            .captures_iter(phrase)
            .find(|caps| caps[1].parse::<u32>().is_ok_and(|hour| hour <= 23))
            .map(|caps| format!("{:0>2}:{}", &caps[1], minutes(&caps)))
    }
}

fn minutes<'h>(caps: &Captures<'h>) -> &'h str {
    caps.get(2).map_or("00", |m| m.as_str())
}
