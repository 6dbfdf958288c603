use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::alarm::engine::{AlarmEngine, EngineError};
use crate::alarm::model::{Alarm, AlarmId, AlarmStatus, OwnerId};
use crate::alarm::time::CanonicalTime;
use crate::voice::extractor::TimeExtractor;

const SET_PHRASES: [&str; 3] = ["set the alarm", "set an alarm", "set alarm"];
const CANCEL_PHRASES: [&str; 2] = ["cancel alarm", "delete alarm"];
const LIST_PHRASES: [&str; 2] = ["list alarms", "show alarms"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCommand {
    /// `raw_time` is `None` when the phrase named no time.
    SetAlarm { raw_time: Option<String> },
    /// `id` is `None` when the phrase named no alarm number.
    CancelAlarm { id: Option<AlarmId> },
    ListAlarms,
    Help,
    Unrecognized,
}

/// Outcome of one spoken command, rendered for the user by `Display`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    AlarmSet(Alarm),
    NoTimeHeard,
    InvalidTime { input: String, reason: &'static str },
    DuplicateAlarm { existing: AlarmId, time: CanonicalTime },
    AlarmCancelled(AlarmId),
    NoAlarmIdHeard,
    AlarmNotFound(AlarmId),
    AlreadySettled { id: AlarmId, status: AlarmStatus },
    Alarms(Vec<Alarm>),
    Help,
    NotRecognized,
    Failed(String),
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandReply::AlarmSet(alarm) => {
                write!(f, "Alarm {} set for {}", alarm.id, alarm.time_of_day)
            }
            CommandReply::NoTimeHeard => {
                f.write_str("Could not hear a time. Please include one, like 'set alarm 7 am'.")
            }
            CommandReply::InvalidTime { input, reason } => {
                write!(f, "'{input}' is not a valid time: {reason}")
            }
            CommandReply::DuplicateAlarm { existing, time } => {
                write!(f, "Alarm {existing} is already set for {time}")
            }
            CommandReply::AlarmCancelled(id) => write!(f, "Cancelled alarm {id}"),
            CommandReply::NoAlarmIdHeard => {
                f.write_str("Could not hear an alarm number. Say it like 'cancel alarm 3'.")
            }
            CommandReply::AlarmNotFound(id) => write!(f, "There is no alarm {id}"),
            CommandReply::AlreadySettled { id, status } => {
                write!(f, "Alarm {id} is already {status}")
            }
            CommandReply::Alarms(alarms) if alarms.is_empty() => {
                f.write_str("No alarms currently set")
            }
            CommandReply::Alarms(alarms) => {
                f.write_str("Current alarms:")?;
                for alarm in alarms {
                    write!(
                        f,
                        "\n  ID: {} | Time: {} | Status: {}",
                        alarm.id, alarm.time_of_day, alarm.status
                    )?;
                }
                Ok(())
            }
            CommandReply::Help => f.write_str(
                "Available voice commands:\n  \
                 Set alarm [time] - set a new alarm\n  \
                 Cancel alarm [ID] - cancel an existing alarm\n  \
                 List alarms - show all alarms\n  \
                 Help - show this message",
            ),
            CommandReply::NotRecognized => {
                f.write_str("Command not recognized. Say 'help' for available commands.")
            }
            CommandReply::Failed(message) => write!(f, "Something went wrong: {message}"),
        }
    }
}

/// Turns recognised phrases into [`VoiceCommand`]s.
#[derive(Clone)]
pub struct CommandParser {
    extractor: Arc<dyn TimeExtractor>,
    cancel_id: Regex,
}

impl CommandParser {
    pub fn new(extractor: Arc<dyn TimeExtractor>) -> Result<Self, regex::Error> {
        Ok(Self {
            extractor,
            cancel_id: Regex::new(r"(?i)(?:cancel|delete)\s+alarm\s+(?:number\s+|id\s+|#)?(\d+)")?,
        })
    }

    pub fn parse(&self, phrase: &str) -> VoiceCommand {
        let lowered = phrase.trim().to_lowercase();
        let mentions = |phrases: &[&str]| phrases.iter().any(|p| lowered.contains(p));

        if mentions(&SET_PHRASES) {
            VoiceCommand::SetAlarm {
                raw_time: self.extractor.extract(&lowered),
            }
        } else if mentions(&CANCEL_PHRASES) {
            let id = self
                .cancel_id
                .captures(&lowered)
                .and_then(|caps| caps[1].parse::<AlarmId>().ok());
            VoiceCommand::CancelAlarm { id }
        } else if mentions(&LIST_PHRASES) {
            VoiceCommand::ListAlarms
        } else if lowered.contains("help") {
            VoiceCommand::Help
        } else {
            VoiceCommand::Unrecognized
        }
    }
}

/// Runs parsed voice commands against the engine on behalf of one owner.
#[derive(Clone)]
pub struct CommandDispatcher {
    engine: AlarmEngine,
    parser: CommandParser,
}

impl CommandDispatcher {
    pub fn new(engine: AlarmEngine, parser: CommandParser) -> Self {
        Self { engine, parser }
    }

    pub fn dispatch(&self, owner_id: &OwnerId, phrase: &str) -> CommandReply {
        let command = self.parser.parse(phrase);
        debug!(owner_id = %owner_id, ?command, "voice command parsed");
        match command {
            VoiceCommand::SetAlarm { raw_time: None } => CommandReply::NoTimeHeard,
            VoiceCommand::SetAlarm {
                raw_time: Some(raw),
            } => match self.engine.create_alarm(owner_id, &raw) {
                Ok(alarm) => CommandReply::AlarmSet(alarm),
                Err(err) => reply_for_error(err),
            },
            VoiceCommand::CancelAlarm { id: None } => CommandReply::NoAlarmIdHeard,
            VoiceCommand::CancelAlarm { id: Some(id) } => self.cancel(owner_id, id),
            VoiceCommand::ListAlarms => match self.engine.list_alarms(owner_id) {
                Ok(alarms) => CommandReply::Alarms(alarms),
                Err(err) => reply_for_error(err),
            },
            VoiceCommand::Help => CommandReply::Help,
            VoiceCommand::Unrecognized => CommandReply::NotRecognized,
        }
    }

    fn cancel(&self, owner_id: &OwnerId, id: AlarmId) -> CommandReply {
        // Other owners' alarms are indistinguishable from missing ones.
        match self.engine.get_alarm(id) {
            Ok(alarm) if &alarm.owner_id == owner_id => {}
            Ok(_) => return CommandReply::AlarmNotFound(id),
            Err(err) => return reply_for_error(err),
        }
        // Saying "cancel" twice is not an error; cancelling a rung alarm is.
        match self.engine.ensure_cancelled(id) {
            Ok(_) => CommandReply::AlarmCancelled(id),
            Err(err) => reply_for_error(err),
        }
    }
}

fn reply_for_error(err: EngineError) -> CommandReply {
    match err {
        EngineError::InvalidTime(err) => CommandReply::InvalidTime {
            input: err.input().to_string(),
            reason: err.reason(),
        },
        EngineError::DuplicateAlarm { existing, time, .. } => {
            CommandReply::DuplicateAlarm { existing, time }
        }
        EngineError::NotFound(id) => CommandReply::AlarmNotFound(id),
        EngineError::Conflict { id, status } => CommandReply::AlreadySettled { id, status },
        err @ (EngineError::Store(_) | EngineError::Scheduling { .. }) => {
            warn!(error = %err, "voice command failed");
            CommandReply::Failed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::engine::EngineConfig;
    use crate::alarm::ring::ConsoleRingNotifier;
    use crate::alarm::store::MemoryAlarmStore;
    use crate::alarm::time::FixedClock;
    use crate::voice::extractor::PatternTimeExtractor;

    fn parser() -> CommandParser {
        let extractor = PatternTimeExtractor::new().expect("patterns compile");
        CommandParser::new(Arc::new(extractor)).expect("patterns compile")
    }

    fn dispatcher() -> CommandDispatcher {
        let engine = AlarmEngine::new(
            Arc::new(MemoryAlarmStore::new()),
            Arc::new(ConsoleRingNotifier::default()),
            Arc::new(FixedClock::at(6, 0, 0)),
            EngineConfig::default(),
        );
        CommandDispatcher::new(engine, parser())
    }

    #[test]
    fn parses_each_command_family() {
        let parser = parser();
        assert_eq!(
            parser.parse("Set the alarm for 7 am"),
            VoiceCommand::SetAlarm {
                raw_time: Some("7:00 am".to_string())
            }
        );
        assert_eq!(
            parser.parse("set an alarm"),
            VoiceCommand::SetAlarm { raw_time: None }
        );
        assert_eq!(
            parser.parse("cancel alarm number 12"),
            VoiceCommand::CancelAlarm {
                id: Some(AlarmId::new(12))
            }
        );
        assert_eq!(
            parser.parse("delete alarm #3"),
            VoiceCommand::CancelAlarm {
                id: Some(AlarmId::new(3))
            }
        );
        assert_eq!(
            parser.parse("cancel alarm please"),
            VoiceCommand::CancelAlarm { id: None }
        );
        assert_eq!(parser.parse("show alarms"), VoiceCommand::ListAlarms);
        assert_eq!(parser.parse("help me"), VoiceCommand::Help);
        assert_eq!(parser.parse("what's the weather"), VoiceCommand::Unrecognized);
    }

    #[test]
    fn set_list_cancel_round() {
        let dispatcher = dispatcher();
        let u1 = OwnerId::new("u1");

        let CommandReply::AlarmSet(alarm) = dispatcher.dispatch(&u1, "set alarm 7 am") else {
            panic!("alarm should be set");
        };
        assert_eq!(alarm.time_of_day.to_string(), "07:00:00");
        assert_eq!(
            dispatcher.dispatch(&u1, "set the alarm for 07:00"),
            CommandReply::DuplicateAlarm {
                existing: alarm.id,
                time: alarm.time_of_day
            }
        );

        let listed = dispatcher.dispatch(&u1, "list alarms");
        assert!(listed.to_string().contains("Time: 07:00:00"));

        let cancel = format!("cancel alarm {}", alarm.id);
        assert_eq!(
            dispatcher.dispatch(&u1, &cancel),
            CommandReply::AlarmCancelled(alarm.id)
        );
        assert_eq!(
            dispatcher.dispatch(&u1, &cancel),
            CommandReply::AlarmCancelled(alarm.id)
        );
        assert_eq!(
            dispatcher.dispatch(&u1, "list alarms").to_string(),
            "No alarms currently set"
        );
    }

    #[test]
    fn cannot_cancel_another_owners_alarm() {
        let dispatcher = dispatcher();
        let CommandReply::AlarmSet(alarm) =
            dispatcher.dispatch(&OwnerId::new("u1"), "set alarm 9 pm")
        else {
            panic!("alarm should be set");
        };
        let phrase = format!("cancel alarm {}", alarm.id);
        assert_eq!(
            dispatcher.dispatch(&OwnerId::new("u2"), &phrase),
            CommandReply::AlarmNotFound(alarm.id)
        );
    }

    #[test]
    fn out_of_range_time_is_reported() {
        let dispatcher = dispatcher();
        let reply = dispatcher.dispatch(&OwnerId::new("u1"), "set alarm 13 pm");
        assert!(matches!(reply, CommandReply::InvalidTime { .. }));
        assert!(reply.to_string().contains("between 1 and 12"));
    }
}
