use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::alarm::model::OwnerId;
use crate::session::OwnerResolver;
use crate::voice::command::{CommandDispatcher, CommandReply};

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Sleep between checks while nobody is logged in.
    pub idle_poll: Duration,
    pub pause_between: Duration,
    pub max_consecutive_errors: u32,
    pub error_cooldown: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(2),
            pause_between: Duration::from_millis(500),
            max_consecutive_errors: 5,
            error_cooldown: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heard {
    Phrase(String),
    /// Nothing intelligible this round.
    Silence,
    /// The source will never produce anything again.
    Closed,
}

/// Speech-to-text output, one utterance per call.
pub trait CommandSource: Send {
    fn listen(&mut self) -> Result<Heard>;
}

/// Treats each line of a reader as one recognised utterance.
pub struct LineCommandSource<R> {
    reader: R,
}

impl<R: BufRead + Send> LineCommandSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead + Send> CommandSource for LineCommandSource<R> {
    fn listen(&mut self) -> Result<Heard> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .context("failed to read voice command line")?;
        if read == 0 {
            return Ok(Heard::Closed);
        }
        let phrase = line.trim();
        if phrase.is_empty() {
            Ok(Heard::Silence)
        } else {
            Ok(Heard::Phrase(phrase.to_string()))
        }
    }
}

/// Background loop feeding recognised phrases to a [`CommandDispatcher`].
///
/// `stop` is honoured between utterances; a source blocked in `listen` is not
/// interrupted.
pub struct VoiceListener {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl VoiceListener {
    pub fn spawn<S, F>(
        source: S,
        dispatcher: CommandDispatcher,
        resolver: Arc<dyn OwnerResolver>,
        config: VoiceConfig,
        on_reply: F,
    ) -> Result<Self>
    where
        S: CommandSource + 'static,
        F: FnMut(&OwnerId, &CommandReply) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("voice-listener".to_string())
            .spawn(move || {
                run_listener_loop(source, dispatcher, resolver, config, on_reply, stop_for_thread)
            })
            .context("failed to spawn voice listener thread")?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    #[cfg(test)]
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Waits for the loop to end, either on a stop request or because the
    /// source closed.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for VoiceListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run_listener_loop<S, F>(
    mut source: S,
    dispatcher: CommandDispatcher,
    resolver: Arc<dyn OwnerResolver>,
    config: VoiceConfig,
    mut on_reply: F,
    stop: Arc<AtomicBool>,
) where
    S: CommandSource,
    F: FnMut(&OwnerId, &CommandReply),
{
    info!("voice listener started");
    let mut consecutive_errors = 0_u32;
    while !stop.load(Ordering::Relaxed) {
        let Some(owner_id) = resolver.resolve() else {
            debug!("no active owner; skipping voice input");
            nap(&stop, config.idle_poll);
            continue;
        };

        match source.listen() {
            Ok(Heard::Phrase(phrase)) => {
                consecutive_errors = 0;
                debug!(owner_id = %owner_id, phrase = %phrase, "voice command heard");
                let reply = dispatcher.dispatch(&owner_id, &phrase);
                on_reply(&owner_id, &reply);
            }
            Ok(Heard::Silence) => consecutive_errors += 1,
            Ok(Heard::Closed) => {
                info!("voice source closed");
                break;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "voice source failed");
                consecutive_errors += 1;
            }
        }

        if consecutive_errors >= config.max_consecutive_errors.max(1) {
            warn!(
                errors = consecutive_errors,
                "too many consecutive voice errors; cooling down"
            );
            consecutive_errors = 0;
            nap(&stop, config.error_cooldown);
        }
        nap(&stop, config.pause_between);
    }
    info!("voice listener stopped");
}

/// Sleeps for `duration`, waking early once `stop` is set.
fn nap(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
