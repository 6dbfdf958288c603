mod alarm;
mod api;
mod diagnostics;
mod logging;
mod session;
mod voice;

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use tracing::info;

use crate::alarm::engine::{AlarmEngine, EngineConfig};
use crate::alarm::model::OwnerId;
use crate::alarm::ring::ConsoleRingNotifier;
use crate::alarm::store::{AlarmStore, JsonFileAlarmStore, MemoryAlarmStore};
use crate::alarm::time::LocalClock;
use crate::api::{ApiContext, ApiServer, ApiServerConfig};
use crate::session::OwnerSessionTracker;
use crate::voice::command::{CommandDispatcher, CommandParser};
use crate::voice::extractor::PatternTimeExtractor;
use crate::voice::listener::{LineCommandSource, VoiceConfig, VoiceListener};

#[derive(Parser, Debug)]
#[command(
    name = "voicealarm",
    version,
    about = "Voice-controlled alarm scheduler with a local HTTP API"
)]
struct Cli {
    /// JSON file holding alarms across restarts.
    #[arg(long, default_value = "alarms.json")]
    store: PathBuf,

    /// Keep alarms in memory only.
    #[arg(long)]
    memory_store: bool,

    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = 5000)]
    api_port: u16,

    #[arg(long)]
    no_api: bool,

    /// Read voice commands as lines from stdin.
    #[arg(long)]
    voice_stdin: bool,

    /// Log this owner in at startup.
    #[arg(long)]
    owner: Option<String>,

    #[arg(long, default_value_t = 3)]
    fire_retry_attempts: u32,

    #[arg(long, default_value_t = 250)]
    fire_retry_backoff_ms: u64,

    /// Ring the terminal bell when an alarm fires.
    #[arg(long)]
    bell: bool,

    /// Print a store summary and exit.
    #[arg(long)]
    diagnostics: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if cli.fire_retry_attempts == 0 {
        bail!("--fire-retry-attempts must be greater than zero");
    }

    if cli.diagnostics {
        let (label, alarms) = if cli.memory_store {
            ("memory".to_string(), Vec::new())
        } else {
            let store = open_file_store(&cli.store)?;
            (store.path().display().to_string(), store.snapshot())
        };
        return diagnostics::run_diagnostics(&label, &alarms, Local::now().naive_local());
    }

    let store: Arc<dyn AlarmStore> = if cli.memory_store {
        Arc::new(MemoryAlarmStore::new())
    } else {
        Arc::new(open_file_store(&cli.store)?)
    };
    let engine = AlarmEngine::new(
        store,
        Arc::new(ConsoleRingNotifier { bell: cli.bell }),
        Arc::new(LocalClock),
        EngineConfig {
            fire_retry_attempts: cli.fire_retry_attempts,
            fire_retry_backoff: Duration::from_millis(cli.fire_retry_backoff_ms),
        },
    );
    engine.restore().context("failed to re-arm stored alarms")?;

    let sessions = Arc::new(OwnerSessionTracker::new());
    if let Some(owner) = cli.owner.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
        sessions.login(OwnerId::new(owner));
    }

    let api_server = if cli.no_api {
        None
    } else {
        let server = ApiServer::start(
            ApiServerConfig {
                bind_addr: cli.api_bind.clone(),
                port: cli.api_port,
            },
            ApiContext {
                engine: engine.clone(),
                sessions: Arc::clone(&sessions),
            },
        )
        .with_context(|| {
            format!(
                "failed to start local API at {}:{}",
                cli.api_bind, cli.api_port
            )
        })?;
        if let Some(addr) = server.local_addr() {
            println!("Local API listening on http://{addr}");
        }
        Some(server)
    };

    if !cli.voice_stdin {
        info!("running until interrupted");
        loop {
            thread::park();
        }
    }

    let extractor =
        PatternTimeExtractor::new().context("failed to compile time extraction patterns")?;
    let parser = CommandParser::new(Arc::new(extractor))
        .context("failed to compile voice command patterns")?;
    let listener = VoiceListener::spawn(
        LineCommandSource::new(BufReader::new(io::stdin())),
        CommandDispatcher::new(engine.clone(), parser),
        sessions,
        VoiceConfig::default(),
        |owner_id, reply| println!("[{owner_id}] {reply}"),
    )?;
    listener.join();

    engine.shutdown();
    drop(api_server);
    Ok(())
}

fn open_file_store(path: &Path) -> Result<JsonFileAlarmStore> {
    JsonFileAlarmStore::open(path).with_context(|| format!("failed to load {}", path.display()))
}
