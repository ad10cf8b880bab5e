use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatdesk::api::ApiServerBuilder;
use chatdesk::cache::{Clock, SynthesisCache, SystemClock, TranscriptionCache};
use chatdesk::channels::WhatsAppChannel;
use chatdesk::db::{self, CommandRepo, SystemConfigRepo};
use chatdesk::engine::{OpenAiCompatibleGenerator, ResponseEngine};
use chatdesk::schedule::GateStatus;
use chatdesk::speech::SpeechBridge;
use chatdesk::{Config, Orchestrator, PipelineSettings};

/// Chatdesk - automated and operator-assisted customer conversations over WhatsApp
#[derive(Parser)]
#[command(name = "chatdesk", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "CHATDESK_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook and operator HTTP server (default)
    Serve,
    /// Remove expired synthesis cache files
    PurgeCache,
    /// Show whether the business is open right now
    Hours,
    /// Write a runtime setting
    SetConfig {
        /// Setting key (e.g. `ai_enabled`, `schedule`)
        key: String,
        /// New value
        value: String,
    },
    /// Create or replace a command reply
    AddCommand {
        /// Trigger text including the prefix (e.g. `/horario`)
        trigger: String,
        /// Canned response
        response: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,chatdesk=info",
        1 => "info,chatdesk=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::PurgeCache => purge_cache(&config),
        Command::Hours => hours(&config),
        Command::SetConfig { key, value } => set_config(&config, &key, &value),
        Command::AddCommand { trigger, response } => add_command(&config, &trigger, &response),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.api_server.port,
        db = %config.db_path.display(),
        "starting chatdesk"
    );

    let pool = db::init(&config.db_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let generator = OpenAiCompatibleGenerator::new(
        &config.generation.base_url,
        config.generation.api_key.clone(),
        config.backend_timeout,
    )?;
    let engine = Arc::new(ResponseEngine::new(
        Arc::new(generator),
        config.generation.default_model.clone(),
        config.backend_timeout,
    ));
    let channel = Arc::new(WhatsAppChannel::from_config(&config.whatsapp, config.backend_timeout)?);

    let speech = match build_speech(&config, &clock) {
        Ok(speech) => Some(Arc::new(speech)),
        Err(e) => {
            tracing::warn!(error = %e, "speech unavailable, voice notes will get the fallback reply");
            None
        }
    };

    let mut orchestrator = Orchestrator::new(pool.clone(), engine, channel, clock)
        .with_send_timeout(config.backend_timeout);
    if let Some(speech) = &speech {
        orchestrator = orchestrator.with_speech(speech.clone());
    }

    let mut builder = ApiServerBuilder::new(pool, Arc::new(orchestrator), config.api_server.port)
        .api_key(config.api_server.api_key.clone())
        .verify_token(config.whatsapp.verify_token.clone())
        .app_secret(config.whatsapp.app_secret.clone());
    if let Some(speech) = speech {
        builder = builder.speech(speech, config.cache.purge_interval);
    }

    let server = builder.build().spawn();

    tokio::select! {
        result = server => result??,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

fn build_speech(config: &Config, clock: &Arc<dyn Clock>) -> chatdesk::Result<SpeechBridge> {
    let transcription_cache = TranscriptionCache::new(
        config.cache.transcription_capacity,
        config.cache.transcription_ttl,
        clock.clone(),
    );
    let synthesis_cache = synthesis_cache(config, clock.clone())?;
    SpeechBridge::from_config(config, transcription_cache, synthesis_cache)
}

fn synthesis_cache(config: &Config, clock: Arc<dyn Clock>) -> chatdesk::Result<SynthesisCache> {
    SynthesisCache::new(&config.cache.synthesis_dir, config.cache.synthesis_ttl, clock)
}

fn purge_cache(config: &Config) -> anyhow::Result<()> {
    let cache = synthesis_cache(config, Arc::new(SystemClock))?;
    let removed = cache.purge_expired()?;
    println!("Removed {removed} expired file(s) from {}", cache.dir().display());
    Ok(())
}

fn hours(config: &Config) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let settings = PipelineSettings::load(&SystemConfigRepo::new(pool))?;

    match settings.schedule_gate().evaluate(Utc::now()) {
        GateStatus::Open => println!("Open"),
        GateStatus::ClosingSoon { minutes_remaining, .. } => {
            println!("Open, closing in {minutes_remaining} minute(s)");
        }
        GateStatus::Closed { message } => println!("Closed: {message}"),
    }
    Ok(())
}

fn set_config(config: &Config, key: &str, value: &str) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let repo = SystemConfigRepo::new(pool);
    repo.set(key, value, Utc::now())?;

    // Re-reading surfaces a bad value as a warning right away
    let _ = PipelineSettings::load(&repo)?;
    println!("Set {key}");
    Ok(())
}

fn add_command(config: &Config, trigger: &str, response: &str) -> anyhow::Result<()> {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        anyhow::bail!("trigger must not be empty");
    }

    let pool = db::init(&config.db_path)?;
    CommandRepo::new(pool).upsert(trigger, response, Utc::now())?;
    println!("Command {trigger} saved");
    Ok(())
}
