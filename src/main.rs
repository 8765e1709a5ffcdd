use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use companion_relay::api::{ApiServer, ApiState};
use companion_relay::device::{DeviceConfigService, DeviceDirectory, StaticDeviceDirectory};
use companion_relay::dialogue::RealtimeConnector;
use companion_relay::session::SessionServices;
use companion_relay::voice::{FishAudioTts, SynthesisRequest, Synthesizer};
use companion_relay::Config;

/// Companion relay - voice device bridge to realtime dialogue and speech synthesis
#[derive(Parser)]
#[command(name = "companion-relay", version, about)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Config file (defaults to ~/.config/companion-relay/config.toml)
    #[arg(long, env = "COMPANION_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize text to a raw PCM file
    TestTts {
        /// Text to speak
        #[arg(default_value = "こんにちは。きょうもいっしょにおはなししようね。")]
        text: String,
        /// Voice id (defaults to the configured default voice)
        #[arg(long)]
        voice: Option<String>,
        /// Output file
        #[arg(short, long, default_value = "tts-test.pcm")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,companion_relay=info",
        1 => "info,companion_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let synthesizer = Arc::new(FishAudioTts::new(
        config.api_keys.fish.clone().context("FISH_API_KEY is not set")?,
        config.synthesis.fish.clone(),
    )?);

    if let Some(Command::TestTts { text, voice, out }) = cli.command {
        let voice = voice.unwrap_or_else(|| config.devices.defaults.voice_id.clone());
        return test_tts(synthesizer.as_ref(), text, voice, &out).await;
    }

    let connector = Arc::new(RealtimeConnector::new(
        config.realtime.endpoint.clone(),
        config.api_keys.openai.clone().context("OPENAI_API_KEY is not set")?,
    )?);

    let directory: Arc<dyn DeviceDirectory> = match &config.devices.file {
        Some(path) => Arc::new(StaticDeviceDirectory::load(path)?),
        None => Arc::new(StaticDeviceDirectory::new()),
    };
    let devices = DeviceConfigService::new(
        directory,
        config.devices.defaults.clone(),
        config.devices.cache_ttl,
    );

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        policy = ?config.synthesis.queue.policy,
        model = %config.realtime.endpoint.model,
        "starting companion relay"
    );

    let host = config.server.host.clone();
    let port = config.server.port;
    let services = SessionServices {
        config: Arc::new(config),
        connector,
        synthesizer,
    };

    let server = ApiServer::new(ApiState::new(services, devices), host, port);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

async fn test_tts(
    synthesizer: &dyn Synthesizer,
    text: String,
    voice_id: String,
    out: &std::path::Path,
) -> anyhow::Result<()> {
    println!("Synthesizing: {text}");

    let mut stream = synthesizer
        .open(&SynthesisRequest { text, voice_id })
        .await
        .context("synthesis request failed")?;

    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;

    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("synthesis stream failed")?;
        total += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    println!("Wrote {total} bytes of PCM to {}", out.display());
    Ok(())
}
