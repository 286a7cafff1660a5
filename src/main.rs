use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voice_pipeline::voice::{
    CaptureCallbacks, DeviceMicrophone, DeviceSink, HttpSynthesizer, HttpTranscriber,
    SpeechCapture, SpeechQueue,
};
use voice_pipeline::Config;

/// voicepipe - speak assistant text and transcribe the microphone
#[derive(Parser)]
#[command(name = "voicepipe", version, about)]
struct Cli {
    /// Speech service base URL
    #[arg(long, env = "VOICEPIPE_API_URL")]
    api_url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Speak each text in order
    Speak {
        /// Texts to speak
        #[arg(required = true)]
        texts: Vec<String>,

        /// Volume (0.0 to 1.0)
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Record the microphone and print the transcript
    Listen {
        /// Recording duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Print partial transcripts while recording
        #[arg(long)]
        stream: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_pipeline=info",
        1 => "info,voice_pipeline=debug",
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
    if let Some(url) = cli.api_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Speak { texts, volume } => speak(&config, texts, volume).await,
        Command::Listen { duration, stream } => listen(config, duration, stream).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Queue every text and wait for the queue to drain
async fn speak(config: &Config, texts: Vec<String>, volume: Option<f32>) -> anyhow::Result<()> {
    let synthesizer = Arc::new(HttpSynthesizer::new(config.base_url.clone()));
    let sink = Arc::new(DeviceSink::new()?);
    let queue = SpeechQueue::new(synthesizer, sink, config.playback.clone());

    if let Some(volume) = volume {
        queue.set_volume(volume);
    }

    for text in texts {
        queue.submit(text);
    }

    tokio::select! {
        () = queue.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            queue.stop();
        }
    }

    Ok(())
}

/// Record for `duration` seconds and print the transcript
async fn listen(mut config: Config, duration: u64, stream: bool) -> anyhow::Result<()> {
    config.capture.streaming |= stream;

    let callbacks = CaptureCallbacks::default()
        .on_partial(|text| println!("… {text}"))
        .on_error(|e| eprintln!("error: {e}"));

    let capture = SpeechCapture::new(
        Arc::new(DeviceMicrophone::new()),
        Arc::new(HttpTranscriber::new(config.base_url.clone())),
        config.capture.clone(),
    )
    .with_callbacks(callbacks);

    capture.start().await?;
    println!("Recording for {duration} seconds, speak now...");

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    let transcript = capture.stop().await?;
    if transcript.is_empty() {
        println!("(no speech detected)");
    } else {
        println!("{transcript}");
    }

    Ok(())
}
