//! Speech Loop Demo
//!
//! Drives a `SpeechLoop` against the scripted engine. Lines typed on stdin
//! are spoken, and keyword detections and recognitions can be injected to
//! walk the listen loop through its states.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use speech_loop::devices::{resolve_input_device, resolve_output_device};
use speech_loop::mock::{MockAudio, MockEngine, SynthesisMode};
use speech_loop::{
    load_config_file, load_subscription_key, AudioBackend, DeviceKind, Recognition, RequestId,
    SpeechCallback, SpeechHandle, SpeechLoop,
};

#[derive(Parser, Debug)]
#[command(
    name = "speech-loop-demo",
    version,
    about = "Keyword-gated speech loop demo",
    disable_help_subcommand = true
)]
struct Cli {
    /// Capture from real devices through cpal (needs the `audio` feature)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    real_audio: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the loop and control it from stdin
    Run {
        /// YAML configuration file
        #[arg(long)]
        config: PathBuf,
        /// Simulated playback time per character, in milliseconds
        #[arg(long, default_value_t = 40)]
        ms_per_char: u64,
    },
    /// List audio devices
    Devices {
        /// Print JSON instead of a table
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Validate a configuration file, its credential and its devices
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Speak(&'a str),
    Interrupt(&'a str),
    Skip,
    Wake(&'a str),
    Hear(&'a str),
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(text) = line.strip_prefix('!') {
        return Some(Command::Interrupt(text.trim()));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Speak(line));
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    Some(match name {
        "skip" => Command::Skip,
        "wake" => Command::Wake(if arg.is_empty() { "computer" } else { arg }),
        "hear" => Command::Hear(arg),
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name),
    })
}

/// Prints events and answers every utterance.
struct ConsoleCallback;

impl SpeechCallback for ConsoleCallback {
    fn on_keyword_recognized(&self, keyword: &str, _speech: &SpeechHandle) {
        println!("🔔 keyword: {keyword}");
    }

    fn on_text_recognized(&self, text: &str, speech: &SpeechHandle) {
        println!("👂 heard: {text}");
        speech.enqueue(format!("You said: {text}"), false);
    }

    fn on_synthesis_done(&self, request_id: RequestId, success: bool) {
        if success {
            println!("🔊 done: {request_id}");
        } else {
            println!("🔇 cancelled: {request_id}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let audio = audio_backend(cli.real_audio)?;

    match cli.command {
        Commands::Run {
            config,
            ms_per_char,
        } => run(&config, ms_per_char, audio).await,
        Commands::Devices { json } => list_devices(audio.as_ref(), json),
        Commands::CheckConfig { config } => check_config(&config, audio.as_ref()),
    }
}

#[cfg(feature = "audio")]
fn audio_backend(real_audio: bool) -> Result<Arc<dyn AudioBackend>> {
    if real_audio {
        Ok(Arc::new(speech_loop::mic::CpalBackend::new()))
    } else {
        Ok(Arc::new(MockAudio::new()))
    }
}

#[cfg(not(feature = "audio"))]
fn audio_backend(real_audio: bool) -> Result<Arc<dyn AudioBackend>> {
    if real_audio {
        anyhow::bail!("--real-audio requires building with the `audio` feature");
    }
    Ok(Arc::new(MockAudio::new()))
}

async fn run(config_path: &Path, ms_per_char: u64, audio: Arc<dyn AudioBackend>) -> Result<()> {
    let config = load_config_file(config_path)?;
    let engine = MockEngine::new();
    engine.set_synthesis_mode(SynthesisMode::Paced(Duration::from_millis(ms_per_char)));

    let speech = Arc::new(SpeechLoop::new(
        config,
        Arc::new(engine.clone()),
        audio,
        Arc::new(ConsoleCallback),
    ));
    speech.start().context("starting speech loop")?;
    println!("Type a line to speak it, !line to interrupt with it.");
    println!("Commands: /skip, /wake [keyword], /hear <text>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    None => {}
                    Some(Command::Quit) => break,
                    Some(command) => apply(command, &speech, &engine),
                }
            }
        }
    }

    speech.stop();
    let joining = Arc::clone(&speech);
    tokio::task::spawn_blocking(move || joining.join())
        .await
        .context("joining speech loop")??;
    info!("speech loop stopped");
    Ok(())
}

fn apply(command: Command<'_>, speech: &SpeechLoop, engine: &MockEngine) {
    match command {
        Command::Speak(text) => {
            let id = speech.enqueue(text, false);
            println!("📝 queued {id}");
        }
        Command::Interrupt(text) => {
            let id = speech.enqueue(text, true);
            println!("⏭️  playing next {id}");
        }
        Command::Skip => speech.skip_keyword_wait(),
        Command::Wake(keyword) => {
            if !engine.trigger_keyword(keyword) {
                warn!("no keyword listen is active");
            }
        }
        Command::Hear(text) => {
            let result = if text.is_empty() {
                Recognition::NoMatch
            } else {
                Recognition::Speech(text.to_string())
            };
            engine.push_recognition(result);
        }
        Command::Unknown(name) => println!("unknown command /{name}"),
        Command::Quit => {}
    }
}

fn list_devices(audio: &dyn AudioBackend, json: bool) -> Result<()> {
    let devices = audio.devices()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    println!("{:>3}  {:>3}  {:>3}  name", "idx", "in", "out");
    for d in &devices {
        println!(
            "{:>3}  {:>3}  {:>3}  {}",
            d.index, d.max_input_channels, d.max_output_channels, d.name
        );
    }
    Ok(())
}

fn check_config(path: &Path, audio: &dyn AudioBackend) -> Result<()> {
    let config = load_config_file(path)?;
    println!("✅ {} is valid", path.display());

    load_subscription_key(&config.key_env_var)?;
    println!("✅ speech service key present");

    let devices = audio.devices()?;
    let microphone = resolve_input_device(&devices, &config.microphone)?;
    println!("✅ {} device: [{}] {}", DeviceKind::Input, microphone.index, microphone.name);
    let speaker = resolve_output_device(&devices, &config.speaker)?;
    println!("✅ {} device: {}", DeviceKind::Output, speaker);
    Ok(())
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
