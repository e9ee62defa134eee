//! palaver CLI: turn relay server and terminal widget.
//!
//! ```text
//! palaver serve [--port 3000] [--host 127.0.0.1]     (OPENAI_API_KEY, ASSISTANT_ID)
//! palaver chat [--speak] [--server http://localhost:3000]
//! palaver talk [--server ...] [--kokoro-url http://localhost:8880]
//! palaver say "text" [--server ...] [--kokoro-url ...]
//! palaver new-thread / config [--server ...]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use palaver_lib::audio_store::EphemeralAudioStore;
use palaver_lib::capture::{VadConfig, record_utterance};
use palaver_lib::client::{DEFAULT_SERVER_URL, ServerSpeech, WidgetClient};
use palaver_lib::error::CaptureError;
use palaver_lib::local_voice::{DEFAULT_KOKORO_URL, KokoroConfig, KokoroVoice};
use palaver_lib::openai::{DEFAULT_BASE_URL, OpenAiClient, OpenAiConfig};
use palaver_lib::orchestrator::TurnOrchestrator;
use palaver_lib::palaver_core::types::{TurnConfig, VoiceParams, WidgetConfig};
use palaver_lib::playback::RodioPlayer;
use palaver_lib::server::{AppState, router};
use palaver_lib::speech::SpeechOutput;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// palaver: voice and text relay to a hosted assistant
#[derive(Parser)]
#[command(name = "palaver", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeArgs),
    /// Chat with the assistant from the terminal
    Chat {
        /// Speak each reply aloud
        #[arg(long)]
        speak: bool,
        #[command(flatten)]
        widget: WidgetArgs,
    },
    /// Voice conversation through the default microphone
    Talk {
        #[command(flatten)]
        widget: WidgetArgs,
    },
    /// Speak text through the relay's speech route
    Say {
        /// Text to speak
        text: String,
        #[command(flatten)]
        widget: WidgetArgs,
    },
    /// Create a new conversation thread and print its id
    NewThread {
        #[command(flatten)]
        widget: WidgetArgs,
    },
    /// Print the widget configuration served by the relay
    Config {
        #[command(flatten)]
        widget: WidgetArgs,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Listen port
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,
    /// Listen host
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,
    /// Provider API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,
    /// Assistant that answers every turn
    #[arg(long, env = "ASSISTANT_ID")]
    assistant_id: String,
    /// Provider API root
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    /// Spoken-language hint for transcription (ISO-639-1)
    #[arg(long, env = "WIDGET_LANGUAGE", default_value = "ru")]
    language: String,
    /// Delay between run status checks
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,
    /// Status checks before a run is abandoned
    #[arg(long, env = "MAX_POLL_ATTEMPTS", default_value = "30")]
    max_poll_attempts: u32,
    /// Replies up to this many characters prefer a local voice
    #[arg(long, env = "SHORT_FORM_THRESHOLD", default_value = "200")]
    short_form_threshold: usize,
    /// Directory for ephemeral audio files [default: system temp dir]
    #[arg(long, env = "TEMP_DIR")]
    temp_dir: Option<PathBuf>,
    /// Remote synthesis voice
    #[arg(long, env = "TTS_VOICE", default_value = "alloy")]
    tts_voice: String,
    #[arg(long, env = "WIDGET_TITLE")]
    title: Option<String>,
    #[arg(long, env = "WIDGET_WELCOME_MESSAGE")]
    welcome_message: Option<String>,
    #[arg(long, env = "WIDGET_PRIMARY_COLOR")]
    primary_color: Option<String>,
    #[arg(long, env = "WIDGET_POSITION")]
    position: Option<String>,
}

#[derive(Args)]
struct WidgetArgs {
    /// Relay URL
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    server: String,
    /// Local Kokoro TTS server URL
    #[arg(long, default_value = DEFAULT_KOKORO_URL)]
    kokoro_url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palaver=info,palaver_lib=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat { speak, widget } => chat(widget, speak).await,
        Command::Talk { widget } => talk(widget).await,
        Command::Say { text, widget } => say(widget, &text).await,
        Command::NewThread { widget } => new_thread(widget).await,
        Command::Config { widget } => show_config(widget).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("palaver: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> CliResult {
    let openai = OpenAiClient::new(
        OpenAiConfig::new(args.api_key, args.assistant_id).with_base_url(args.base_url),
    )?;

    let turn_config = TurnConfig {
        language: args.language.clone(),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        max_poll_attempts: args.max_poll_attempts,
        voice: VoiceParams {
            voice: args.tts_voice,
            ..Default::default()
        },
    };

    let defaults = WidgetConfig::default();
    let widget = WidgetConfig {
        title: args.title.unwrap_or(defaults.title),
        welcome_message: args.welcome_message.unwrap_or(defaults.welcome_message),
        primary_color: args.primary_color.unwrap_or(defaults.primary_color),
        position: args.position.unwrap_or(defaults.position),
        language: args.language,
        short_form_threshold: args.short_form_threshold,
    };

    let temp_dir = args
        .temp_dir
        .unwrap_or_else(|| std::env::temp_dir().join("palaver"));
    let store = EphemeralAudioStore::new(&temp_dir)?;

    let orchestrator = Arc::new(TurnOrchestrator::new(Arc::new(openai), store, turn_config));
    let app = router(AppState::new(orchestrator.clone(), widget));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("palaver listening on {addr}, audio in {}", temp_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            orchestrator.shutdown();
        })
        .await?;
    Ok(())
}

async fn chat(widget: WidgetArgs, speak: bool) -> CliResult {
    let client = WidgetClient::new(&widget.server);
    let output = if speak {
        Some(speech_output(&client, &widget.kokoro_url).await?)
    } else {
        None
    };

    eprintln!("type a message, /new for a fresh thread, ctrl-d to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/new" => {
                client.reset_thread();
                eprintln!("(new conversation)");
                continue;
            }
            _ => {}
        }

        match client.send_text(line).await {
            Ok(turn) => {
                println!("{}", turn.message);
                if let Some(output) = &output {
                    if let Err(e) = output.speak(&turn.message, None).await {
                        warn!("could not speak reply: {e}");
                    }
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

async fn talk(widget: WidgetArgs) -> CliResult {
    let client = WidgetClient::new(&widget.server);
    let output = speech_output(&client, &widget.kokoro_url).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        on_interrupt.cancel();
    });

    eprintln!("listening; ctrl-c to stop");
    loop {
        let wav = match record_utterance(VadConfig::default(), &cancel).await {
            Ok(Some(wav)) => wav,
            Ok(None) => {
                eprintln!("(no speech heard)");
                break;
            }
            Err(CaptureError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        };

        let reply = match client.send_voice(&wav).await {
            Ok(reply) => reply,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };
        println!("> {}", reply.transcription);
        println!("{}", reply.message);

        tokio::select! {
            _ = cancel.cancelled() => {
                output.stop();
                break;
            }
            spoken = output.speak(&reply.message, reply.audio) => {
                if let Err(e) = spoken {
                    warn!("could not speak reply: {e}");
                }
            }
        }
    }
    Ok(())
}

async fn say(widget: WidgetArgs, text: &str) -> CliResult {
    let client = WidgetClient::new(&widget.server);
    let output = speech_output(&client, &widget.kokoro_url).await?;
    let route = output.speak(text, None).await?;
    info!("spoken via {route:?}");
    Ok(())
}

async fn new_thread(widget: WidgetArgs) -> CliResult {
    let thread = WidgetClient::new(&widget.server).new_thread().await?;
    println!("{thread}");
    Ok(())
}

async fn show_config(widget: WidgetArgs) -> CliResult {
    let config = WidgetClient::new(&widget.server).config().await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Speaker wired to the relay, with Kokoro as the local voice. The short-form
/// threshold comes from the relay's widget config.
async fn speech_output(
    client: &WidgetClient,
    kokoro_url: &str,
) -> Result<SpeechOutput, Box<dyn std::error::Error>> {
    let threshold = match client.config().await {
        Ok(config) => config.short_form_threshold,
        Err(e) => {
            warn!("relay config unavailable, using defaults: {e}");
            WidgetConfig::default().short_form_threshold
        }
    };

    let local = KokoroVoice::new(KokoroConfig {
        url: kokoro_url.to_string(),
        ..Default::default()
    });

    Ok(SpeechOutput::new(
        Arc::new(RodioPlayer::new()?),
        Arc::new(ServerSpeech::new(client.clone())),
    )
    .with_local(Arc::new(local))
    .with_short_form_threshold(threshold))
}
