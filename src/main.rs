//! fatwa-speaker-rs: grounded fatwa Q&A with answers read aloud.

mod api;
mod config;
mod conversation;
mod generation;
mod message;
mod speech;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conversation::{Conversation, UserQuery};
use generation::gemini::GeminiBackend;
use message::Message;
use speech::controller::{PlayOutcome, PlaybackSettings};
use speech::narrator::Narrator;
use speech::scheduler::AudioError;
use speech::synthesis::GeminiSpeechClient;

#[derive(Parser, Debug)]
#[command(name = "fatwa-speaker-rs", about = "Grounded fatwa Q&A with spoken answers")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read every answer aloud while it streams
    #[arg(short, long)]
    speak: bool,

    /// Serve the HTTP API only, without the interactive prompt
    #[arg(long)]
    no_repl: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP client internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,hyper_util=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,hyper_util=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fatwa-speaker-rs starting");

    let config = config::Config::load(args.config.as_deref());
    if config.api_key().is_empty() {
        warn!("No Gemini API key configured (set generation.api_key or GEMINI_API_KEY)");
    }
    info!(
        "Model: {}, history window: {} turn(s), retries: {}",
        config.generation.model, config.generation.history_turns, config.generation.max_retries
    );

    let backend = GeminiBackend::new(
        &config.generation.host,
        config.api_key(),
        Duration::from_secs(config.generation.request_timeout_secs),
    )?;
    let conversation = Arc::new(Conversation::new(
        config.generation.clone(),
        &config.conversation.intro_greeting,
        Arc::new(backend),
    ));

    let narrator = if config.speech.enabled {
        match GeminiSpeechClient::new(&config.speech, config.api_key()) {
            Ok(client) => {
                info!("Speech output enabled (voice: {})", config.speech.voice);
                Some(Arc::new(Narrator::new(
                    PlaybackSettings::from(&config.speech),
                    Arc::new(client),
                    speech::default_output(),
                )))
            }
            Err(e) => {
                warn!("Failed to build speech client: {e}");
                info!("Speech disabled, continuing without voice output");
                None
            }
        }
    } else {
        info!("Speech output disabled");
        None
    };

    let speak = (args.speak || config.speech.auto_play) && narrator.is_some();

    if config.api.enabled {
        let api_state = api::ApiState {
            conversation: conversation.clone(),
            narrator: narrator.clone(),
            auto_play: speak,
        };
        api::start_api(api_state, config.api.port).await;
    }

    if args.no_repl {
        info!("Serving API only, press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    } else {
        repl(&conversation, narrator.as_ref(), speak).await?;
    }

    if let Some(narrator) = &narrator {
        narrator.stop_all();
    }
    info!("fatwa-speaker-rs stopped");
    Ok(())
}

/// Interactive prompt: every line is a question, `/play`, `/stop` and `/quit`
/// are commands.
async fn repl(
    conversation: &Conversation,
    narrator: Option<&Arc<Narrator>>,
    speak: bool,
) -> std::io::Result<()> {
    for message in conversation.messages() {
        println!("{}\n", message.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/stop" => {
                if let Some(narrator) = narrator {
                    narrator.stop_all();
                }
            }
            "/play" => toggle_last(conversation, narrator),
            text => run_turn(conversation, narrator, speak, text).await?,
        }
    }
    Ok(())
}

/// Ask one question, printing the answer as it streams. With `speak`, the
/// answer body is read aloud while it grows. Ctrl-C cancels the turn.
async fn run_turn(
    conversation: &Conversation,
    narrator: Option<&Arc<Narrator>>,
    speak: bool,
    text: &str,
) -> std::io::Result<()> {
    let cancel = CancellationToken::new();
    let (spoken_tx, spoken_rx) = watch::channel(String::new());
    let mut playback: Option<JoinHandle<Result<PlayOutcome, AudioError>>> = None;
    let mut printed = 0usize;

    let message = {
        let turn = conversation.ask(UserQuery::text(text), cancel.clone(), |message| {
            print_delta(message, &mut printed);

            let Some(narrator) = narrator.filter(|_| speak && !message.failed) else {
                return;
            };
            spoken_tx.send_replace(message.parsed().spoken_text().to_string());
            if playback.is_none() {
                let narrator = narrator.clone();
                let (id, rx) = (message.id, spoken_rx.clone());
                playback = Some(tokio::spawn(async move { narrator.play_stream(id, rx).await }));
            }
        });
        tokio::pin!(turn);

        tokio::select! {
            message = &mut turn => message,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        }
    };
    drop(spoken_tx);
    println!();

    if cancel.is_cancelled() {
        println!("[cancelled]");
    }
    if message.failed || cancel.is_cancelled() {
        if let Some(narrator) = narrator {
            narrator.stop(message.id);
        }
    }
    print_footer(&message);

    if let Some(handle) = playback {
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(outcome)) => info!("Playback ended: {outcome:?}"),
                Ok(Err(e)) => warn!("Playback failed: {e}"),
                Err(e) => warn!("Playback task failed: {e}"),
            }
        });
    }
    Ok(())
}

/// Print whatever the snapshot added since the last one. A failure notice
/// replaces the content, so it is printed whole.
fn print_delta(message: &Message, printed: &mut usize) {
    let content = message.content.as_str();
    if message.failed {
        print!("\n{content}");
    } else if content.len() > *printed && content.is_char_boundary(*printed) {
        print!("{}", &content[*printed..]);
    }
    *printed = content.len();
    let _ = std::io::stdout().flush();
}

fn print_footer(message: &Message) {
    if let Some(id) = message.parsed().fatwa_id() {
        println!("[Fatwa ID: {id}]");
    }
    if !message.sources.is_empty() {
        println!("Sources:");
        for (i, source) in message.sources.iter().enumerate() {
            println!("  {}. {} <{}>", i + 1, source.title, source.uri);
        }
    }
    println!();
}

/// Toggle playback of the most recent answer.
fn toggle_last(conversation: &Conversation, narrator: Option<&Arc<Narrator>>) {
    let Some(narrator) = narrator.cloned() else {
        println!("Speech output is disabled.");
        return;
    };
    let Some(message) = conversation.last_answer() else {
        println!("Nothing to play yet.");
        return;
    };

    let text = message.parsed().spoken_text().to_string();
    tokio::spawn(async move {
        match narrator.toggle(message.id, &text).await {
            Ok(outcome) => info!("Playback ended: {outcome:?}"),
            Err(e) => warn!("Playback failed: {e}"),
        }
    });
}
