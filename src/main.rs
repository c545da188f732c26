#![deny(clippy::all)]

mod app;
mod audio;
mod chat;
mod config;
mod conversation;
mod error;
mod playback;
mod session;
mod sse;
mod voice;

use anyhow::Context;
use app::ChatSession;
use audio::CpalCaptureDevice;
use chat::backend::HttpChatBackend;
use chat::ChatCoordinator;
use conversation::{ConversationEvent, Role, TranscriptAccumulator};
use playback::SystemPlayer;
use session::HistoryClearScheduler;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use voice::upload::HttpSpeechBackend;
use voice::{PendingInput, VoiceCoordinator, VoiceTiming};

const HELP: &str = "\
Type a message and press enter to send it.
  /mic      start or stop dictation
  /send     send the dictated input
  /input    show the pending input
  /stop     stop the streaming reply
  /status   show what the session is doing
  /history  print the conversation
  /clear    clear the conversation
  /config   show the endpoints in use
  /quit     exit";

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

/// Print the conversation as it changes
fn spawn_renderer(transcript: TranscriptAccumulator) -> JoinHandle<()> {
    let mut events = transcript.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render(&transcript, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer fell behind the conversation");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn render(transcript: &TranscriptAccumulator, event: ConversationEvent) {
    match event {
        ConversationEvent::Appended { id } => {
            let message =
                transcript.read(|c| c.messages().iter().find(|m| m.id == id).cloned());
            let Some(message) = message else {
                return;
            };
            match message.role {
                Role::User => {}
                Role::Assistant => {
                    print!("{}> {}", message.role.label(), message.content);
                    flush_stdout();
                }
                Role::Tool => {
                    let name = message
                        .meta
                        .as_ref()
                        .map(|m| m.tool_name.as_str())
                        .unwrap_or("tool");
                    println!("\n[{}]\n{}", name, message.content);
                }
            }
        }
        ConversationEvent::ContentAppended { chunk, .. } => {
            print!("{}", chunk);
            flush_stdout();
        }
        ConversationEvent::Finalized { .. } => println!(),
        ConversationEvent::Cleared => println!("-- conversation cleared --"),
    }
}

fn print_history(session: &ChatSession) {
    for message in session.transcript().snapshot() {
        let label = match &message.meta {
            Some(meta) => match &meta.tool_call_id {
                Some(call_id) => format!("{} {} ({})", message.role.label(), meta.tool_name, call_id),
                None => format!("{} {}", message.role.label(), meta.tool_name),
            },
            None => message.role.label().to_string(),
        };
        println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M:%S"),
            label,
            message.content
        );
    }
}

fn spawn_submit(session: &ChatSession) {
    let session = session.clone();
    tokio::spawn(async move {
        match session.submit().await {
            Ok(true) => {
                if let Some(e) = session.chat().last_error() {
                    println!("error: {}", e);
                }
            }
            Ok(false) => println!("(nothing to send)"),
            Err(e) => println!("error: {}", e),
        }
    });
}

fn spawn_toggle_recording(session: &ChatSession) {
    let session = session.clone();
    tokio::spawn(async move {
        match session.toggle_recording().await {
            Ok(true) => println!("(listening, /mic again to stop)"),
            Ok(false) => println!("input: {}", session.input().get()),
            Err(e) => println!("microphone: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays the conversation
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let settings = config::settings().context("Failed to load settings")?;
    info!(api = settings.api.base(), "Settings loaded");

    let transcript = TranscriptAccumulator::new();
    let input = PendingInput::default();

    let chat = ChatCoordinator::new(
        transcript.clone(),
        Arc::new(HttpChatBackend::new(settings.api.chat_url())?),
        Arc::new(SystemPlayer::new()?),
        HistoryClearScheduler::new(transcript.clone(), settings.history_clear_delay),
        settings.log_events,
    );
    let voice = VoiceCoordinator::new(
        Arc::new(CpalCaptureDevice),
        Arc::new(HttpSpeechBackend::new(settings.api.speech_url())?),
        input.clone(),
        chat.streaming(),
        VoiceTiming {
            flush_interval: settings.flush_interval,
            finalize_poll: settings.finalize_poll,
        },
    );
    let session = ChatSession::new(transcript.clone(), chat, voice, input);
    let renderer = spawn_renderer(transcript);

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/mic" => spawn_toggle_recording(&session),
            "/send" => spawn_submit(&session),
            "/input" => {
                println!("input: {}", session.input().get());
                let live = session.voice().live_transcript();
                if !live.is_empty() {
                    println!("heard: {}", live);
                }
                if session.can_send() {
                    println!("(/send to send it)");
                }
            }
            "/stop" => session.stop_streaming(),
            "/status" => {
                println!("{}", session.status());
                if let Some(e) = session.chat().last_error() {
                    println!("last error: {}", e);
                }
                if let Some(e) = session.voice().recorder_error() {
                    println!("microphone error: {}", e);
                }
            }
            "/history" => print_history(&session),
            "/clear" => session.transcript().clear(),
            "/config" => {
                println!("chat:   {}", settings.api.chat_url());
                println!("speech: {}", settings.api.speech_url());
                println!("socket: {}", settings.api.ws_url("/speech/stream"));
            }
            command if command.starts_with('/') => {
                println!("unknown command {}, try /help", command)
            }
            text => {
                if session.voice().is_capturing() {
                    println!("(stop dictation with /mic before typing)");
                    continue;
                }
                session.input().set(text);
                spawn_submit(&session);
            }
        }
    }

    session.shutdown();
    renderer.abort();
    info!("Goodbye");
    Ok(())
}
