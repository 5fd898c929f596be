use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use clap::Parser;
use client_core::{
    config::load_settings,
    media::{
        CaptureDevice, CaptureRequest, CaptureStream, DeviceError, MissingCaptureDevice,
    },
    read_attachment,
    reconciler::{EntryBody, TranscriptEntry},
    signal::CallType,
    ClientEvent, SignalingClient,
};
use shared::domain::{Direction, Seconds, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Handle to log in as.
    #[arg(long)]
    user: String,
    /// Overrides `server_url` from client.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Pretend a camera and microphone are attached.
    #[arg(long, default_value_t = false)]
    simulate_capture: bool,
}

/// Hands out synthetic streams so calls reach a media presentation without
/// hardware.
#[derive(Default)]
struct SimulatedCaptureDevice {
    next_id: AtomicU64,
}

#[async_trait]
impl CaptureDevice for SimulatedCaptureDevice {
    async fn acquire_capture(&self, request: CaptureRequest) -> Result<CaptureStream, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(id, audio = request.audio, video = request.video, "capture: simulated stream");
        Ok(CaptureStream::new(id, request))
    }

    async fn release_capture(&self, stream: CaptureStream) {
        info!(id = stream.id, "capture: simulated stream released");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url.trim_end_matches('/').to_string();
    }
    let device: Arc<dyn CaptureDevice> = if args.simulate_capture {
        Arc::new(SimulatedCaptureDevice::default())
    } else {
        Arc::new(MissingCaptureDevice)
    };

    let client = SignalingClient::connect(&args.user, device, settings).await?;
    println!("Logged in as {} (type /help for commands)", client.user());

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ui: event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    client.start_polling().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&client, line).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => println!("! {err}"),
        }
    }

    client.stop().await;
    client.flush_outbound().await;
    Ok(())
}

/// Returns `Ok(true)` when the user asked to quit.
async fn run_command(client: &Arc<SignalingClient>, line: &str) -> Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "/quit" => return Ok(true),
        "/help" => print_help(),
        "/open" => {
            let counterpart = UserId::new(rest);
            if counterpart.is_empty() {
                println!("usage: /open <user>");
            } else {
                client.select_counterpart(counterpart.clone()).await;
                println!("-- conversation with {counterpart}");
                client.poll_once().await?;
            }
        }
        "/call" => {
            let call_type = match rest {
                "video" => CallType::Video,
                "" | "voice" => CallType::Voice,
                other => {
                    println!("unknown call type '{other}'");
                    return Ok(false);
                }
            };
            client.place_call(call_type).await?;
        }
        "/accept" => client.accept_call().await?,
        "/hangup" => client.hang_up().await?,
        "/mute" => client.toggle_mute().await?,
        "/cam" => client.toggle_camera().await?,
        "/attach" => {
            let (path, caption) = match rest.split_once(' ') {
                Some((path, caption)) => (path, caption.trim()),
                None => (rest, ""),
            };
            if path.is_empty() {
                println!("usage: /attach <path> [caption]");
            } else {
                let attachment = read_attachment(Path::new(path)).await?;
                client.send_rich(caption, vec![attachment]).await?;
            }
        }
        _ if command.starts_with('/') => println!("unknown command {command}"),
        _ => client.send_text(line).await?,
    }
    Ok(false)
}

fn print_help() {
    println!("/open <user>            switch conversation");
    println!("/call [voice|video]     place a call");
    println!("/accept | /hangup       answer or end the call");
    println!("/mute | /cam            toggle microphone or camera");
    println!("/attach <path> [text]   send a file");
    println!("/quit");
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::TranscriptUpdated {
            counterpart,
            entries,
        } => {
            println!("==== {counterpart} ====");
            for entry in &entries {
                println!("{}", render_entry(&counterpart, entry));
            }
        }
        ClientEvent::NotificationSound => print!("\x07"),
        ClientEvent::SessionStateChanged { from, to, session } => match session {
            Some(session) => println!(
                "* call {:?} -> {:?} ({} call with {})",
                from,
                to,
                session.call_type.label(),
                session.peer
            ),
            None => println!("* call {from:?} -> {to:?}"),
        },
        ClientEvent::Ringing(ring) => println!("* ringing: {ring:?}"),
        ClientEvent::RingingStopped => {}
        ClientEvent::CallTimerTick { elapsed } => println!("* {elapsed}"),
        ClientEvent::RemoteMediaChanged { kind, enabled } => {
            println!("* remote {kind:?} {}", if enabled { "on" } else { "off" })
        }
        ClientEvent::MediaPresentationChanged(presentation) => {
            println!("* media: {presentation:?}")
        }
        ClientEvent::ContactDiscovered(user) => println!("* new contact: {user}"),
    }
}

fn render_entry(counterpart: &UserId, entry: &TranscriptEntry) -> String {
    let who = match entry.direction {
        Direction::Sent => "me".to_string(),
        Direction::Received => counterpart.to_string(),
    };
    let at = clock(entry.timestamp);
    match &entry.body {
        EntryBody::Text(text) => format!("[{at}] {who}: {text}"),
        EntryBody::Rich(rich) => {
            let mut out = format!("[{at}] {who}: {}", rich.text);
            for file in &rich.files {
                out.push_str(&format!(
                    "\n    [{}] {} ({})",
                    file.mime_type, file.name, file.size
                ));
            }
            out
        }
        EntryBody::SystemLog { content, duration } => {
            format!("[{at}] -- {content} ({duration})")
        }
    }
}

fn clock(timestamp: Seconds) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|at| at.format("%H:%M").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
