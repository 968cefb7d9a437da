use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use roomcast_core::{
    init_logging, ClientConfig, JanusConnector, RoomId, SessionEvent, SignalingSession,
    TestPatternDevices, WebRtcPeerFactory,
};

/// Headless videoroom participant publishing a test pattern
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "ROOMCAST_CONFIG")]
    config: Option<String>,

    /// Room to join; created when it does not exist
    #[arg(short, long, default_value = "1234")]
    room: String,

    /// Access token presented to the gateway
    #[arg(short, long, env = "ROOMCAST_TOKEN", default_value = "")]
    token: String,

    /// Gateway WebSocket URL, overriding the configuration
    #[arg(long)]
    server: Option<String>,

    /// Display name, overriding the configuration
    #[arg(long)]
    name: Option<String>,

    /// Join without publishing local media
    #[arg(long)]
    receive_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(server) = args.server {
        config.signaling.server_url = server;
    }
    if let Some(name) = args.name {
        config.session.display_name = Some(name);
    }
    if args.receive_only {
        config.session.media.audio.enabled = false;
        config.session.media.video.enabled = false;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    init_logging(&config.logging)?;
    info!(server = %config.signaling.server_url, room = %args.room, "Roomcast starting");

    // 3. Wire the session
    let session = SignalingSession::new(
        config.session,
        Arc::new(JanusConnector::new(config.signaling)),
        Arc::new(WebRtcPeerFactory::new()?),
        Arc::new(TestPatternDevices::new()),
    );
    let events = session.subscribe();
    let room = RoomId::new(args.room);

    // 4. Join
    session.start(room, &args.token).await?;
    info!(participant_id = ?session.participant_id(), publishing = session.publishing(), "Joined");
    println!("Commands: a = toggle audio, v = toggle video, m = mute remote audio, q = leave");

    tokio::select! {
        () = shutdown_signal() => {}
        () = run_commands(&session) => {}
        () = watch_session(&session, events) => {}
    }

    session.stop().await;
    info!("Roomcast stopped");
    Ok(())
}

/// Read single-letter commands from stdin until `q` or end of input
async fn run_commands(session: &SignalingSession) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                return;
            }
        };

        match line.trim() {
            "a" => match session.toggle_local_audio().await {
                Ok(enabled) => println!("audio {}", if enabled { "on" } else { "off" }),
                Err(e) => warn!(error = %e, "Audio toggle failed"),
            },
            "v" => match session.toggle_local_video().await {
                Ok(enabled) => println!("video {}", if enabled { "on" } else { "off" }),
                Err(e) => warn!(error = %e, "Video toggle failed"),
            },
            "m" => {
                let muted = session.toggle_remote_mute_all();
                println!("remote audio {}", if muted { "muted" } else { "playing" });
            }
            "q" => return,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
}

/// Log feed changes; returns when the session ends on its own
async fn watch_session(session: &SignalingSession, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::FeedsChanged) => {
                let feeds = session.remote_feeds();
                let ids: Vec<String> = feeds.iter().map(|feed| feed.feed_id.to_string()).collect();
                info!(feeds = ?ids, "Remote feeds changed");
            }
            Ok(SessionEvent::PublisherFailed { reason }) => {
                warn!(reason = %reason, "Publishing stopped");
            }
            Ok(SessionEvent::SignalingLost { reason }) => {
                error!(reason = %reason, "Signaling lost");
                return;
            }
            Ok(SessionEvent::Stopped) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
