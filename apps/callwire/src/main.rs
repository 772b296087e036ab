mod cli;
mod config;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use call_signaling::engine::rtc::{RtcEngineFactory, SyntheticMediaSource};
use call_signaling::{
    CallSessionController, MediaSource, NegotiationEngineFactory, RegistryEvent, SessionRegistry,
    SignalingChannel,
};

use cli::Cli;
use config::{AppConfig, Settings};

const HELP: &str = "commands: call <peer> | accept [peer] | reject [peer] | hangup [peer] | list | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let env = AppConfig::from_env().context("reading CALLWIRE__* environment")?;
    let Settings {
        channel,
        identity,
        registry,
        ice_servers,
        log_path,
    } = Settings::resolve(&cli, env)?;
    logging::init(&cli.logging.to_config(log_path.as_deref()))?;

    let relay = channel.url.clone();
    let channel = SignalingChannel::connect(channel, identity)
        .await
        .with_context(|| format!("connecting to relay {relay}"))?;
    let events = channel.events()?;

    let media: Arc<dyn MediaSource> = if cli.audio_only {
        Arc::new(SyntheticMediaSource::audio_only())
    } else {
        Arc::new(SyntheticMediaSource::default())
    };
    let engines: Arc<dyn NegotiationEngineFactory> = match ice_servers {
        Some(servers) => Arc::new(RtcEngineFactory::new(servers)),
        None => Arc::new(RtcEngineFactory::default()),
    };
    let auto_answer = registry.session.auto_answer;
    let registry = SessionRegistry::with_channel(channel, media, engines, registry);
    tokio::spawn({
        let registry = registry.clone();
        async move { registry.run(events).await }
    });
    info!(relay = %relay, user_id = %registry.local_user_id(), "callwire connected");
    println!("connected to {relay} as {}", registry.local_user_id());
    println!("{HELP}");

    let mut registry_events = registry.subscribe();
    if let Some(peer) = &cli.call {
        place_call(&registry, peer).await;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = registry_events.recv() => match event {
                Ok(event) => {
                    if !on_registry_event(event, auto_answer) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry events lagged");
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !on_command(&registry, &line).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(error = %err, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    registry.shutdown().await;
    println!("bye");
    Ok(())
}

/// Returns `false` once the agent should stop.
fn on_registry_event(event: RegistryEvent, auto_answer: bool) -> bool {
    match event {
        RegistryEvent::IncomingCall { peer_id, session } => {
            println!("incoming call from {peer_id}");
            if !auto_answer {
                println!("  `accept {peer_id}` or `reject {peer_id}`");
            }
            watch(session);
        }
        RegistryEvent::SessionEnded {
            peer_id, outcome, ..
        } => {
            println!("call with {peer_id} finished: {outcome}");
        }
        RegistryEvent::Presence { user_id, online } => {
            println!("{user_id} is {}", if online { "online" } else { "offline" });
        }
        RegistryEvent::ChannelUnavailable { attempts } => {
            eprintln!("relay unreachable after {attempts} attempts");
            return false;
        }
    }
    true
}

async fn on_command(registry: &SessionRegistry, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let peer = words.next();

    match command {
        "call" => match peer {
            Some(peer) => place_call(registry, peer).await,
            None => println!("usage: call <peer>"),
        },
        "accept" | "reject" | "hangup" => {
            let Some(session) = target(registry, peer) else {
                println!("no matching call");
                return true;
            };
            let result = match command {
                "accept" => session.accept_pending_offer().await,
                "reject" => session.reject_pending_offer().await,
                _ => {
                    session.end_call();
                    Ok(())
                }
            };
            if let Err(err) = result {
                println!("{command} failed: {err}");
            }
        }
        "list" => {
            let snapshots = registry.snapshots();
            if snapshots.is_empty() {
                println!("no calls");
            }
            for snapshot in snapshots {
                println!(
                    "{} {} {:?} since {}",
                    snapshot.peer_id,
                    snapshot.state,
                    snapshot.direction,
                    snapshot.created_at.format("%H:%M:%S")
                );
            }
        }
        "quit" | "exit" => return false,
        _ => println!("{HELP}"),
    }
    true
}

async fn place_call(registry: &SessionRegistry, peer: &str) {
    match registry.initiate(peer).await {
        Ok(session) => {
            println!("calling {peer}");
            watch(session);
        }
        Err(err) => println!("cannot call {peer}: {err}"),
    }
}

/// The live call with `peer`, or the only live call when no peer is given.
fn target(registry: &SessionRegistry, peer: Option<&str>) -> Option<CallSessionController> {
    if let Some(peer) = peer {
        return registry.session(peer);
    }
    let mut live = registry
        .snapshots()
        .into_iter()
        .filter(|snapshot| !snapshot.state.is_terminal());
    match (live.next(), live.next()) {
        (Some(only), None) => registry.session(&only.peer_id),
        _ => None,
    }
}

/// Prints state changes of one call until it terminates.
fn watch(session: CallSessionController) {
    tokio::spawn(async move {
        let mut updates = session.subscribe();
        let mut last = None;
        let mut tracks = 0;
        loop {
            let (state, remote_tracks) = {
                let snapshot = updates.borrow_and_update();
                (snapshot.state, snapshot.remote_tracks.len())
            };
            if last != Some(state) {
                println!("[{}] {state}", session.peer_id());
                last = Some(state);
            }
            if remote_tracks != tracks {
                println!("[{}] receiving {remote_tracks} remote track(s)", session.peer_id());
                tracks = remote_tracks;
            }
            if state.is_terminal() || updates.changed().await.is_err() {
                break;
            }
        }
    });
}
