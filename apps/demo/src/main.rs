use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use call_core::{CallClient, CallEvent};
use clap::Parser;
use media_transport::simulated::SimulatedConnector;
use shared::domain::{ConnectionStatus, MediaKind, ParticipantId};
use signal_store::{RemoteStore, SignalStore, SqliteStore};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Scripted two-party call: dial, ring, accept, connect, hang up, then print
/// both ledgers. Runs fully in-process by default, or against a running
/// signal server with --server-url.
#[derive(Parser, Debug)]
struct Args {
    /// Base URL of a signal server, e.g. http://127.0.0.1:8787
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "sqlite::memory:")]
    database_url: String,
    /// "audio" or "video"
    #[arg(long, default_value = "video")]
    media: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let kind = match args.media.as_str() {
        "audio" => MediaKind::Audio,
        "video" => MediaKind::Video,
        other => anyhow::bail!("unknown media kind '{other}'"),
    };

    let alice_id = ParticipantId::new("alice");
    let bob_id = ParticipantId::new("bob");

    let (alice_store, bob_store): (Arc<dyn SignalStore>, Arc<dyn SignalStore>) =
        match &args.server_url {
            Some(url) => (
                RemoteStore::connect(url.clone(), &alice_id),
                RemoteStore::connect(url.clone(), &bob_id),
            ),
            None => {
                let store: Arc<dyn SignalStore> =
                    Arc::new(SqliteStore::new(&args.database_url).await?);
                (Arc::clone(&store), store)
            }
        };

    let alice = CallClient::new(
        alice_id,
        "Alice",
        alice_store,
        Arc::new(SimulatedConnector::default()),
    );
    let bob = CallClient::new(
        bob_id.clone(),
        "Bob",
        bob_store,
        Arc::new(SimulatedConnector::default()),
    );
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    println!("alice dials bob ({})", kind.as_str());
    alice.initiate(&bob_id, "Bob", kind).await?;

    wait_for(&mut bob_events, "incoming ring", |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await?;
    println!("bob sees the incoming call and accepts");
    bob.accept().await?;

    wait_for(&mut alice_events, "alice to connect", |e| {
        matches!(e, CallEvent::ConnectionStatus(ConnectionStatus::Connected))
    })
    .await?;
    wait_for(&mut bob_events, "bob to connect", |e| {
        matches!(e, CallEvent::ConnectionStatus(ConnectionStatus::Connected))
    })
    .await?;
    println!("both sides connected");

    if kind == MediaKind::Video {
        alice.toggle_mute().await?;
        alice.switch_camera().await?;
        println!("alice muted herself and flipped the camera mid-call");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("alice hangs up");
    alice.end().await?;
    wait_for(&mut alice_events, "alice teardown", |e| {
        matches!(e, CallEvent::CallEnded { .. })
    })
    .await?;
    wait_for(&mut bob_events, "bob teardown", |e| {
        matches!(e, CallEvent::CallEnded { .. })
    })
    .await?;

    for client in [&alice, &bob] {
        println!("\ncall history for {}:", client.participant_id());
        for entry in client.history().await? {
            println!(
                "  {} {} {} -> {}{}",
                entry.started_at.format("%H:%M:%S"),
                entry.direction.as_str(),
                entry.other_label,
                entry.status.as_str(),
                entry
                    .reason
                    .map(|r| format!(" ({})", r.as_str()))
                    .unwrap_or_default(),
            );
        }
    }
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    what: &str,
    pred: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent> {
    let matched = async {
        loop {
            let event = events.recv().await?;
            if pred(&event) {
                return anyhow::Ok(event);
            }
        }
    };
    timeout(Duration::from_secs(10), matched)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {what}"))?
}
