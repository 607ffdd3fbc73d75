use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use skiff_core::constants::DEFAULT_RELAY_URL;
use skiff_core::store::MemoryEventStore;
use skiff_core::verify::IdHashVerifier;
use skiff_core::{CoreConfig, CoreEvent, EngineCommand, SyncEngine};

#[derive(Parser)]
#[command(name = "skiff-cli")]
#[command(about = "Tail reconciled events from a set of relays")]
struct Cli {
    /// Relay url to read from (repeatable)
    #[arg(long = "relay", short = 'r')]
    relays: Vec<String>,

    /// Relay url to write to (repeatable; defaults to the read relays)
    #[arg(long = "write-relay", short = 'w')]
    write_relays: Vec<String>,

    /// Local identity public key (hex); enables bootstrap pulls
    #[arg(long, short = 'i')]
    identity: Option<String>,

    /// Re-pull full history, ignoring watermarks
    #[arg(long)]
    hard_refresh: bool,

    /// Also follow the live chat of an activity coordinate
    #[arg(long)]
    chat: Option<String>,

    /// Print engine counters on exit, after this many seconds
    #[arg(long, default_value_t = 60)]
    duration_secs: u64,
}

fn main() -> Result<()> {
    skiff_core::tracing_setup::init_tracing();
    let cli = Cli::parse();

    let read_relays = if cli.relays.is_empty() {
        vec![DEFAULT_RELAY_URL.to_string()]
    } else {
        cli.relays.clone()
    };
    let write_relays = if cli.write_relays.is_empty() {
        read_relays.clone()
    } else {
        cli.write_relays.clone()
    };

    let config = CoreConfig::new(read_relays, write_relays);
    let mut engine = SyncEngine::new(
        config,
        Box::new(MemoryEventStore::new()),
        Arc::new(IdHashVerifier),
    );
    let core_rx = engine.take_core_rx().expect("fresh engine");
    let handle = engine.handle();

    if let Some(identity) = cli.identity {
        handle.send(EngineCommand::SetLocalIdentity {
            pubkey: Some(identity),
        })?;
    }
    if cli.hard_refresh {
        handle.send(EngineCommand::Refresh { hard: true })?;
    }
    if let Some(coordinate) = cli.chat {
        handle.send(EngineCommand::SubscribeChat { coordinate })?;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(cli.duration_secs);
    while std::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let event = match core_rx.recv_timeout(remaining) {
            Ok(event) => event,
            Err(_) => break,
        };
        match event {
            CoreEvent::RelayStateChanged { url, state } => {
                println!("relay {url}: {state:?}");
            }
            CoreEvent::ProfileUpdated { pubkey } => {
                println!("profile updated: {pubkey}");
            }
            CoreEvent::ActivityUpdated { coordinate } => {
                println!("activity updated: {coordinate}");
            }
            CoreEvent::ChatMessage { message } => {
                println!(
                    "[{}] <{}> {}",
                    message.created_at, message.pubkey, message.content
                );
            }
            CoreEvent::EventsDeleted {
                event_ids,
                coordinates,
            } => {
                println!("deleted: {} events, {} coordinates", event_ids.len(), coordinates.len());
            }
        }
    }

    let stats = engine.stats().snapshot();
    println!(
        "received {} events ({} cache-only, {} dropped), {} subscriptions opened",
        stats.received, stats.duplicates, stats.dropped, stats.subscriptions_opened
    );
    engine.shutdown();
    Ok(())
}
