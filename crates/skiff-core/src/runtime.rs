//! Engine runtime: the reconciliation actor.
//!
//! A dedicated worker thread runs a tokio runtime whose single owner loop
//! serializes every mutation: entity maps, tombstones, tries, subscription
//! refcounts, and watermarks. Relay connections run as independent I/O
//! tasks and hand events in over channels; observers read the `CoreEvent`
//! out-channel. Nothing in here is shared mutably.

use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::mpsc as tokio_mpsc;

use crate::config::CoreConfig;
use crate::events::CoreEvent;
use crate::models::Event;
use crate::relay::connection::{RelayNotification, RelayPurpose, RelayState};
use crate::relay::protocol::Filter;
use crate::relay::{RelayMessage, RelayPool};
use crate::stats::SharedEngineStats;
use crate::store::{DataStore, EventStore, IngestEffect};
use crate::subscriptions::SubscriptionManager;
use crate::timeline::MetadataDebouncer;
use crate::verify::EventVerifier;

#[derive(Debug)]
pub enum EngineCommand {
    /// Reconcile pool membership to these url sets (delta only).
    SetRelays {
        read: Vec<String>,
        write: Vec<String>,
    },
    SetLocalIdentity {
        pubkey: Option<String>,
    },
    Refresh {
        hard: bool,
    },
    /// Pull missing metadata / refresh known metadata for these authors.
    PullAuthors {
        authors: Vec<String>,
    },
    /// Ingest a locally created (externally signed) event and broadcast it
    /// to the write pool.
    Publish {
        event: Event,
    },
    SubscribeChat {
        coordinate: String,
    },
    UnsubscribeChat {
        coordinate: String,
    },
    /// Replay the persisted record cache into entity state, then pull
    /// missing events for the local follow list.
    LoadPersisted,
    Shutdown,
}

#[derive(Clone)]
pub struct EngineHandle {
    command_tx: tokio_mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow::anyhow!("engine worker is gone"))
    }
}

pub struct SyncEngine {
    handle: EngineHandle,
    core_rx: Option<Receiver<CoreEvent>>,
    stats: SharedEngineStats,
    worker_handle: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(
        config: CoreConfig,
        store: Box<dyn EventStore>,
        verifier: Arc<dyn EventVerifier>,
    ) -> Self {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (core_tx, core_rx) = std_mpsc::channel();
        let stats = SharedEngineStats::new();

        let worker_stats = stats.clone();
        let worker_handle = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    tracing::error!(%error, "failed to build engine runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                Worker::new(config, store, verifier, command_rx, core_tx, worker_stats)
                    .run()
                    .await;
            });
        });

        SyncEngine {
            handle: EngineHandle { command_tx },
            core_rx: Some(core_rx),
            stats,
            worker_handle: Some(worker_handle),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// The observer channel; can be taken once.
    pub fn take_core_rx(&mut self) -> Option<Receiver<CoreEvent>> {
        self.core_rx.take()
    }

    pub fn stats(&self) -> SharedEngineStats {
        self.stats.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.send(EngineCommand::Shutdown);
        if let Some(worker_handle) = self.worker_handle.take() {
            let _ = worker_handle.join();
        }
    }
}

struct Worker {
    config: CoreConfig,
    pool: RelayPool,
    subs: SubscriptionManager,
    data: DataStore,
    debouncer: MetadataDebouncer,
    command_rx: tokio_mpsc::UnboundedReceiver<EngineCommand>,
    notif_rx: tokio_mpsc::UnboundedReceiver<RelayNotification>,
    reconnect_tx: tokio_mpsc::UnboundedSender<(String, RelayPurpose)>,
    reconnect_rx: tokio_mpsc::UnboundedReceiver<(String, RelayPurpose)>,
    core_tx: Sender<CoreEvent>,
    stats: SharedEngineStats,
}

impl Worker {
    fn new(
        config: CoreConfig,
        store: Box<dyn EventStore>,
        verifier: Arc<dyn EventVerifier>,
        command_rx: tokio_mpsc::UnboundedReceiver<EngineCommand>,
        core_tx: Sender<CoreEvent>,
        stats: SharedEngineStats,
    ) -> Self {
        let (notif_tx, notif_rx) = tokio_mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = tokio_mpsc::unbounded_channel();
        let mut pool = RelayPool::new(notif_tx);
        pool.set_relays(&config.read_relays, &config.write_relays);

        Worker {
            debouncer: MetadataDebouncer::new(config.metadata_debounce),
            config,
            pool,
            subs: SubscriptionManager::new(),
            data: DataStore::new(store, verifier),
            command_rx,
            notif_rx,
            reconnect_tx,
            reconnect_rx,
            core_tx,
            stats,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None | Some(EngineCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(notification) = self.notif_rx.recv() => {
                    self.handle_notification(notification);
                }
                Some((url, purpose)) = self.reconnect_rx.recv() => {
                    if self.pool.contains(&url, purpose) {
                        self.pool.request_connect(&url, purpose);
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Some(authors) = self.debouncer.poll(Instant::now()) {
                        self.pull_authors(&authors);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetRelays { read, write } => {
                self.pool.set_relays(&read, &write);
            }
            EngineCommand::SetLocalIdentity { pubkey } => {
                self.data.set_local_identity(pubkey.clone());
                if let Some(pubkey) = pubkey {
                    self.pull_authors(&[pubkey]);
                    self.refresh(None, false);
                }
            }
            EngineCommand::Refresh { hard } => self.refresh(None, hard),
            EngineCommand::PullAuthors { authors } => self.pull_authors(&authors),
            EngineCommand::Publish { event } => {
                match self.data.ingest(&event, None) {
                    Some(effect) => self.apply_effect(effect),
                    None => {
                        tracing::warn!(id = %event.id, "refusing to publish invalid event");
                        return;
                    }
                }
                self.pool.publish(&event);
            }
            EngineCommand::SubscribeChat { coordinate } => {
                if self.subs.subscribe_chat(&self.pool, &coordinate).is_none() {
                    tracing::warn!(%coordinate, "no connected read relay for chat subscription");
                }
            }
            EngineCommand::UnsubscribeChat { coordinate } => {
                if let Some(subscription_id) = self.subs.unsubscribe_chat(&coordinate) {
                    self.pool.close_subscription(&subscription_id);
                }
            }
            EngineCommand::LoadPersisted => {
                let count = self.data.load_persisted();
                tracing::info!(count, "replayed persisted events");
                if let Some(local) = self.data.local_pubkey().map(str::to_string) {
                    if let Some(list) = self.data.follow_lists.get(&local) {
                        let followed = list.followed.clone();
                        self.pull_authors(&followed);
                    }
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_notification(&mut self, notification: RelayNotification) {
        match notification {
            RelayNotification::StateChanged {
                url,
                purpose,
                state,
            } => {
                if !self.pool.update_state(&url, purpose, state) {
                    tracing::debug!(%url, ?state, "state change for relay outside the pools, ignoring");
                    return;
                }
                tracing::info!(%url, ?purpose, ?state, "relay state changed");
                self.emit(CoreEvent::RelayStateChanged {
                    url: url.clone(),
                    state: self.pool.aggregate_state(&url),
                });
                match state {
                    RelayState::Connected => self.on_relay_connected(&url, purpose),
                    RelayState::NotConnected | RelayState::Error => {
                        let reconnect_tx = self.reconnect_tx.clone();
                        let delay = self.config.reconnect_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = reconnect_tx.send((url, purpose));
                        });
                    }
                    RelayState::Connecting => {}
                }
            }
            RelayNotification::Frame {
                url,
                purpose: _,
                message,
            } => match message {
                RelayMessage::Event { event, .. } => self.on_event(&url, &event),
                RelayMessage::EndOfStoredEvents { subscription_id } => {
                    self.on_subscription_closed(&subscription_id);
                }
                RelayMessage::Closed {
                    subscription_id,
                    reason,
                } => {
                    tracing::debug!(%subscription_id, %reason, "subscription closed by relay");
                    self.on_subscription_closed(&subscription_id);
                }
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                } => {
                    if accepted {
                        self.data.mark_published(&event_id, &url);
                    } else {
                        tracing::warn!(%event_id, %url, %message, "relay rejected publish");
                    }
                }
            },
        }
    }

    /// A read relay coming up re-issues durable chat subscriptions and
    /// re-pulls that relay incrementally; any relay coming up flushes
    /// unpublished local events.
    fn on_relay_connected(&mut self, url: &str, purpose: RelayPurpose) {
        if purpose == RelayPurpose::Read {
            let chats: Vec<(String, Filter)> = self
                .subs
                .chat_subscriptions()
                .map(|chat| (chat.subscription_id.clone(), chat.filter.clone()))
                .collect();
            for (subscription_id, filter) in chats {
                self.pool.subscribe_on(url, &subscription_id, &filter);
            }
            self.refresh(Some(url.to_string()), false);
        }
        self.sweep_unpublished();
    }

    fn on_event(&mut self, url: &str, event: &Event) {
        self.stats.record_received(event.kind);
        match self.data.ingest(event, Some(url)) {
            None => self.stats.record_dropped(),
            Some(IngestEffect::CachedOnly) => self.stats.record_duplicate(),
            Some(effect) => self.apply_effect(effect),
        }
    }

    fn apply_effect(&mut self, effect: IngestEffect) {
        match effect {
            IngestEffect::ProfileUpdated { pubkey } => {
                self.emit(CoreEvent::ProfileUpdated { pubkey });
            }
            IngestEffect::FollowListUpdated { followed, .. } => {
                if !followed.is_empty() {
                    self.pull_authors(&followed);
                }
            }
            IngestEffect::ActivityUpdated { coordinate } => {
                self.emit(CoreEvent::ActivityUpdated { coordinate });
            }
            IngestEffect::ChatMessageAdded { message } => {
                if !self.data.has_profile(&message.pubkey) {
                    self.debouncer
                        .request([message.pubkey.clone()], Instant::now());
                }
                self.emit(CoreEvent::ChatMessage { message });
            }
            IngestEffect::Deleted {
                event_ids,
                coordinates,
            } => {
                if !event_ids.is_empty() || !coordinates.is_empty() {
                    self.emit(CoreEvent::EventsDeleted {
                        event_ids,
                        coordinates,
                    });
                }
            }
            IngestEffect::CachedOnly => {}
        }
    }

    fn on_subscription_closed(&mut self, subscription_id: &str) {
        // Chat subscriptions are durable: EOSE just marks the end of
        // stored history.
        if self.subs.is_chat_subscription(subscription_id) {
            return;
        }
        let outcome = self.subs.on_subscription_closed(subscription_id);
        if !outcome.known {
            return;
        }
        if outcome.fully_closed {
            self.stats.record_subscription_closed();
            self.pool.close_subscription(subscription_id);
        }
        if outcome.activity_refresh_drained {
            let authors = self.data.activity_authors();
            if !authors.is_empty() {
                self.pull_authors(&authors);
            }
        }
    }

    fn pull_authors(&mut self, authors: &[String]) {
        let before = self.subs.outstanding_backfills();
        self.subs
            .pull_missing_and_refresh(&self.pool, &self.data, authors, unix_now());
        self.track_opened(before);
    }

    fn refresh(&mut self, relay: Option<String>, hard: bool) {
        let before = self.subs.outstanding_backfills();
        self.subs
            .refresh(&self.pool, &self.data, relay.as_deref(), hard, unix_now());
        self.track_opened(before);
        self.sweep_unpublished();
    }

    fn track_opened(&self, before: usize) {
        let after = self.subs.outstanding_backfills();
        for _ in before..after {
            self.stats.record_subscription_opened();
        }
    }

    /// Re-broadcast every record never confirmed on any relay.
    fn sweep_unpublished(&mut self) {
        self.data.retry_unpersisted();
        for event in self.data.unpublished_events() {
            self.pool.publish(&event);
        }
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.core_tx.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::store::MemoryEventStore;
    use crate::verify::AcceptAll;

    /// A relay that answers every REQ with one stored profile event and an
    /// EOSE, then keeps the socket open until the client goes away.
    fn spawn_mock_relay() -> std::net::SocketAddr {
        let (addr_tx, addr_rx) = std_mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let profile = json!({
                    "id": "e1", "pubkey": "abc", "kind": 0, "created_at": 10,
                    "tags": [], "content": "{\"name\":\"tester\"}", "sig": ""
                });
                while let Some(Ok(message)) = ws.next().await {
                    let Ok(text) = message.to_text() else { continue };
                    let Ok(value) = serde_json::from_str::<Value>(text) else {
                        continue;
                    };
                    if value[0] == "REQ" {
                        let sub = value[1].as_str().unwrap_or_default().to_string();
                        ws.send(Message::Text(
                            json!(["EVENT", sub, profile]).to_string(),
                        ))
                        .await
                        .unwrap();
                        ws.send(Message::Text(json!(["EOSE", sub]).to_string()))
                            .await
                            .unwrap();
                    }
                }
            });
        });
        addr_rx.recv().unwrap()
    }

    #[test]
    fn engine_pulls_and_reconciles_end_to_end() {
        let addr = spawn_mock_relay();
        let url = format!("ws://{addr}");

        let config = CoreConfig::new(vec![url.clone()], Vec::new());
        let mut engine = SyncEngine::new(
            config,
            Box::new(MemoryEventStore::new()),
            Arc::new(AcceptAll),
        );
        let core_rx = engine.take_core_rx().unwrap();
        let handle = engine.handle();
        handle
            .send(EngineCommand::SetLocalIdentity {
                pubkey: Some("abc".into()),
            })
            .unwrap();

        let mut connected = false;
        let mut profile_updated = false;
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && !(connected && profile_updated) {
            match core_rx.recv_timeout(Duration::from_secs(10)) {
                Ok(CoreEvent::RelayStateChanged {
                    state: Some(RelayState::Connected),
                    ..
                }) => connected = true,
                Ok(CoreEvent::ProfileUpdated { pubkey }) => {
                    assert_eq!(pubkey, "abc");
                    profile_updated = true;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(connected, "relay never reached Connected");
        assert!(profile_updated, "profile event never reconciled");

        let stats = engine.stats().snapshot();
        assert!(stats.received >= 1);
        assert!(stats.subscriptions_opened >= 1);

        engine.shutdown();
    }
}
