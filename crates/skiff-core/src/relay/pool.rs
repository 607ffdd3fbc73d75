//! Read/write relay pools.
//!
//! The read pool serves subscriptions, the write pool serves publishes.
//! They are independent resources: a url may live in both, and membership
//! changes in one never touch the other.

use std::collections::HashMap;

use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::models::Event;
use crate::relay::connection::{
    spawn_connection, ConnCommand, ConnectionHandle, RelayNotification, RelayPurpose, RelayState,
};
use crate::relay::protocol::{ClientMessage, Filter};

pub struct RelayPool {
    read: HashMap<String, ConnectionHandle>,
    write: HashMap<String, ConnectionHandle>,
    notif_tx: mpsc::UnboundedSender<RelayNotification>,
}

impl RelayPool {
    pub fn new(notif_tx: mpsc::UnboundedSender<RelayNotification>) -> Self {
        RelayPool {
            read: HashMap::new(),
            write: HashMap::new(),
            notif_tx,
        }
    }

    /// Add a relay to one pool and start connecting. Invalid urls are
    /// dropped with a diagnostic; an already-present url is left alone.
    pub fn add_relay(&mut self, url: &str, purpose: RelayPurpose) {
        if !is_valid_relay_url(url) {
            tracing::warn!(%url, "ignoring invalid relay url");
            return;
        }
        let pool = self.pool_mut(purpose);
        if pool.contains_key(url) {
            return;
        }
        let handle = spawn_connection(url, purpose, self.notif_tx.clone());
        handle.send(ConnCommand::Connect);
        self.pool_mut(purpose).insert(url.to_string(), handle);
    }

    /// Remove a relay from one pool, disconnecting its connection. The
    /// same url in the other pool keeps running.
    pub fn remove_relay(&mut self, url: &str, purpose: RelayPurpose) {
        if let Some(handle) = self.pool_mut(purpose).remove(url) {
            handle.send(ConnCommand::Disconnect);
        }
    }

    /// Reconcile pool membership against the desired url sets, touching
    /// exactly the delta: connections present in both old and new sets keep
    /// running undisturbed.
    pub fn set_relays(&mut self, read_urls: &[String], write_urls: &[String]) {
        self.reconcile(read_urls, RelayPurpose::Read);
        self.reconcile(write_urls, RelayPurpose::Write);
    }

    fn reconcile(&mut self, urls: &[String], purpose: RelayPurpose) {
        let stale: Vec<String> = self
            .pool(purpose)
            .keys()
            .filter(|existing| !urls.contains(existing))
            .cloned()
            .collect();
        for url in stale {
            self.remove_relay(&url, purpose);
        }
        for url in urls {
            self.add_relay(url, purpose);
        }
    }

    /// Record a state transition reported by a connection. Returns false
    /// for urls no longer in the named pool (stale notifications).
    pub fn update_state(&mut self, url: &str, purpose: RelayPurpose, state: RelayState) -> bool {
        match self.pool_mut(purpose).get_mut(url) {
            Some(handle) => {
                handle.state = state;
                true
            }
            None => false,
        }
    }

    /// Aggregate connection state for a url across both pools. None when
    /// the url is in neither pool; otherwise the worst state wins:
    /// Error > NotConnected > Connecting > Connected.
    pub fn aggregate_state(&self, url: &str) -> Option<RelayState> {
        let states: Vec<RelayState> = [self.read.get(url), self.write.get(url)]
            .into_iter()
            .flatten()
            .map(|handle| handle.state)
            .collect();
        if states.is_empty() {
            return None;
        }
        for state in [
            RelayState::Error,
            RelayState::NotConnected,
            RelayState::Connecting,
        ] {
            if states.contains(&state) {
                return Some(state);
            }
        }
        Some(RelayState::Connected)
    }

    pub fn contains(&self, url: &str, purpose: RelayPurpose) -> bool {
        self.pool(purpose).contains_key(url)
    }

    pub fn contains_anywhere(&self, url: &str) -> bool {
        self.read.contains_key(url) || self.write.contains_key(url)
    }

    pub fn has_connected_read_relay(&self) -> bool {
        self.read
            .values()
            .any(|handle| handle.state == RelayState::Connected)
    }

    pub fn connected_read_urls(&self) -> Vec<String> {
        self.read
            .values()
            .filter(|handle| handle.state == RelayState::Connected)
            .map(|handle| handle.url.clone())
            .collect()
    }

    /// Whether a specific read relay is currently connected.
    pub fn read_relay_connected(&self, url: &str) -> bool {
        self.read
            .get(url)
            .is_some_and(|handle| handle.state == RelayState::Connected)
    }

    /// Ask a connection to (re)connect, e.g. after a drop.
    pub fn request_connect(&self, url: &str, purpose: RelayPurpose) {
        if let Some(handle) = self.pool(purpose).get(url) {
            handle.send(ConnCommand::Connect);
        }
    }

    /// Broadcast a REQ to every connected read relay under one logical
    /// subscription id. None when no read relay is connected.
    pub fn subscribe(&self, filter: &Filter) -> Option<String> {
        if !self.has_connected_read_relay() {
            return None;
        }
        let subscription_id = Uuid::new_v4().to_string();
        for handle in self.read.values() {
            if handle.state == RelayState::Connected {
                handle.send(ConnCommand::Send(ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filter: filter.clone(),
                }));
            }
        }
        Some(subscription_id)
    }

    /// Re-issue an existing subscription on a single relay (after a
    /// reconnect). Returns false when that relay is not a connected read
    /// relay.
    pub fn subscribe_on(&self, url: &str, subscription_id: &str, filter: &Filter) -> bool {
        match self.read.get(url) {
            Some(handle) if handle.state == RelayState::Connected => {
                handle.send(ConnCommand::Send(ClientMessage::Req {
                    subscription_id: subscription_id.to_string(),
                    filter: filter.clone(),
                }));
                true
            }
            _ => false,
        }
    }

    /// Broadcast a CLOSE for a subscription to the read pool.
    pub fn close_subscription(&self, subscription_id: &str) {
        for handle in self.read.values() {
            handle.send(ConnCommand::Send(ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            }));
        }
    }

    /// Fire-and-forget broadcast to the write pool. Disconnected relays
    /// drop the frame; the unpublished sweep retries later.
    pub fn publish(&self, event: &Event) {
        for handle in self.write.values() {
            handle.send(ConnCommand::Send(ClientMessage::Event {
                event: event.clone(),
            }));
        }
    }

    fn pool(&self, purpose: RelayPurpose) -> &HashMap<String, ConnectionHandle> {
        match purpose {
            RelayPurpose::Read => &self.read,
            RelayPurpose::Write => &self.write,
        }
    }

    fn pool_mut(&mut self, purpose: RelayPurpose) -> &mut HashMap<String, ConnectionHandle> {
        match purpose {
            RelayPurpose::Read => &mut self.read,
            RelayPurpose::Write => &mut self.write,
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_test_relay(
        &mut self,
        url: &str,
        purpose: RelayPurpose,
        state: RelayState,
        cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    ) {
        self.pool_mut(purpose)
            .insert(url.to_string(), ConnectionHandle::for_test(url, state, cmd_tx));
    }
}

fn is_valid_relay_url(url: &str) -> bool {
    matches!(Url::parse(url), Ok(parsed) if parsed.scheme() == "ws" || parsed.scheme() == "wss")
}
