//! One logical connection to one relay.
//!
//! Each connection is a tokio task owning the websocket. The owner talks to
//! it through a command channel and hears back through typed notifications;
//! there are no callbacks and no shared state.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::relay::protocol::{ClientMessage, RelayMessage};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    NotConnected,
    Connecting,
    Connected,
    Error,
}

/// Which pool a connection serves. The same url may be connected once per
/// purpose; the two connections are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayPurpose {
    Read,
    Write,
}

/// Typed notifications from a connection task to the owner loop.
#[derive(Debug)]
pub enum RelayNotification {
    StateChanged {
        url: String,
        purpose: RelayPurpose,
        state: RelayState,
    },
    Frame {
        url: String,
        purpose: RelayPurpose,
        message: RelayMessage,
    },
}

/// Commands from the owner to a connection task.
#[derive(Debug)]
pub enum ConnCommand {
    Connect,
    Disconnect,
    Send(ClientMessage),
}

/// Owner-side handle for one spawned connection. `state` is the owner's
/// view, updated from `StateChanged` notifications.
pub(crate) struct ConnectionHandle {
    pub url: String,
    pub state: RelayState,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
}

impl ConnectionHandle {
    pub fn send(&self, command: ConnCommand) {
        let _ = self.cmd_tx.send(command);
    }

    #[cfg(test)]
    pub fn for_test(
        url: &str,
        state: RelayState,
        cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    ) -> Self {
        ConnectionHandle {
            url: url.to_string(),
            state,
            cmd_tx,
        }
    }
}

/// Spawn the I/O task for one relay. The task exits when the handle is
/// dropped (command channel closed).
pub(crate) fn spawn_connection(
    url: &str,
    purpose: RelayPurpose,
    notif_tx: mpsc::UnboundedSender<RelayNotification>,
) -> ConnectionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task_url = url.to_string();
    tokio::spawn(async move {
        connection_task(task_url, purpose, cmd_rx, notif_tx).await;
    });
    ConnectionHandle {
        url: url.to_string(),
        state: RelayState::NotConnected,
        cmd_tx,
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connection_task(
    url: String,
    purpose: RelayPurpose,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    notif_tx: mpsc::UnboundedSender<RelayNotification>,
) {
    let mut socket: Option<Socket> = None;

    loop {
        if let Some(ws) = socket.as_mut() {
            // Arms record the state to fall into so the socket borrow ends
            // before the slot is cleared.
            let mut dropped: Option<RelayState> = None;
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                    Some(ConnCommand::Disconnect) => {
                        let _ = ws.close(None).await;
                        dropped = Some(RelayState::NotConnected);
                    }
                    Some(ConnCommand::Connect) => {}
                    Some(ConnCommand::Send(message)) => {
                        if let Err(error) = ws.send(Message::Text(message.to_json())).await {
                            tracing::warn!(%url, %error, "relay send failed");
                            dropped = Some(RelayState::Error);
                        }
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match RelayMessage::parse(&text) {
                        Ok(message) => {
                            let _ = notif_tx.send(RelayNotification::Frame {
                                url: url.clone(),
                                purpose,
                                message,
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%url, %error, "dropping malformed relay frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        dropped = Some(RelayState::Error);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%url, %error, "relay read failed");
                        dropped = Some(RelayState::Error);
                    }
                },
            }
            if let Some(state) = dropped {
                socket = None;
                notify(&notif_tx, &url, purpose, state);
            }
        } else {
            match cmd_rx.recv().await {
                None => return,
                Some(ConnCommand::Connect) => {
                    notify(&notif_tx, &url, purpose, RelayState::Connecting);
                    match connect_async(url.as_str()).await {
                        Ok((ws, _response)) => {
                            socket = Some(ws);
                            notify(&notif_tx, &url, purpose, RelayState::Connected);
                        }
                        Err(error) => {
                            tracing::warn!(%url, %error, "relay connect failed");
                            notify(&notif_tx, &url, purpose, RelayState::Error);
                        }
                    }
                }
                Some(ConnCommand::Disconnect) => {}
                Some(ConnCommand::Send(_)) => {
                    tracing::debug!(%url, "dropping outbound message, relay not connected");
                }
            }
        }
    }
}

fn notify(
    notif_tx: &mpsc::UnboundedSender<RelayNotification>,
    url: &str,
    purpose: RelayPurpose,
    state: RelayState,
) {
    let _ = notif_tx.send(RelayNotification::StateChanged {
        url: url.to_string(),
        purpose,
        state,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::FilterBuilder;
    use serde_json::json;
    use tokio_tungstenite::accept_async;

    async fn next_state(
        notif_rx: &mut mpsc::UnboundedReceiver<RelayNotification>,
    ) -> RelayState {
        loop {
            match notif_rx.recv().await.expect("notification stream ended") {
                RelayNotification::StateChanged { state, .. } => return state,
                RelayNotification::Frame { .. } => continue,
            }
        }
    }

    async fn next_frame(
        notif_rx: &mut mpsc::UnboundedReceiver<RelayNotification>,
    ) -> RelayMessage {
        loop {
            match notif_rx.recv().await.expect("notification stream ended") {
                RelayNotification::Frame { message, .. } => return message,
                RelayNotification::StateChanged { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn connects_and_forwards_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Read the REQ, answer with one event, one junk frame, then EOSE.
            let req = ws.next().await.unwrap().unwrap();
            assert!(req.to_text().unwrap().contains("\"REQ\""));
            let event = json!({
                "id": "aa", "pubkey": "bb", "kind": 1, "created_at": 7,
                "tags": [], "content": "hi", "sig": ""
            });
            ws.send(Message::Text(json!(["EVENT", "sub1", event]).to_string()))
                .await
                .unwrap();
            ws.send(Message::Text("junk".into())).await.unwrap();
            ws.send(Message::Text(json!(["EOSE", "sub1"]).to_string()))
                .await
                .unwrap();
        });

        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
        let handle = spawn_connection(&format!("ws://{addr}"), RelayPurpose::Read, notif_tx);
        handle.send(ConnCommand::Connect);

        assert_eq!(next_state(&mut notif_rx).await, RelayState::Connecting);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Connected);

        let filter = FilterBuilder::new().kinds([1]).build().unwrap();
        handle.send(ConnCommand::Send(ClientMessage::Req {
            subscription_id: "sub1".into(),
            filter,
        }));

        match next_frame(&mut notif_rx).await {
            RelayMessage::Event { event, .. } => assert_eq!(event.content, "hi"),
            other => panic!("unexpected frame {other:?}"),
        }
        // The junk frame was dropped; the EOSE after it still arrives.
        assert_eq!(
            next_frame(&mut notif_rx).await,
            RelayMessage::EndOfStoredEvents {
                subscription_id: "sub1".into()
            }
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_relay_reports_error() {
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
        let handle = spawn_connection("ws://127.0.0.1:1", RelayPurpose::Read, notif_tx);
        handle.send(ConnCommand::Connect);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Connecting);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Error);
    }

    #[tokio::test]
    async fn server_close_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
        let handle = spawn_connection(&format!("ws://{addr}"), RelayPurpose::Read, notif_tx);
        handle.send(ConnCommand::Connect);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Connecting);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Connected);
        assert_eq!(next_state(&mut notif_rx).await, RelayState::Error);
    }
}
