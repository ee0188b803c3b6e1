//! In-process transport for tests and embedding.
//!
//! A [`MemoryConnector`] plays both the transport and a tiny scripted
//! server. Each `open` consumes the next [`MemoryOutcome`] (falling back to
//! the default outcome). Accepted channels get a pump task that answers
//! `join` and `ping` according to [`MemoryBehavior`] and forwards every
//! client envelope to a [`MemoryPeer`] handle, which can also push frames
//! to the client or drop the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tableside_core::{TenantId, TransportKind};

use super::{Channel, ChannelDriver, Connector, Endpoint, EventSink, channel_pair};
use crate::errors::TransportError;
use crate::protocol::{Envelope, events};

/// What the next `open` does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryOutcome {
    /// Open a channel.
    Accept,
    /// Fail immediately with the given reason.
    Refuse(String),
    /// Never complete; the negotiator's timeout decides.
    Hang,
}

/// How the scripted server answers acknowledged emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmitReply {
    /// Ack with `{"event": <name>, "data": <payload>}`.
    Echo,
    /// Negative ack with the given error.
    Reject(String),
    /// Never answer.
    Ignore,
}

/// Scripted server behavior for accepted channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBehavior {
    /// Ack `join` handshakes.
    pub ack_join: bool,
    /// Reject `join` with this error instead (wins over `ack_join`).
    pub reject_join: Option<String>,
    /// Answer pings with pongs.
    pub answer_pings: bool,
    /// Reply to other acknowledged emits.
    pub emit_reply: EmitReply,
}

impl Default for MemoryBehavior {
    fn default() -> Self {
        Self {
            ack_join: true,
            reject_join: None,
            answer_pings: true,
            emit_reply: EmitReply::Echo,
        }
    }
}

/// Scripted in-process connector.
#[derive(Debug)]
pub struct MemoryConnector {
    kind: TransportKind,
    script: Mutex<VecDeque<MemoryOutcome>>,
    fallback: Mutex<MemoryOutcome>,
    behavior: Mutex<MemoryBehavior>,
    open_calls: AtomicU32,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl MemoryConnector {
    /// Connector reporting `kind` that accepts every open.
    pub fn new(kind: TransportKind) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MemoryOutcome::Accept),
            behavior: Mutex::new(MemoryBehavior::default()),
            open_calls: AtomicU32::new(0),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// Connector that refuses every open.
    pub fn refusing(kind: TransportKind, reason: &str) -> Self {
        let connector = Self::new(kind);
        connector.set_fallback(MemoryOutcome::Refuse(reason.to_string()));
        connector
    }

    /// Queue the outcome of one future `open`.
    pub fn push_outcome(&self, outcome: MemoryOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Outcome once the script is exhausted.
    pub fn set_fallback(&self, outcome: MemoryOutcome) {
        *self.fallback.lock() = outcome;
    }

    /// Behavior of channels accepted from now on.
    pub fn set_behavior(&self, behavior: MemoryBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of `open` calls so far.
    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted channel.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }

    /// Wait at most `timeout` for the next accepted channel.
    pub async fn next_peer_within(&self, timeout: Duration) -> Option<MemoryPeer> {
        tokio::time::timeout(timeout, self.next_peer()).await.ok().flatten()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let _ = self.open_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());

        match outcome {
            MemoryOutcome::Accept => {}
            MemoryOutcome::Refuse(reason) => return Err(TransportError::Connect(reason)),
            MemoryOutcome::Hang => std::future::pending::<()>().await,
        }

        let (channel, driver) = channel_pair(self.kind);
        let ChannelDriver {
            outbound,
            events,
            close,
        } = driver;
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let behavior = self.behavior.lock().clone();

        drop(tokio::spawn(pump(
            outbound,
            events.clone(),
            close.clone(),
            behavior,
            received_tx,
        )));

        let _ = self.peers_tx.send(MemoryPeer {
            tenant: endpoint.tenant().clone(),
            token: endpoint.token().map(str::to_owned),
            events,
            close,
            received: received_rx,
        });
        Ok(channel)
    }
}

/// Apply the scripted replies and forward everything the client sent.
async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    events: EventSink,
    close: CancellationToken,
    behavior: MemoryBehavior,
    received: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        let envelope = tokio::select! {
            () = close.cancelled() => return,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => return,
            },
        };

        if let Some(reply) = scripted_reply(&behavior, &envelope) {
            let _ = events.deliver(reply);
        }
        let _ = received.send(envelope);
    }
}

fn scripted_reply(behavior: &MemoryBehavior, envelope: &Envelope) -> Option<Envelope> {
    match envelope.event.as_str() {
        events::PING if behavior.answer_pings => envelope.seq().map(Envelope::pong),
        events::JOIN => {
            let ack_id = envelope.ack_id?;
            if let Some(error) = &behavior.reject_join {
                Some(Envelope::nack(ack_id, error.clone()))
            } else if behavior.ack_join {
                Some(Envelope::ack(ack_id, json!({ "joined": envelope.data.clone() })))
            } else {
                None
            }
        }
        _ => {
            let ack_id = envelope.ack_id?;
            match &behavior.emit_reply {
                EmitReply::Echo => Some(Envelope::ack(
                    ack_id,
                    json!({ "event": envelope.event, "data": envelope.data }),
                )),
                EmitReply::Reject(error) => Some(Envelope::nack(ack_id, error.clone())),
                EmitReply::Ignore => None,
            }
        }
    }
}

/// Server side of one accepted memory channel.
#[derive(Debug)]
pub struct MemoryPeer {
    tenant: TenantId,
    token: Option<String>,
    events: EventSink,
    close: CancellationToken,
    received: mpsc::UnboundedReceiver<Envelope>,
}

impl MemoryPeer {
    /// Tenant the client connected as.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Token the client presented.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Push an envelope to the client.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.events.deliver(envelope)
    }

    /// Push a notification-style event to the client.
    pub fn notify(&self, event: &str, data: Value) -> bool {
        self.send(Envelope::new(event, data))
    }

    /// Push a raw text frame (possibly malformed) to the client.
    pub fn send_raw(&self, raw: &str) -> bool {
        self.events.deliver_text(raw)
    }

    /// Simulate the server or network dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.close.cancel();
        self.events.closed(reason);
    }

    /// Whether the client closed the channel.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Wait until the client closes the channel.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// Next envelope the client sent, including scripted ones.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.received.recv().await
    }

    /// Next client envelope with the given event name.
    pub async fn recv_event(&mut self, event: &str) -> Option<Envelope> {
        while let Some(envelope) = self.received.recv().await {
            if envelope.event == event {
                return Some(envelope);
            }
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
