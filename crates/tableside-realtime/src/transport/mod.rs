//! Transport channels.
//!
//! A [`Connector`] opens one physical connection and hands back a
//! [`Channel`]: a non-blocking [`ChannelSender`] plus a receiver of
//! [`ChannelEvent`]s. The connector keeps the other half, a
//! [`ChannelDriver`], inside its own I/O task(s).
//!
//! - [`websocket`]: full-duplex WebSocket via `tokio-tungstenite`
//! - [`streaming`]: server-sent events in, HTTP POST out
//! - [`long_poll`]: repeated HTTP polls in, HTTP POST out
//! - [`memory`]: in-process scripted connector for tests and embedding

pub mod long_poll;
pub mod memory;
pub mod sse;
pub mod streaming;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use tableside_core::constants::CLIENT_NAME;
use tableside_core::{TenantId, TransportKind};

use crate::config::ConnectionConfig;
use crate::errors::TransportError;
use crate::protocol::Envelope;

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Where and as whom a transport connects.
#[derive(Clone, Debug)]
pub struct Endpoint {
    base: reqwest::Url,
    tenant: TenantId,
    token: Option<String>,
}

impl Endpoint {
    /// Build an endpoint from the server URL and realtime path prefix.
    pub fn new(
        server_url: &str,
        path: &str,
        tenant: TenantId,
        token: Option<String>,
    ) -> Result<Self, TransportError> {
        let mut base = reqwest::Url::parse(server_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{server_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(format!(
                "{server_url}: scheme must be http or https"
            )));
        }
        let prefix = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            path.trim_matches('/')
        );
        base.set_path(prefix.trim_end_matches('/'));
        base.set_query(None);
        Ok(Self {
            base,
            tenant,
            token,
        })
    }

    /// Build an endpoint for `tenant` from manager configuration.
    pub fn from_config(config: &ConnectionConfig, tenant: TenantId) -> Result<Self, TransportError> {
        Self::new(
            &config.server_url,
            &config.path,
            tenant,
            config.auth_token.clone(),
        )
    }

    /// Tenant the channel is opened for.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Bearer token, if configured.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// HTTP URL of `suffix` under the realtime prefix, with tenant and
    /// token query parameters.
    pub fn http_url(&self, suffix: &str) -> reqwest::Url {
        let mut url = self.base.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), suffix.trim_start_matches('/'));
        url.set_path(&path);
        {
            let mut query = url.query_pairs_mut();
            let _ = query.append_pair("tenantId", self.tenant.as_str());
            if let Some(token) = &self.token {
                let _ = query.append_pair("token", token);
            }
        }
        url
    }

    /// WebSocket URL of `suffix` (`ws` for `http`, `wss` for `https`).
    pub fn ws_url(&self, suffix: &str) -> Result<reqwest::Url, TransportError> {
        let mut url = self.http_url(suffix);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Something that happened on a channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// A decoded envelope.
    Message(Envelope),
    /// A frame that is not a valid envelope.
    Malformed {
        /// Raw frame text (truncated for logging by the receiver).
        raw: String,
        /// Decoder error.
        error: String,
    },
    /// The channel is gone. No further events follow.
    Closed {
        /// Why the channel closed.
        reason: String,
    },
}

/// Sending half of a channel, held by the connection manager.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<Envelope>,
    close: CancellationToken,
}

impl ChannelSender {
    /// Transport this channel runs on.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue an envelope for sending. Never blocks.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.close.is_cancelled() {
            return Err(TransportError::Closed("channel closed locally".into()));
        }
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::Closed("transport task stopped".into()))
    }

    /// Ask the transport to shut down. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// One open bidirectional channel as seen by its owner.
#[derive(Debug)]
pub struct Channel {
    /// Sending half.
    pub sender: ChannelSender,
    /// Inbound events, in arrival order.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Transport this channel runs on.
    pub fn kind(&self) -> TransportKind {
        self.sender.kind
    }

    /// Close the channel and drop it.
    pub fn close(self) {
        self.sender.close();
    }
}

/// Transport-side half of a channel.
#[derive(Debug)]
pub struct ChannelDriver {
    /// Envelopes queued by the owner.
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
    /// Where inbound frames go.
    pub events: EventSink,
    /// Cancelled when the owner closes the channel.
    pub close: CancellationToken,
}

/// Inbound event publisher, cloneable across a transport's I/O tasks.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    /// Decode a text frame and publish it. Returns `false` once the owner
    /// has dropped the channel.
    pub fn deliver_text(&self, raw: &str) -> bool {
        trace!(frame = raw, "inbound frame");
        let event = match Envelope::decode(raw) {
            Ok(envelope) => ChannelEvent::Message(envelope),
            Err(e) => ChannelEvent::Malformed {
                raw: raw.to_owned(),
                error: e.to_string(),
            },
        };
        self.tx.send(event).is_ok()
    }

    /// Publish an already-parsed JSON frame.
    pub fn deliver_value(&self, value: Value) -> bool {
        let event = match serde_json::from_value::<Envelope>(value.clone()) {
            Ok(envelope) => ChannelEvent::Message(envelope),
            Err(e) => ChannelEvent::Malformed {
                raw: value.to_string(),
                error: e.to_string(),
            },
        };
        self.tx.send(event).is_ok()
    }

    /// Publish a decoded envelope.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(ChannelEvent::Message(envelope)).is_ok()
    }

    /// Report that the channel is gone.
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ChannelEvent::Closed {
            reason: reason.into(),
        });
    }

    /// Whether the owner has dropped the receiving half.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a connected (`Channel`, `ChannelDriver`) pair.
pub fn channel_pair(kind: TransportKind) -> (Channel, ChannelDriver) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let close = CancellationToken::new();
    let channel = Channel {
        sender: ChannelSender {
            kind,
            outbound: outbound_tx,
            close: close.clone(),
        },
        events: events_rx,
    };
    let driver = ChannelDriver {
        outbound: outbound_rx,
        events: EventSink { tx: events_tx },
        close,
    };
    (channel, driver)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// Opens channels of one transport kind.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport kind this connector produces.
    fn kind(&self) -> TransportKind;

    /// Open a channel. The negotiator bounds this with its own timeout.
    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError>;
}

/// HTTP client shared by the HTTP-based connectors.
pub(crate) fn http_client(connect_timeout: Duration) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(CLIENT_NAME)
        .build()
        .map_err(|e| TransportError::Connect(format!("failed to build HTTP client: {e}")))
}

/// Network connectors for the configured transport order.
///
/// `memory` has no network implementation and is skipped with a warning.
pub fn default_connectors(
    config: &ConnectionConfig,
) -> Result<Vec<Arc<dyn Connector>>, TransportError> {
    let client = http_client(config.connect_timeout)?;
    let connectors = config
        .transports
        .iter()
        .filter_map(|kind| -> Option<Arc<dyn Connector>> {
            match kind {
                TransportKind::WebSocket => Some(Arc::new(websocket::WebSocketConnector::new())),
                TransportKind::LongPollStreaming => Some(Arc::new(
                    streaming::StreamingConnector::new(client.clone()),
                )),
                TransportKind::LongPoll => {
                    Some(Arc::new(long_poll::LongPollConnector::new(client.clone())))
                }
                TransportKind::Memory => {
                    warn!(transport = %kind, "no network connector for transport, skipping");
                    None
                }
            }
        })
        .collect();
    Ok(connectors)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(server: &str, token: Option<&str>) -> Endpoint {
        Endpoint::new(server, "/realtime", TenantId::from("T1"), token.map(String::from)).unwrap()
    }

    #[test]
    fn http_url_carries_tenant_and_token() {
        let url = endpoint("http://pos.local:3000", Some("s3cret")).http_url("stream");
        assert_eq!(
            url.as_str(),
            "http://pos.local:3000/realtime/stream?tenantId=T1&token=s3cret"
        );
    }

    #[test]
    fn http_url_keeps_server_path_prefix() {
        let url = endpoint("https://pos.example.com/api/", None).http_url("/poll/open");
        assert_eq!(
            url.as_str(),
            "https://pos.example.com/api/realtime/poll/open?tenantId=T1"
        );
    }

    #[test]
    fn ws_url_swaps_scheme() {
        let plain = endpoint("http://pos.local", None).ws_url("ws").unwrap();
        assert_eq!(plain.scheme(), "ws");
        let secure = endpoint("https://pos.local", None).ws_url("ws").unwrap();
        assert_eq!(secure.scheme(), "wss");
        assert_eq!(secure.path(), "/realtime/ws");
    }

    #[test]
    fn rejects_non_http_server() {
        let err = Endpoint::new("ftp://pos", "/realtime", TenantId::from("T1"), None).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(Endpoint::new("not a url", "/realtime", TenantId::from("T1"), None).is_err());
    }

    #[test]
    fn bearer_header() {
        assert_eq!(
            endpoint("http://pos", Some("abc")).bearer().as_deref(),
            Some("Bearer abc")
        );
        assert!(endpoint("http://pos", None).bearer().is_none());
    }

    #[tokio::test]
    async fn pair_routes_both_directions() {
        let (mut channel, mut driver) = channel_pair(TransportKind::Memory);
        channel.sender.send(Envelope::ping(1)).unwrap();
        assert_eq!(driver.outbound.recv().await, Some(Envelope::ping(1)));

        assert!(driver.events.deliver_text(r#"{"event":"pong","data":{"seq":1}}"#));
        assert_eq!(
            channel.events.recv().await,
            Some(ChannelEvent::Message(Envelope::pong(1)))
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_reported() {
        let (mut channel, driver) = channel_pair(TransportKind::Memory);
        assert!(driver.events.deliver_text("{oops"));
        assert!(driver.events.deliver_value(json!({"data": 1})));
        assert!(matches!(
            channel.events.recv().await,
            Some(ChannelEvent::Malformed { .. })
        ));
        assert!(matches!(
            channel.events.recv().await,
            Some(ChannelEvent::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (channel, driver) = channel_pair(TransportKind::Memory);
        let sender = channel.sender.clone();
        channel.close();
        assert!(driver.close.is_cancelled());
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(Envelope::ping(1)),
            Err(TransportError::Closed(_))
        ));
    }

    #[test]
    fn default_connectors_follow_order() {
        let mut config = ConnectionConfig::default();
        config.transports = vec![
            TransportKind::LongPoll,
            TransportKind::Memory,
            TransportKind::WebSocket,
        ];
        let kinds: Vec<_> = default_connectors(&config)
            .unwrap()
            .iter()
            .map(|c| c.kind())
            .collect();
        assert_eq!(kinds, vec![TransportKind::LongPoll, TransportKind::WebSocket]);
    }

    #[test]
    fn memory_only_config_yields_no_connectors() {
        let mut config = ConnectionConfig::default();
        config.transports = vec![TransportKind::Memory];
        assert!(default_connectors(&config).unwrap().is_empty());
    }

    #[test]
    fn http_client_builds_with_timeout() {
        assert!(http_client(Duration::from_millis(250)).is_ok());
    }
}
