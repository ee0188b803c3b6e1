//! WebSocket transport.
//!
//! Connects to `ws(s)://<server>/<path>/ws?tenantId=..&token=..` with the
//! token also sent as `Authorization: Bearer`. Each text frame carries one
//! envelope. A single I/O task owns the socket and multiplexes outbound
//! envelopes, inbound frames and the close signal.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use tableside_core::TransportKind;

use super::{Channel, ChannelDriver, Connector, Endpoint, channel_pair};
use crate::errors::{TransportError, redact_url};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Path suffix of the WebSocket endpoint.
pub const WS_SUFFIX: &str = "ws";

/// Opens WebSocket channels.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create the connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let url = endpoint.ws_url(WS_SUFFIX)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(bearer) = endpoint.bearer() {
            let value = HeaderValue::from_str(&bearer)
                .map_err(|e| TransportError::Connect(format!("invalid auth token: {e}")))?;
            let _ = request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = connect_async(request).await?;
        debug!(
            url = %redact_url(&url),
            status = response.status().as_u16(),
            "websocket connected"
        );

        let (channel, driver) = channel_pair(TransportKind::WebSocket);
        drop(tokio::spawn(socket_loop(socket, driver)));
        Ok(channel)
    }
}

/// Pump frames between the socket and the channel until either side closes.
async fn socket_loop(socket: WsStream, driver: ChannelDriver) {
    let ChannelDriver {
        mut outbound,
        events,
        close,
    } = driver;
    let (mut write, mut read) = socket.split();

    let reason = loop {
        tokio::select! {
            () = close.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break "closed by client".to_string();
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = write.send(Message::Close(None)).await;
                    break "channel dropped".to_string();
                };
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(event = %envelope.event, error = %e, "failed to encode envelope, dropping");
                        continue;
                    }
                };
                trace!(event = %envelope.event, "outbound frame");
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    break format!("send failed: {e}");
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !events.deliver_text(text.as_str()) {
                        break "receiver dropped".to_string();
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    if !events.deliver_text(&text) {
                        break "receiver dropped".to_string();
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "server closed the connection".to_string(),
                        |f| format!("server closed the connection: {} {}", u16::from(f.code), f.reason.as_str()),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read failed: {e}"),
                None => break "connection reset".to_string(),
            }
        }
    };

    debug!(reason = %reason, "websocket channel closed");
    events.closed(reason);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tableside_core::TenantId;

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new(
            &format!("http://127.0.0.1:{port}"),
            "/realtime",
            TenantId::from("T1"),
            None,
        )
        .unwrap();
        let err = WebSocketConnector::new().open(&endpoint).await.unwrap_err();
        assert!(matches!(err, TransportError::WebSocket(_)));
    }

    #[test]
    fn kind_is_websocket() {
        assert_eq!(WebSocketConnector::new().kind(), TransportKind::WebSocket);
    }
}
