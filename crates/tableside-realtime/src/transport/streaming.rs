//! Streaming long-poll transport: server-sent events in, HTTP POST out.
//!
//! `GET <prefix>/stream` stays open and yields one envelope per `data:`
//! line. Outbound envelopes are posted to `<prefix>/emit`. The reader and
//! writer run as separate tasks so a slow POST never stalls inbound frames.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tableside_core::TransportKind;

use super::sse::parse_sse_lines;
use super::{Channel, ChannelDriver, Connector, Endpoint, EventSink, channel_pair};
use crate::errors::{TransportError, redact_url};
use crate::protocol::Envelope;

/// Path suffix of the event stream.
pub const STREAM_SUFFIX: &str = "stream";
/// Path suffix for outbound envelopes on the HTTP transports.
pub const EMIT_SUFFIX: &str = "emit";

/// Opens SSE-backed channels.
#[derive(Clone, Debug)]
pub struct StreamingConnector {
    client: reqwest::Client,
}

impl StreamingConnector {
    /// Create the connector on a shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for StreamingConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPollStreaming
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let url = endpoint.http_url(STREAM_SUFFIX);
        let mut request = self.client.get(url.clone()).header(ACCEPT, "text/event-stream");
        if let Some(bearer) = endpoint.bearer() {
            request = request.header(AUTHORIZATION, bearer);
        }
        let response = request.send().await?.error_for_status()?;
        debug!(url = %redact_url(&url), "event stream opened");

        let (channel, driver) = channel_pair(TransportKind::LongPollStreaming);
        let ChannelDriver {
            outbound,
            events,
            close,
        } = driver;

        drop(tokio::spawn(post_loop(
            self.client.clone(),
            endpoint.clone(),
            outbound,
            events.clone(),
            close.clone(),
        )));
        drop(tokio::spawn(async move {
            let mut lines = Box::pin(parse_sse_lines(response.bytes_stream()));
            let reason = loop {
                tokio::select! {
                    () = close.cancelled() => break "closed by client".to_string(),
                    line = lines.next() => match line {
                        Some(data) => {
                            if !events.deliver_text(&data) {
                                break "receiver dropped".to_string();
                            }
                        }
                        None => break "event stream ended".to_string(),
                    }
                }
            };
            // Stop the writer too.
            close.cancel();
            debug!(reason = %reason, "event stream closed");
            events.closed(reason);
        }));

        Ok(channel)
    }
}

/// Post queued envelopes one at a time, in order.
///
/// Shared by the streaming and plain long-poll transports. A failed POST
/// closes the channel.
pub(crate) async fn post_loop(
    client: reqwest::Client,
    endpoint: Endpoint,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    events: EventSink,
    close: CancellationToken,
) {
    let url = endpoint.http_url(EMIT_SUFFIX);
    loop {
        let envelope = tokio::select! {
            () = close.cancelled() => return,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    close.cancel();
                    return;
                }
            },
        };

        trace!(event = %envelope.event, "outbound post");
        let mut request = client.post(url.clone()).json(&envelope);
        if let Some(bearer) = endpoint.bearer() {
            request = request.header(AUTHORIZATION, bearer);
        }
        let result = tokio::select! {
            () = close.cancelled() => return,
            result = request.send() => result.and_then(reqwest::Response::error_for_status),
        };
        if let Err(e) = result {
            let err = TransportError::from(e);
            warn!(event = %envelope.event, error = %err, "emit POST failed, closing channel");
            close.cancel();
            events.closed(format!("emit failed: {err}"));
            return;
        }
    }
}
