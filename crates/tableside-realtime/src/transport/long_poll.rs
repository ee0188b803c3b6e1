//! Plain long-poll transport.
//!
//! `POST <prefix>/poll/open` registers the client and may return a session
//! id (`{"sid": "..."}`). The poller then loops on `GET <prefix>/poll`, each
//! response a JSON array of envelopes (`204 No Content` or `[]` when idle).
//! Outbound envelopes go to `POST <prefix>/emit`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tracing::{debug, warn};

use tableside_core::TransportKind;

use super::streaming::post_loop;
use super::{Channel, ChannelDriver, Connector, Endpoint, channel_pair};
use crate::errors::{TransportError, redact_url};

/// Path suffix of the poll registration.
pub const OPEN_SUFFIX: &str = "poll/open";
/// Path suffix of the poll request.
pub const POLL_SUFFIX: &str = "poll";
/// Server-side hold time is expected to stay below this.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(40);

/// Opens long-poll channels.
#[derive(Clone, Debug)]
pub struct LongPollConnector {
    client: reqwest::Client,
    poll_timeout: Duration,
}

impl LongPollConnector {
    /// Create the connector on a shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Override the per-poll request timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for LongPollConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let open_url = endpoint.http_url(OPEN_SUFFIX);
        let mut request = self.client.post(open_url.clone());
        if let Some(bearer) = endpoint.bearer() {
            request = request.header(AUTHORIZATION, bearer);
        }
        let response = request.send().await?.error_for_status()?;
        let sid = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("sid").and_then(Value::as_str).map(str::to_owned));
        debug!(url = %redact_url(&open_url), has_sid = sid.is_some(), "long-poll session opened");

        let mut poll_url = endpoint.http_url(POLL_SUFFIX);
        if let Some(sid) = &sid {
            let _ = poll_url.query_pairs_mut().append_pair("sid", sid);
        }

        let (channel, driver) = channel_pair(TransportKind::LongPoll);
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

        let client = self.client.clone();
        let bearer = endpoint.bearer();
        let poll_timeout = self.poll_timeout;
        drop(tokio::spawn(async move {
            let reason = loop {
                let mut request = client.get(poll_url.clone()).timeout(poll_timeout);
                if let Some(bearer) = &bearer {
                    request = request.header(AUTHORIZATION, bearer);
                }
                let result = tokio::select! {
                    () = close.cancelled() => break "closed by client".to_string(),
                    result = poll_once(request) => result,
                };
                match result {
                    Ok(frames) => {
                        if frames.into_iter().any(|frame| !events.deliver_value(frame)) {
                            break "receiver dropped".to_string();
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "long-poll request failed");
                        break format!("poll failed: {e}");
                    }
                }
            };
            close.cancel();
            debug!(reason = %reason, "long-poll channel closed");
            events.closed(reason);
        }));

        Ok(channel)
    }
}

/// One poll round trip.
async fn poll_once(request: reqwest::RequestBuilder) -> Result<Vec<Value>, TransportError> {
    let response = request.send().await?.error_for_status()?;
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    match response.json::<Value>().await? {
        Value::Array(frames) => Ok(frames),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}
