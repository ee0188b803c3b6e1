//! Out-of-band backend health probe.
//!
//! Consulted once reconnection is exhausted, to tell "our network is flaky"
//! (`FAILED`) apart from "the backend is down" (`SERVER_DOWN`).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::redact_url;

/// Checks whether the backend is reachable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when the backend answered healthy within the probe timeout.
    async fn check(&self) -> bool;
}

/// `GET <server>/<path>`; healthy on any 2xx within the timeout.
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: reqwest::Url,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Probe `url` with `timeout`.
    pub fn new(client: reqwest::Client, url: reqwest::Url, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }

    /// URL being probed.
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> bool {
        let result = self
            .client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url = %redact_url(&self.url), "health probe ok");
                true
            }
            Ok(response) => {
                warn!(url = %redact_url(&self.url), status = response.status().as_u16(), "health probe unhealthy");
                false
            }
            Err(e) => {
                warn!(url = %redact_url(&self.url), error = %e.without_url(), "health probe failed");
                false
            }
        }
    }
}
