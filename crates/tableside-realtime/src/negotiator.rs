//! Ordered transport negotiation.
//!
//! Connectors are tried strictly in configured order, each bounded by the
//! per-attempt timeout. Every step is recorded as a [`TransportAttempt`];
//! the first success wins and later connectors are not touched.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tableside_core::{TransportAttempt, TransportKind};

use crate::errors::TransportError;
use crate::transport::{Channel, Connector, Endpoint};

/// Successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    /// The winning channel.
    pub channel: Channel,
    /// Attempt history up to and including the winner.
    pub attempts: Vec<TransportAttempt>,
}

/// Every connector failed (or negotiation was cancelled).
#[derive(Debug)]
pub struct NegotiationFailure {
    /// Full attempt history.
    pub attempts: Vec<TransportAttempt>,
    /// Whether negotiation stopped because the cancel token fired.
    pub cancelled: bool,
}

/// Tries connectors in order until one opens.
pub struct TransportNegotiator {
    connectors: Vec<Arc<dyn Connector>>,
    attempt_timeout: Duration,
}

impl TransportNegotiator {
    /// Create a negotiator over `connectors` in preference order.
    pub fn new(connectors: Vec<Arc<dyn Connector>>, attempt_timeout: Duration) -> Self {
        Self {
            connectors,
            attempt_timeout,
        }
    }

    /// Configured transport order.
    pub fn order(&self) -> Vec<TransportKind> {
        self.connectors.iter().map(|c| c.kind()).collect()
    }

    /// Open the first transport that succeeds.
    pub async fn negotiate(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Negotiated, NegotiationFailure> {
        let mut attempts = Vec::with_capacity(self.connectors.len() * 2);

        for connector in &self.connectors {
            let kind = connector.kind();
            attempts.push(TransportAttempt::attempting(kind));
            debug!(transport = %kind, tenant = %endpoint.tenant(), "trying transport");

            let result = tokio::select! {
                () = cancel.cancelled() => {
                    attempts.push(TransportAttempt::failed(kind, "cancelled"));
                    return Err(NegotiationFailure { attempts, cancelled: true });
                }
                result = tokio::time::timeout(self.attempt_timeout, connector.open(endpoint)) => {
                    result.unwrap_or(Err(TransportError::Timeout(self.attempt_timeout)))
                }
            };

            match result {
                Ok(channel) => {
                    attempts.push(TransportAttempt::connected(kind));
                    info!(transport = %kind, tenant = %endpoint.tenant(), "transport established");
                    return Ok(Negotiated { channel, attempts });
                }
                Err(e) => {
                    warn!(transport = %kind, tenant = %endpoint.tenant(), error = %e, "transport failed");
                    attempts.push(TransportAttempt::failed(kind, e.to_string()));
                }
            }
        }

        Err(NegotiationFailure {
            attempts,
            cancelled: false,
        })
    }
}

/// Transports in the order they were tried.
pub fn tried_transports(attempts: &[TransportAttempt]) -> Vec<TransportKind> {
    attempts
        .iter()
        .filter(|a| a.outcome == tableside_core::AttemptOutcome::Attempting)
        .map(|a| a.transport)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
