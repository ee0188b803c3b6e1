//! The connection manager.
//!
//! [`ConnectionManager`] owns the lifecycle state machine and drives the
//! negotiator, heartbeat and reconnection scheduler for one tenant session
//! at a time.
//!
//! ## Sessions and epochs
//!
//! Every `connect()` and `disconnect()` starts a new epoch and a fresh
//! session [`CancellationToken`]. Reader, heartbeat, timer and probe tasks
//! carry the epoch they were spawned in and are children of that token, so
//! results arriving after a teardown are discarded instead of applied.
//!
//! ## Locking
//!
//! Session state sits behind a `parking_lot` mutex that is never held across
//! an `.await` or while user callbacks run. A reentrant gate serializes
//! "apply transition + queue status change". Only the outermost transition
//! drains the queue, so a callback that triggers another transition (for
//! example by calling `disconnect()`) sees it delivered after the current
//! one, and every listener observes the same order. An async `flow` mutex
//! keeps at most one negotiation in flight.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tableside_core::{
    CallbackId, ConnectionState, ConnectionStats, Notification, SubscriptionId, TenantId,
    TransportAttempt, TransportKind,
};

use crate::config::ConnectionConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::dispatcher::NotificationDispatcher;
use crate::errors::{RealtimeError, Result, TransportError};
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::heartbeat::{HeartbeatEvent, HeartbeatResult, run_heartbeat};
use crate::negotiator::{TransportNegotiator, tried_transports};
use crate::protocol::{Envelope, events};
use crate::reconnect::ReconnectionScheduler;
use crate::registry::SubscriptionRegistry;
use crate::state_machine::{StateChange, Trigger, transition};
use crate::transport::{
    Channel, ChannelEvent, ChannelSender, Connector, Endpoint, default_connectors, http_client,
};

/// Listener for applied state transitions.
pub type StatusCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

type AckReply = std::result::Result<Value, String>;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a [`ConnectionManager`] with custom connectors or health probe.
pub struct ConnectionManagerBuilder {
    config: ConnectionConfig,
    connectors: Option<Vec<Arc<dyn Connector>>>,
    health: Option<Option<Arc<dyn HealthProbe>>>,
}

impl ConnectionManagerBuilder {
    /// Use these connectors, in order, instead of the configured network ones.
    #[must_use]
    pub fn connectors(mut self, connectors: Vec<Arc<dyn Connector>>) -> Self {
        self.connectors = Some(connectors);
        self
    }

    /// Use this health probe instead of the configured HTTP probe.
    #[must_use]
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(Some(probe));
        self
    }

    /// Never probe; exhausted reconnection stays `FAILED`.
    #[must_use]
    pub fn without_health_probe(mut self) -> Self {
        self.health = Some(None);
        self
    }

    /// Build the manager in `DISCONNECTED`.
    ///
    /// Fails with [`RealtimeError::NoTransports`] when no connector is left
    /// to negotiate with.
    pub fn build(self) -> Result<ConnectionManager> {
        let config = self.config;
        let connectors = match self.connectors {
            Some(connectors) => connectors,
            None => default_connectors(&config)?,
        };
        if connectors.is_empty() {
            return Err(RealtimeError::NoTransports(config.transports.clone()));
        }
        let health = match self.health {
            Some(probe) => probe,
            None => default_health_probe(&config)?,
        };
        Ok(ConnectionManager {
            inner: Arc::new(Inner::new(config, connectors, health)),
        })
    }
}

fn default_health_probe(config: &ConnectionConfig) -> Result<Option<Arc<dyn HealthProbe>>> {
    let Some(health) = &config.health else {
        return Ok(None);
    };
    let mut url = reqwest::Url::parse(&config.server_url)
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", config.server_url)))?;
    url.set_path(&health.path);
    url.set_query(None);
    let probe = HttpHealthProbe::new(http_client(config.connect_timeout)?, url, health.timeout);
    Ok(Some(Arc::new(probe)))
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionManager
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps one realtime channel alive and fans out its notifications.
///
/// Cheap to clone; clones share the same connection. The connection is torn
/// down when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("tenant", &self.tenant())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager with the network connectors and health probe from `config`.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a manager.
    pub fn builder(config: ConnectionConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            connectors: None,
            health: None,
        }
    }

    /// Connect to the backend as `tenant`.
    ///
    /// - Already connected to the same tenant: no-op.
    /// - Connected to another tenant: the old session is torn down first.
    /// - `RECONNECTING` for the same tenant: the pending timer is cancelled,
    ///   the attempt counter reset and a retry made immediately. Returns
    ///   `Ok` even if that retry fails; the scheduler keeps going.
    /// - Otherwise a new session starts. If every transport fails the
    ///   manager moves to `RECONNECTING` and this call returns
    ///   [`RealtimeError::NegotiationFailed`]; later failures surface only
    ///   through status callbacks.
    /// - A `disconnect()` or tenant switch that lands before the session is
    ///   up (including while the join ack is pending) makes this call
    ///   return [`RealtimeError::Superseded`].
    pub async fn connect(&self, tenant: &str) -> Result<()> {
        let tenant =
            TenantId::parse(tenant).ok_or_else(|| RealtimeError::InvalidTenant(tenant.to_owned()))?;
        self.inner.connect(tenant).await
    }

    /// Tear down the session and return to `DISCONNECTED`.
    ///
    /// Closes the channel, cancels the reconnect timer and heartbeat, fails
    /// pending acks and resets stats. No-op when already disconnected.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Disconnect, then connect to `tenant` with a zeroed attempt counter.
    pub async fn force_reconnect(&self, tenant: &str) -> Result<()> {
        let tenant =
            TenantId::parse(tenant).ok_or_else(|| RealtimeError::InvalidTenant(tenant.to_owned()))?;
        info!(tenant = %tenant, "forced reconnect");
        self.inner.disconnect();
        self.inner.connect(tenant).await
    }

    /// Send `event` and wait for the server's ack payload.
    ///
    /// Fails with [`RealtimeError::NotConnected`] unless the state is
    /// `CONNECTED` or `AUTHENTICATED`. Never retried.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<Value> {
        self.inner
            .request(event, payload, self.inner.config.ack_timeout)
            .await
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    /// Tenant of the current session.
    pub fn tenant(&self) -> Option<TenantId> {
        self.inner.session.lock().tenant()
    }

    /// Stats snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.session.lock().stats.clone()
    }

    /// Receiver that always holds the latest state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Call `callback` after every applied transition, in order.
    pub fn add_status_callback(
        &self,
        callback: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = CallbackId::new();
        self.inner
            .status_callbacks
            .write()
            .push((id.clone(), Arc::new(callback)));
        id
    }

    /// Remove a status callback. Returns `false` if it was not registered.
    pub fn remove_status_callback(&self, id: &CallbackId) -> bool {
        let mut callbacks = self.inner.status_callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| cid != id);
        callbacks.len() != before
    }

    /// Listen to every notification for `tenant`.
    pub fn subscribe(
        &self,
        tenant: TenantId,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.registry.subscribe(tenant, Arc::new(callback))
    }

    /// Listen to notifications for `tenant` that arrived on `event`.
    pub fn subscribe_event(
        &self,
        tenant: TenantId,
        event: &str,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner
            .registry
            .subscribe_event(tenant, event, Arc::new(callback))
    }

    /// Remove a subscription. Never affects the connection.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    /// Diagnostics snapshot.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let (state, tenant, stats, reconnect_pending) = {
            let session = self.inner.session.lock();
            (
                session.state,
                session.tenant(),
                session.stats.clone(),
                session.scheduler.has_pending(),
            )
        };
        DiagnosticsSnapshot {
            state,
            tenant,
            stats,
            reconnect_pending,
            recent_notifications: self.inner.diagnostics.notifications(),
            transport_attempts: self.inner.diagnostics.attempts(),
            rejected_messages: self.inner.diagnostics.rejected(),
            subscriptions: self.inner.registry.list(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session state
// ─────────────────────────────────────────────────────────────────────────────

struct ActiveChannel {
    id: u64,
    sender: ChannelSender,
    cancel: CancellationToken,
}

struct Session {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    epoch: u64,
    cancel: CancellationToken,
    channel: Option<ActiveChannel>,
    channel_seq: u64,
    scheduler: ReconnectionScheduler,
    stats: ConnectionStats,
}

impl Session {
    fn tenant(&self) -> Option<TenantId> {
        self.endpoint.as_ref().map(|e| e.tenant().clone())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn owns_channel(&self, epoch: u64, channel_id: u64) -> bool {
        self.epoch == epoch && self.channel.as_ref().is_some_and(|c| c.id == channel_id)
    }

    /// Start a new epoch with a fresh token, cancelling the old one.
    fn new_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch
    }

    fn take_channel(&mut self) -> Option<TransportKind> {
        let channel = self.channel.take()?;
        channel.cancel.cancel();
        channel.sender.close();
        Some(channel.sender.kind())
    }
}

struct Inner {
    config: ConnectionConfig,
    negotiator: TransportNegotiator,
    health: Option<Arc<dyn HealthProbe>>,
    session: Mutex<Session>,
    /// Set while the outermost transition is delivering queued changes.
    gate: ReentrantMutex<Cell<bool>>,
    status_queue: Mutex<VecDeque<StateChange>>,
    flow: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    status_callbacks: RwLock<Vec<(CallbackId, StatusCallback)>>,
    registry: Arc<SubscriptionRegistry>,
    diagnostics: Arc<Diagnostics>,
    dispatcher: NotificationDispatcher,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<AckReply>>>,
    next_ack_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        session.cancel.cancel();
        let _ = session.take_channel();
    }
}

impl Inner {
    fn new(
        config: ConnectionConfig,
        connectors: Vec<Arc<dyn Connector>>,
        health: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let diagnostics = Arc::new(Diagnostics::new(&config.diagnostics));
        let dispatcher = NotificationDispatcher::new(Arc::clone(&registry), Arc::clone(&diagnostics));
        let negotiator = TransportNegotiator::new(connectors, config.connect_timeout);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let session = Session {
            state: ConnectionState::Disconnected,
            endpoint: None,
            epoch: 0,
            cancel: CancellationToken::new(),
            channel: None,
            channel_seq: 0,
            scheduler: ReconnectionScheduler::new(config.backoff.clone()),
            stats: ConnectionStats::new(config.backoff.max_attempts),
        };
        Self {
            config,
            negotiator,
            health,
            session: Mutex::new(session),
            gate: ReentrantMutex::new(Cell::new(false)),
            status_queue: Mutex::new(VecDeque::new()),
            flow: tokio::sync::Mutex::new(()),
            state_tx,
            status_callbacks: RwLock::new(Vec::new()),
            registry,
            diagnostics,
            dispatcher,
            pending_acks: Mutex::new(HashMap::new()),
            next_ack_id: AtomicU64::new(0),
        }
    }

    // ── transitions ─────────────────────────────────────────────────────────

    /// Apply `trigger` if the table allows it and `guard` agrees.
    ///
    /// `guard` runs under the session lock after the target is known and may
    /// update the session alongside the state. Status callbacks fire after
    /// the lock is released, in FIFO order; when called from inside a
    /// callback the change is queued behind the one being delivered.
    fn transition_if(
        &self,
        trigger: Trigger,
        guard: impl FnOnce(&mut Session) -> bool,
    ) -> Option<StateChange> {
        let delivering = self.gate.lock();
        let (change, tenant) = {
            let mut session = self.session.lock();
            let from = session.state;
            let to = transition(from, trigger)?;
            let tenant = session.tenant();
            if !guard(&mut *session) {
                return None;
            }
            session.state = to;
            (StateChange { from, to, trigger }, tenant.or_else(|| session.tenant()))
        };

        let _ = self.state_tx.send_replace(change.to);
        info!(
            from = %change.from,
            to = %change.to,
            trigger = %trigger,
            tenant = tenant.as_ref().map_or("-", TenantId::as_str),
            "connection state changed"
        );
        self.status_queue.lock().push_back(change);
        if !delivering.replace(true) {
            self.drain_status();
            delivering.set(false);
        }
        Some(change)
    }

    fn drain_status(&self) {
        loop {
            let next = self.status_queue.lock().pop_front();
            let Some(change) = next else {
                return;
            };
            self.fire_status(&change);
        }
    }

    fn fire_status(&self, change: &StateChange) {
        let callbacks: Vec<(CallbackId, StatusCallback)> = self.status_callbacks.read().clone();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                error!(callback = %id, to = %change.to, "status callback panicked");
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session.lock().is_current(epoch)
    }

    // ── connect / disconnect ────────────────────────────────────────────────

    async fn connect(self: &Arc<Self>, tenant: TenantId) -> Result<()> {
        let _flow = self.flow.lock().await;

        let (state, current, epoch) = {
            let session = self.session.lock();
            (session.state, session.tenant(), session.epoch)
        };

        if current.as_ref() == Some(&tenant) {
            match state {
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Authenticated => {
                    debug!(tenant = %tenant, state = %state, "already connected");
                    return Ok(());
                }
                ConnectionState::Reconnecting => {
                    info!(tenant = %tenant, "explicit connect while reconnecting, retrying now");
                    let target = {
                        let mut session = self.session.lock();
                        session.scheduler.reset();
                        session.stats.reconnect_attempts = 0;
                        session.endpoint.clone().map(|e| (e, session.cancel.clone()))
                    };
                    if let Some((endpoint, cancel)) = target {
                        self.reconnect_now(epoch, endpoint, cancel).await;
                    }
                    return Ok(());
                }
                _ => {}
            }
        } else if state != ConnectionState::Disconnected {
            info!(
                from = current.as_ref().map_or("-", TenantId::as_str),
                to = %tenant,
                "switching tenant"
            );
            self.disconnect();
        }

        self.start_session(tenant).await
    }

    async fn start_session(self: &Arc<Self>, tenant: TenantId) -> Result<()> {
        let endpoint = Endpoint::from_config(&self.config, tenant.clone())?;

        let mut started = None;
        let _ = self.transition_if(Trigger::Connect, |session| {
            let epoch = session.new_epoch();
            session.endpoint = Some(endpoint.clone());
            session.scheduler.reset();
            session.stats.reset();
            started = Some((epoch, session.cancel.clone()));
            true
        });
        let Some((epoch, cancel)) = started else {
            return Err(RealtimeError::Superseded);
        };

        match self.negotiator.negotiate(&endpoint, &cancel).await {
            Ok(negotiated) => {
                self.diagnostics.record_attempts(negotiated.attempts.iter().cloned());
                let tried = tried_transports(&negotiated.attempts);
                if !self.install_channel(epoch, negotiated.channel, tried) {
                    return Err(RealtimeError::Superseded);
                }
                self.handshake(epoch, &tenant).await;
                if !self.is_current(epoch) {
                    return Err(RealtimeError::Superseded);
                }
                Ok(())
            }
            Err(failure) => {
                self.diagnostics.record_attempts(failure.attempts.iter().cloned());
                if failure.cancelled || !self.is_current(epoch) {
                    return Err(RealtimeError::Superseded);
                }
                let tried = tried_transports(&failure.attempts);
                let change = self.transition_if(Trigger::TransportsExhausted, |session| {
                    session.stats.attempted_transports = tried;
                    session.is_current(epoch)
                });
                if change.is_none() {
                    return Err(RealtimeError::Superseded);
                }
                warn!(
                    tenant = %tenant,
                    failures = %describe_attempts(&failure.attempts),
                    "all transports failed on first attempt"
                );
                self.schedule_reconnect(epoch);
                Err(RealtimeError::NegotiationFailed {
                    attempts: failure.attempts,
                })
            }
        }
    }

    fn disconnect(&self) {
        let mut closed = None;
        let change = self.transition_if(Trigger::Disconnect, |session| {
            let _ = session.new_epoch();
            closed = session.take_channel();
            session.scheduler.reset();
            session.stats.reset();
            session.endpoint = None;
            true
        });
        if change.is_some() {
            self.fail_pending_acks();
            debug!(transport = ?closed, "session torn down");
        }
    }

    // ── channel lifecycle ───────────────────────────────────────────────────

    /// Make `channel` the active one and start its reader and heartbeat.
    /// Returns `false` (and closes the channel) if the epoch moved on.
    fn install_channel(
        self: &Arc<Self>,
        epoch: u64,
        channel: Channel,
        tried: Vec<TransportKind>,
    ) -> bool {
        let Channel { sender, events } = channel;
        let kind = sender.kind();

        let mut installed = None;
        let _ = self.transition_if(Trigger::TransportEstablished, |session| {
            if !session.is_current(epoch) {
                return false;
            }
            session.channel_seq += 1;
            let channel_cancel = session.cancel.child_token();
            session.channel = Some(ActiveChannel {
                id: session.channel_seq,
                sender: sender.clone(),
                cancel: channel_cancel.clone(),
            });
            session.scheduler.reset();
            session.stats.mark_channel_up(kind);
            session.stats.reconnect_attempts = 0;
            session.stats.attempted_transports = tried;
            installed = Some((session.channel_seq, channel_cancel, session.tenant()));
            true
        });

        let Some((channel_id, channel_cancel, Some(tenant))) = installed else {
            debug!(transport = %kind, "discarding channel from a stale session");
            sender.close();
            return false;
        };

        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(read_loop(
            Arc::downgrade(self),
            ChannelContext {
                epoch,
                channel_id,
                tenant,
                sender: sender.clone(),
                pongs: pong_tx,
            },
            events,
            channel_cancel.clone(),
        )));

        let weak = Arc::downgrade(self);
        let heartbeat = self.config.heartbeat;
        drop(tokio::spawn(async move {
            let events_weak = weak.clone();
            let result = run_heartbeat(sender, pong_rx, heartbeat, channel_cancel, move |event| {
                if let Some(inner) = events_weak.upgrade() {
                    inner.on_heartbeat(epoch, channel_id, event);
                }
            })
            .await;
            if let HeartbeatResult::TimedOut { missed } = result {
                if let Some(inner) = weak.upgrade() {
                    warn!(missed, "heartbeat threshold reached");
                    inner.on_channel_lost(epoch, channel_id, "heartbeat timeout");
                }
            }
        }));

        true
    }

    async fn handshake(self: &Arc<Self>, epoch: u64, tenant: &TenantId) {
        let payload = Envelope::join_payload(tenant);
        match self
            .request(events::JOIN, payload, self.config.handshake_timeout)
            .await
        {
            Ok(_) => {
                let _ = self.transition_if(Trigger::HandshakeAcked, |session| session.is_current(epoch));
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "tenant handshake failed, staying connected");
            }
        }
    }

    fn on_heartbeat(&self, epoch: u64, channel_id: u64, event: HeartbeatEvent) {
        let mut session = self.session.lock();
        if !session.owns_channel(epoch, channel_id) {
            return;
        }
        match event {
            HeartbeatEvent::Ping { seq } => {
                session.stats.messages_sent += 1;
                trace!(seq, "heartbeat ping");
            }
            HeartbeatEvent::Pong { seq, rtt } => {
                session.stats.missed_heartbeats = 0;
                session.stats.latency_ms = Some(rtt.as_secs_f64() * 1000.0);
                session.stats.last_heartbeat_at = Some(Utc::now());
                trace!(seq, rtt_ms = rtt.as_millis(), "heartbeat pong");
            }
            HeartbeatEvent::Missed { seq, consecutive } => {
                session.stats.missed_heartbeats = consecutive;
                debug!(seq, consecutive, "heartbeat missed");
            }
        }
    }

    fn on_channel_lost(self: &Arc<Self>, epoch: u64, channel_id: u64, reason: &str) {
        let mut lost = None;
        let _ = self.transition_if(Trigger::ChannelLost, |session| {
            if !session.owns_channel(epoch, channel_id) {
                return false;
            }
            lost = session.take_channel();
            session.stats.mark_channel_lost();
            true
        });
        if let Some(kind) = lost {
            warn!(transport = %kind, reason, "channel lost");
            self.fail_pending_acks();
            self.schedule_reconnect(epoch);
        }
    }

    // ── reconnection ────────────────────────────────────────────────────────

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64) {
        let armed = {
            let mut guard = self.session.lock();
            let session = &mut *guard;
            if !session.is_current(epoch) || session.state != ConnectionState::Reconnecting {
                return;
            }
            if session.scheduler.is_exhausted() {
                None
            } else {
                let delay = session.scheduler.next_delay();
                let token = session.scheduler.arm(&session.cancel);
                Some((delay, token, session.scheduler.attempts() + 1))
            }
        };

        let Some((delay, token, attempt)) = armed else {
            self.give_up(epoch);
            return;
        };

        info!(attempt, delay_ms = delay.as_millis(), "reconnect scheduled");
        let weak = Arc::downgrade(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.retry(epoch, token).await;
            }
        }));
    }

    async fn retry(self: &Arc<Self>, epoch: u64, token: CancellationToken) {
        let _flow = self.flow.lock().await;
        let target = {
            let mut session = self.session.lock();
            if token.is_cancelled()
                || !session.is_current(epoch)
                || session.state != ConnectionState::Reconnecting
            {
                return;
            }
            session.scheduler.clear_pending();
            session.endpoint.clone().map(|e| (e, session.cancel.clone()))
        };
        if let Some((endpoint, cancel)) = target {
            self.reconnect_now(epoch, endpoint, cancel).await;
        }
    }

    async fn reconnect_now(self: &Arc<Self>, epoch: u64, endpoint: Endpoint, cancel: CancellationToken) {
        match self.negotiator.negotiate(&endpoint, &cancel).await {
            Ok(negotiated) => {
                self.diagnostics.record_attempts(negotiated.attempts.iter().cloned());
                let tried = tried_transports(&negotiated.attempts);
                if self.install_channel(epoch, negotiated.channel, tried) {
                    info!(tenant = %endpoint.tenant(), "reconnected");
                    self.handshake(epoch, endpoint.tenant()).await;
                }
            }
            Err(failure) => {
                self.diagnostics.record_attempts(failure.attempts.iter().cloned());
                if failure.cancelled {
                    return;
                }
                let tried = tried_transports(&failure.attempts);
                let attempts = {
                    let mut session = self.session.lock();
                    if !session.is_current(epoch) || session.state != ConnectionState::Reconnecting {
                        return;
                    }
                    let attempts = session.scheduler.record_failure();
                    session.stats.reconnect_attempts = attempts;
                    session.stats.attempted_transports = tried;
                    attempts
                };
                warn!(
                    tenant = %endpoint.tenant(),
                    attempt = attempts,
                    max_attempts = self.config.backoff.max_attempts,
                    "reconnect attempt failed"
                );
                self.schedule_reconnect(epoch);
            }
        }
    }

    /// Reconnection is exhausted: go `FAILED`, then probe the backend.
    fn give_up(self: &Arc<Self>, epoch: u64) {
        let mut session_cancel = None;
        let change = self.transition_if(Trigger::AttemptsExhausted, |session| {
            if !session.is_current(epoch) {
                return false;
            }
            session.scheduler.cancel_pending();
            session_cancel = Some(session.cancel.clone());
            true
        });
        if change.is_none() {
            return;
        }
        let stats = self.session.lock().stats.clone();
        error!(
            attempts = stats.reconnect_attempts,
            max_attempts = stats.max_reconnect_attempts,
            "reconnection exhausted, giving up"
        );

        let (Some(probe), Some(cancel)) = (self.health.clone(), session_cancel) else {
            return;
        };
        let weak = Arc::downgrade(self);
        drop(tokio::spawn(async move {
            let healthy = tokio::select! {
                () = cancel.cancelled() => return,
                healthy = probe.check() => healthy,
            };
            if healthy {
                info!("backend reachable, staying FAILED");
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let _ = inner.transition_if(Trigger::HealthProbeFailed, |session| session.is_current(epoch));
            }
        }));
    }

    // ── requests and acks ───────────────────────────────────────────────────

    async fn request(&self, event: &str, data: Value, timeout: Duration) -> Result<Value> {
        let sender = {
            let session = self.session.lock();
            let sender = session
                .channel
                .as_ref()
                .filter(|_| session.state.is_live())
                .map(|c| c.sender.clone());
            sender.ok_or(RealtimeError::NotConnected {
                state: session.state,
            })?
        };

        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let _ = self.pending_acks.lock().insert(ack_id, tx);

        if let Err(e) = sender.send(Envelope::with_ack(event, data, ack_id)) {
            let _ = self.pending_acks.lock().remove(&ack_id);
            debug!(event, error = %e, "send failed");
            return Err(RealtimeError::ChannelClosed);
        }
        self.session.lock().stats.messages_sent += 1;
        trace!(event, ack_id, "awaiting ack");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(RealtimeError::AckRejected {
                event: event.to_owned(),
                reason,
            }),
            Ok(Err(_)) => Err(RealtimeError::ChannelClosed),
            Err(_) => {
                let _ = self.pending_acks.lock().remove(&ack_id);
                Err(RealtimeError::AckTimeout {
                    event: event.to_owned(),
                    timeout,
                })
            }
        }
    }

    fn resolve_ack(&self, envelope: Envelope) {
        let Some(ack_id) = envelope.ack_id else {
            debug!("ack without id ignored");
            return;
        };
        let Some(tx) = self.pending_acks.lock().remove(&ack_id) else {
            debug!(ack_id, "ack for unknown or expired request");
            return;
        };
        let reply = match envelope.error {
            Some(error) => Err(error),
            None => Ok(envelope.data),
        };
        let _ = tx.send(reply);
    }

    fn fail_pending_acks(&self) {
        let pending = std::mem::take(&mut *self.pending_acks.lock());
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending acks");
        }
    }

    // ── inbound ─────────────────────────────────────────────────────────────

    fn handle_envelope(&self, ctx: &ChannelContext, envelope: Envelope) {
        {
            let mut session = self.session.lock();
            if !session.owns_channel(ctx.epoch, ctx.channel_id) {
                return;
            }
            session.stats.messages_received += 1;
        }

        match envelope.event.as_str() {
            events::PONG => {
                if let Some(seq) = envelope.seq() {
                    let _ = ctx.pongs.send(seq);
                }
            }
            events::PING => {
                if let Some(seq) = envelope.seq() {
                    if ctx.sender.send(Envelope::pong(seq)).is_ok() {
                        self.session.lock().stats.messages_sent += 1;
                    }
                }
            }
            events::ACK => self.resolve_ack(envelope),
            events::JOIN => debug!("unexpected join from server ignored"),
            _ => {
                let _ = self
                    .dispatcher
                    .dispatch(&envelope.event, &envelope.data, Some(&ctx.tenant));
            }
        }
    }
}

/// What a reader task knows about the channel it serves.
struct ChannelContext {
    epoch: u64,
    channel_id: u64,
    tenant: TenantId,
    sender: ChannelSender,
    pongs: mpsc::UnboundedSender<u64>,
}

/// Drain one channel's events until it closes or is cancelled.
async fn read_loop(
    weak: Weak<Inner>,
    ctx: ChannelContext,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            Some(ChannelEvent::Message(envelope)) => inner.handle_envelope(&ctx, envelope),
            Some(ChannelEvent::Malformed { raw, error }) => {
                let preview: String = raw.chars().take(120).collect();
                warn!(frame = %preview, error = %error, "malformed frame dropped");
                inner
                    .diagnostics
                    .record_rejected("", format!("malformed frame: {error}"));
            }
            Some(ChannelEvent::Closed { reason }) => break reason,
            None => break "transport task ended".to_string(),
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.on_channel_lost(ctx.epoch, ctx.channel_id, &reason);
    }
}

/// `transport: reason` for every failed attempt.
fn describe_attempts(attempts: &[TransportAttempt]) -> String {
    attempts
        .iter()
        .filter_map(|a| {
            a.reason
                .as_ref()
                .map(|reason| format!("{}: {reason}", a.transport))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn manager(connectors: Vec<Arc<dyn Connector>>) -> ConnectionManager {
        let mut config = ConnectionConfig::default();
        config.server_url = "http://memory.test".into();
        ConnectionManager::builder(config)
            .connectors(connectors)
            .without_health_probe()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let m = manager(vec![Arc::new(MemoryConnector::new(TransportKind::Memory))]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.stats().max_reconnect_attempts, 10);
        assert!(m.tenant().is_none());
    }

    #[tokio::test]
    async fn blank_tenant_rejected() {
        let m = manager(vec![Arc::new(MemoryConnector::new(TransportKind::Memory))]);
        let err = m.connect("   ").await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidTenant(_)));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_authenticates() {
        let connector = Arc::new(MemoryConnector::new(TransportKind::Memory));
        let m = manager(vec![connector.clone()]);
        m.connect("T1").await.unwrap();
        assert_eq!(m.state(), ConnectionState::Authenticated);
        assert_eq!(m.tenant(), Some(TenantId::from("T1")));
        let stats = m.stats();
        assert!(stats.is_connected);
        assert_eq!(stats.current_transport, Some(TransportKind::Memory));
        assert_eq!(stats.messages_sent, 1);
    }

    #[tokio::test]
    async fn emit_while_disconnected_fails() {
        let m = manager(vec![Arc::new(MemoryConnector::new(TransportKind::Memory))]);
        let err = m.emit("order:update", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn bad_server_url_fails_before_transition() {
        let mut config = ConnectionConfig::default();
        config.server_url = "nope".into();
        let m = ConnectionManager::builder(config)
            .connectors(vec![Arc::new(MemoryConnector::new(TransportKind::Memory))])
            .without_health_probe()
            .build()
            .unwrap();
        let err = m.connect("T1").await.unwrap_err();
        assert!(matches!(err, RealtimeError::Transport(TransportError::InvalidUrl(_))));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn memory_only_config_has_no_transports() {
        let mut config = ConnectionConfig::default();
        config.transports = vec![TransportKind::Memory];
        let err = ConnectionManager::new(config).unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::NoTransports(ref kinds) if kinds == &[TransportKind::Memory]
        ));

        let err = ConnectionManager::builder(ConnectionConfig::default())
            .connectors(Vec::new())
            .without_health_probe()
            .build()
            .unwrap_err();
        assert!(matches!(err, RealtimeError::NoTransports(_)));
    }

    #[test]
    fn default_probe_targets_health_path() {
        let mut config = ConnectionConfig::default();
        config.server_url = "http://pos.local:3000/api?x=1".into();
        assert!(default_health_probe(&config).unwrap().is_some());
        config.health = None;
        assert!(default_health_probe(&config).unwrap().is_none());
    }

    #[test]
    fn describe_attempts_lists_failures() {
        let attempts = vec![
            TransportAttempt::attempting(TransportKind::WebSocket),
            TransportAttempt::failed(TransportKind::WebSocket, "refused"),
            TransportAttempt::attempting(TransportKind::LongPoll),
            TransportAttempt::failed(TransportKind::LongPoll, "timeout"),
        ];
        assert_eq!(describe_attempts(&attempts), "websocket: refused; long-poll: timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_manager_closes_channel() {
        let connector = Arc::new(MemoryConnector::new(TransportKind::Memory));
        let m = manager(vec![connector.clone()]);
        m.connect("T1").await.unwrap();
        let peer = connector.next_peer().await.unwrap();
        drop(m);
        peer.closed().await;
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn refused_first_connect_reports_attempts() {
        let connector = Arc::new(MemoryConnector::refusing(TransportKind::Memory, "down"));
        let m = manager(vec![connector]);
        let err = m.connect("T1").await.unwrap_err();
        let RealtimeError::NegotiationFailed { attempts } = err else {
            panic!("expected NegotiationFailed");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        m.disconnect();
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }
}
