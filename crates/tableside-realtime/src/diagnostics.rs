//! Bounded in-memory diagnostics.
//!
//! Three ring buffers: recent notifications, transport attempt history and
//! rejected inbound messages. Nothing here is persisted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use tableside_core::{ConnectionState, ConnectionStats, Notification, TenantId, TransportAttempt};
use tableside_settings::DiagnosticsSettings;

use crate::registry::SubscriptionInfo;

/// Fixed-capacity FIFO that evicts the oldest entry when full.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (0 stores nothing).
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append, evicting the oldest item if full.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            let _ = self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Items oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// An inbound message that was not delivered.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedMessage {
    /// Event name, or empty for undecodable frames.
    pub event: String,
    /// Why it was rejected.
    pub reason: String,
    /// When it arrived.
    pub at: DateTime<Utc>,
}

/// Ring buffers shared by the manager, reader task and dispatcher.
#[derive(Debug)]
pub struct Diagnostics {
    notifications: Mutex<RingBuffer<Notification>>,
    attempts: Mutex<RingBuffer<TransportAttempt>>,
    rejected: Mutex<RingBuffer<RejectedMessage>>,
}

impl Diagnostics {
    /// Create buffers with the configured capacities.
    pub fn new(settings: &DiagnosticsSettings) -> Self {
        Self {
            notifications: Mutex::new(RingBuffer::new(settings.notification_buffer_size)),
            attempts: Mutex::new(RingBuffer::new(settings.attempt_history_size)),
            rejected: Mutex::new(RingBuffer::new(settings.rejected_buffer_size)),
        }
    }

    /// Record a delivered notification.
    pub fn record_notification(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }

    /// Record transport attempts, oldest first.
    pub fn record_attempts(&self, attempts: impl IntoIterator<Item = TransportAttempt>) {
        let mut buffer = self.attempts.lock();
        for attempt in attempts {
            buffer.push(attempt);
        }
    }

    /// Record a rejected inbound message.
    pub fn record_rejected(&self, event: impl Into<String>, reason: impl Into<String>) {
        self.rejected.lock().push(RejectedMessage {
            event: event.into(),
            reason: reason.into(),
            at: Utc::now(),
        });
    }

    /// Recent notifications, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().to_vec()
    }

    /// Transport attempt history, oldest first.
    pub fn attempts(&self) -> Vec<TransportAttempt> {
        self.attempts.lock().to_vec()
    }

    /// Rejected messages, oldest first.
    pub fn rejected(&self) -> Vec<RejectedMessage> {
        self.rejected.lock().to_vec()
    }
}

/// Point-in-time view of the connection for operators and support.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Tenant of the current session.
    pub tenant: Option<TenantId>,
    /// Stats at snapshot time.
    pub stats: ConnectionStats,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Recent notifications, oldest first.
    pub recent_notifications: Vec<Notification>,
    /// Transport attempt history, oldest first.
    pub transport_attempts: Vec<TransportAttempt>,
    /// Rejected inbound messages, oldest first.
    pub rejected_messages: Vec<RejectedMessage>,
    /// Registered subscriptions.
    pub subscriptions: Vec<SubscriptionInfo>,
}
