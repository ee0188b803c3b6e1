//! Tenant-scoped notification subscriptions.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use tableside_core::{Notification, SubscriptionId, TenantId};

/// Listener invoked for every matching notification.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Entry {
    id: SubscriptionId,
    tenant: TenantId,
    event: Option<String>,
    callback: NotificationCallback,
}

/// A subscription matched for one notification, detached from the registry.
#[derive(Clone)]
pub struct Matched {
    /// Subscription the callback belongs to.
    pub id: SubscriptionId,
    /// The listener.
    pub callback: NotificationCallback,
}

impl std::fmt::Debug for Matched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matched").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Subscription summary for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Tenant it listens to.
    pub tenant: TenantId,
    /// Raw event filter, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Tenant → listeners, in subscription order.
///
/// Subscriptions stay registered until [`unsubscribe`](Self::unsubscribe);
/// dropping a [`SubscriptionId`] does nothing.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every notification for `tenant`.
    pub fn subscribe(&self, tenant: TenantId, callback: NotificationCallback) -> SubscriptionId {
        self.insert(tenant, None, callback)
    }

    /// Listen to notifications for `tenant` that arrived on `event`.
    pub fn subscribe_event(
        &self,
        tenant: TenantId,
        event: impl Into<String>,
        callback: NotificationCallback,
    ) -> SubscriptionId {
        self.insert(tenant, Some(event.into()), callback)
    }

    fn insert(
        &self,
        tenant: TenantId,
        event: Option<String>,
        callback: NotificationCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        debug!(subscription = %id, tenant = %tenant, event = ?event, "subscribed");
        self.entries.write().push(Entry {
            id: id.clone(),
            tenant,
            event,
            callback,
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.id != id);
        let removed = entries.len() != before;
        if removed {
            debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Snapshot of the listeners for `event` on `tenant`.
    ///
    /// The lock is released before returning, so callbacks may subscribe or
    /// unsubscribe while the snapshot is being delivered.
    pub fn matching(&self, tenant: &TenantId, event: &str) -> Vec<Matched> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.tenant == tenant && e.event.as_deref().is_none_or(|f| f == event))
            .map(|e| Matched {
                id: e.id.clone(),
                callback: Arc::clone(&e.callback),
            })
            .collect()
    }

    /// Registered subscriptions, in order.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| SubscriptionInfo {
                id: e.id.clone(),
                tenant: e.tenant.clone(),
                event: e.event.clone(),
            })
            .collect()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of subscriptions for `tenant`.
    pub fn tenant_count(&self, tenant: &TenantId) -> usize {
        self.entries.read().iter().filter(|e| &e.tenant == tenant).count()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}
