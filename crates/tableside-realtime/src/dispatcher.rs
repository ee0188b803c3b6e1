//! Inbound notification validation and fan-out.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};

use tableside_core::{Notification, RejectReason, TenantId};

use crate::diagnostics::Diagnostics;
use crate::registry::SubscriptionRegistry;

/// What happened to one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Validated and handed to the tenant's subscribers.
    Delivered {
        /// Tenant the notification was routed to.
        tenant: TenantId,
        /// Callbacks invoked (including ones that panicked).
        subscribers: usize,
        /// Callbacks that panicked.
        panicked: usize,
    },
    /// Failed validation; nothing was delivered.
    Rejected(RejectReason),
    /// Valid, but neither the payload nor the connection named a tenant.
    Unrouted,
}

/// Validates payloads and delivers them to matching subscriptions.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    registry: Arc<SubscriptionRegistry>,
    diagnostics: Arc<Diagnostics>,
}

impl NotificationDispatcher {
    /// Create a dispatcher over a shared registry and diagnostics sink.
    pub fn new(registry: Arc<SubscriptionRegistry>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            registry,
            diagnostics,
        }
    }

    /// Validate `payload` received on `event` and fan it out.
    ///
    /// Routing uses the payload's `restaurantId` when present, else
    /// `connection_tenant`. Subscribers run sequentially on the calling task
    /// over a snapshot of the registry. A panicking subscriber is logged and
    /// skipped; the rest still run.
    pub fn dispatch(
        &self,
        event: &str,
        payload: &Value,
        connection_tenant: Option<&TenantId>,
    ) -> DispatchOutcome {
        let notification = match Notification::from_payload(event, payload, Utc::now()) {
            Ok(n) => n,
            Err(reason) => {
                warn!(event, reason = %reason, "rejected inbound notification");
                self.diagnostics.record_rejected(event, reason.to_string());
                return DispatchOutcome::Rejected(reason);
            }
        };

        let Some(tenant) = notification
            .restaurant_id
            .clone()
            .or_else(|| connection_tenant.cloned())
        else {
            warn!(event, order_id = notification.order_id, "notification has no tenant to route to");
            self.diagnostics.record_rejected(event, "no tenant to route to");
            return DispatchOutcome::Unrouted;
        };

        let matched = self.registry.matching(&tenant, event);
        debug!(
            event,
            tenant = %tenant,
            order_id = notification.order_id,
            order_status = %notification.order_status,
            subscribers = matched.len(),
            "dispatching notification"
        );

        let mut panicked = 0;
        for m in &matched {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (m.callback)(&notification))) {
                panicked += 1;
                error!(
                    subscription = %m.id,
                    tenant = %tenant,
                    event,
                    panic = panic_message(payload.as_ref()),
                    "notification subscriber panicked"
                );
            }
        }

        self.diagnostics.record_notification(notification);
        DispatchOutcome::Delivered {
            tenant,
            subscribers: matched.len(),
            panicked,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use serde_json::json;
    use tableside_core::OrderStatus;
    use tableside_settings::DiagnosticsSettings;

    fn setup() -> (Arc<SubscriptionRegistry>, Arc<Diagnostics>, NotificationDispatcher) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let diagnostics = Arc::new(Diagnostics::new(&DiagnosticsSettings::default()));
        let dispatcher = NotificationDispatcher::new(Arc::clone(&registry), Arc::clone(&diagnostics));
        (registry, diagnostics, dispatcher)
    }

    fn recorder() -> (Arc<Mutex<Vec<Notification>>>, crate::registry::NotificationCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |n: &Notification| sink.lock().push(n.clone())))
    }

    #[test]
    fn fans_out_to_tenant_subscribers_only() {
        let (registry, _diag, dispatcher) = setup();
        let (a, cb_a) = recorder();
        let (b, cb_b) = recorder();
        let (other, cb_other) = recorder();
        let _ = registry.subscribe(TenantId::from("T1"), cb_a);
        let _ = registry.subscribe(TenantId::from("T1"), cb_b);
        let _ = registry.subscribe(TenantId::from("T2"), cb_other);

        let payload = json!({"orderId": 42, "orderStatus": "NEW_ORDER", "tableId": 7});
        let outcome = dispatcher.dispatch("order_notification", &payload, Some(&TenantId::from("T1")));

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                tenant: TenantId::from("T1"),
                subscribers: 2,
                panicked: 0,
            }
        );
        for seen in [&a, &b] {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].order_id, 42);
            assert_eq!(seen[0].order_status, OrderStatus::NewOrder);
            assert_eq!(seen[0].table_id, Some(7));
        }
        assert!(other.lock().is_empty());
    }

    #[test]
    fn restaurant_id_overrides_connection_tenant() {
        let (registry, _diag, dispatcher) = setup();
        let (t2, cb) = recorder();
        let _ = registry.subscribe(TenantId::from("T2"), cb);

        let payload = json!({"orderId": 1, "orderStatus": "DISH_UPDATE", "restaurantId": "T2"});
        let outcome = dispatcher.dispatch("dish", &payload, Some(&TenantId::from("T1")));
        assert_matches!(outcome, DispatchOutcome::Delivered { ref tenant, .. } if tenant.as_str() == "T2");
        assert_eq!(t2.lock().len(), 1);
    }

    #[test]
    fn malformed_payload_is_rejected_and_recorded() {
        let (registry, diag, dispatcher) = setup();
        let (seen, cb) = recorder();
        let _ = registry.subscribe(TenantId::from("T1"), cb);

        let outcome = dispatcher.dispatch(
            "order_notification",
            &json!({"orderStatus": "NEW_ORDER"}),
            Some(&TenantId::from("T1")),
        );
        assert_eq!(outcome, DispatchOutcome::Rejected(RejectReason::MissingField("orderId")));
        assert!(seen.lock().is_empty());

        let rejected = diag.rejected();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].event, "order_notification");
        assert!(diag.notifications().is_empty());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let (_registry, diag, dispatcher) = setup();
        let outcome = dispatcher.dispatch(
            "e",
            &json!({"orderId": 1, "orderStatus": "SOMETHING_ELSE"}),
            Some(&TenantId::from("T1")),
        );
        assert_matches!(outcome, DispatchOutcome::Rejected(RejectReason::UnknownOrderStatus(_)));
        assert_eq!(diag.rejected().len(), 1);
    }

    #[test]
    fn no_tenant_is_unrouted() {
        let (_registry, diag, dispatcher) = setup();
        let outcome = dispatcher.dispatch("e", &json!({"orderId": 1, "orderStatus": "NEW_ORDER"}), None);
        assert_eq!(outcome, DispatchOutcome::Unrouted);
        assert_eq!(diag.rejected()[0].reason, "no tenant to route to");
    }

    #[test]
    fn panicking_subscriber_is_contained() {
        let (registry, _diag, dispatcher) = setup();
        let tenant = TenantId::from("T1");
        let _ = registry.subscribe(tenant.clone(), Arc::new(|_| panic!("boom")));
        let (seen, cb) = recorder();
        let _ = registry.subscribe(tenant.clone(), cb);

        let outcome = dispatcher.dispatch(
            "e",
            &json!({"orderId": 3, "orderStatus": "PAYMENT_UPDATE"}),
            Some(&tenant),
        );
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                tenant,
                subscribers: 2,
                panicked: 1,
            }
        );
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn delivered_notifications_land_in_ring_buffer() {
        let (_registry, diag, dispatcher) = setup();
        let _ = dispatcher.dispatch(
            "e",
            &json!({"orderId": 9, "orderStatus": "TABLE_STATUS_UPDATE", "tableState": "FREE"}),
            Some(&TenantId::from("T1")),
        );
        let recent = diag.notifications();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].table_state.as_deref(), Some("FREE"));
    }

    #[test]
    fn rejection_and_panic_are_logged() {
        let (logs, _guard) = tableside_core::logging::capture_logs();
        let (registry, _diag, dispatcher) = setup();
        let _ = registry.subscribe(TenantId::from("T1"), Arc::new(|_| panic!("widget crashed")));

        let _ = dispatcher.dispatch("e", &json!([1, 2]), Some(&TenantId::from("T1")));
        let _ = dispatcher.dispatch(
            "e",
            &json!({"orderId": 1, "orderStatus": "NEW_ORDER"}),
            Some(&TenantId::from("T1")),
        );

        assert!(logs.has_event(tracing::Level::WARN, "rejected inbound notification"));
        let panicked = logs
            .events()
            .into_iter()
            .find(|e| e.message.contains("subscriber panicked"))
            .unwrap();
        assert_eq!(panicked.level, tracing::Level::ERROR);
        assert_eq!(panicked.field("panic"), Some("widget crashed"));
        assert_eq!(panicked.field("tenant"), Some("T1"));
    }

    #[test]
    fn panic_message_extracts_text() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
