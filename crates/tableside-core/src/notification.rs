//! Typed domain notifications and their validation schema.
//!
//! Inbound payloads are untyped JSON. [`Notification::from_payload`] is the
//! single boundary that turns one into a [`Notification`]: `orderId` must be
//! an integer and `orderStatus` one of the known [`OrderStatus`] variants, or
//! the payload is rejected with a [`RejectReason`]. Optional fields are
//! best-effort: a missing or mistyped optional field becomes `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::TenantId;

/// Kind of state change a notification announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// A new order was placed.
    NewOrder,
    /// A dish in an order changed state.
    DishUpdate,
    /// A payment was registered or changed.
    PaymentUpdate,
    /// A table changed state.
    TableStatusUpdate,
    /// Closing an order with outstanding debt needs approval.
    DebtValidationRequest,
    /// The debt closure was approved.
    DebtValidationApproved,
    /// The debt closure was rejected.
    DebtValidationRejected,
    /// The order was closed leaving a debt.
    OrderClosedWithDebt,
}

impl OrderStatus {
    /// All variants in declaration order.
    pub const ALL: [OrderStatus; 8] = [
        Self::NewOrder,
        Self::DishUpdate,
        Self::PaymentUpdate,
        Self::TableStatusUpdate,
        Self::DebtValidationRequest,
        Self::DebtValidationApproved,
        Self::DebtValidationRejected,
        Self::OrderClosedWithDebt,
    ];

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewOrder => "NEW_ORDER",
            Self::DishUpdate => "DISH_UPDATE",
            Self::PaymentUpdate => "PAYMENT_UPDATE",
            Self::TableStatusUpdate => "TABLE_STATUS_UPDATE",
            Self::DebtValidationRequest => "DEBT_VALIDATION_REQUEST",
            Self::DebtValidationApproved => "DEBT_VALIDATION_APPROVED",
            Self::DebtValidationRejected => "DEBT_VALIDATION_REJECTED",
            Self::OrderClosedWithDebt => "ORDER_CLOSED_WITH_DEBT",
        }
    }

    /// Look up a status by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound payload was not turned into a [`Notification`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// The payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,
    /// A required field is absent or null.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// A required field has the wrong JSON type.
    #[error("field '{field}' must be {expected}")]
    WrongType {
        /// Field name.
        field: &'static str,
        /// Expected JSON type.
        expected: &'static str,
    },
    /// `orderStatus` is a string but not a known variant.
    #[error("unknown orderStatus '{0}'")]
    UnknownOrderStatus(String),
}

/// A validated domain event (order, table or payment state change).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Raw event name the payload arrived on.
    pub event: String,
    /// Tenant the backend addressed the event to, if it said so.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<TenantId>,
    /// Order the event is about.
    pub order_id: i64,
    /// Table of the order, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<i64>,
    /// Kind of change.
    pub order_status: OrderStatus,
    /// New order or dish state label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,
    /// New table state label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_state: Option<String>,
    /// Backend timestamp, or receipt time when absent or unparseable.
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Validate an inbound payload.
    ///
    /// `received_at` is used when the payload carries no usable `timestamp`.
    pub fn from_payload(
        event: &str,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<Self, RejectReason> {
        let object = payload.as_object().ok_or(RejectReason::NotAnObject)?;

        let order_id = match object.get("orderId") {
            None | Some(Value::Null) => return Err(RejectReason::MissingField("orderId")),
            Some(value) => value.as_i64().ok_or(RejectReason::WrongType {
                field: "orderId",
                expected: "an integer",
            })?,
        };

        let order_status = match object.get("orderStatus") {
            None | Some(Value::Null) => return Err(RejectReason::MissingField("orderStatus")),
            Some(Value::String(name)) => OrderStatus::from_wire(name)
                .ok_or_else(|| RejectReason::UnknownOrderStatus(name.clone()))?,
            Some(_) => {
                return Err(RejectReason::WrongType {
                    field: "orderStatus",
                    expected: "a string",
                });
            }
        };

        let timestamp = object
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(received_at, |dt| dt.with_timezone(&Utc));

        Ok(Self {
            event: event.to_owned(),
            restaurant_id: object.get("restaurantId").and_then(tenant_from_value),
            order_id,
            table_id: object.get("tableId").and_then(Value::as_i64),
            order_status,
            new_state: optional_string(object.get("newState")),
            table_state: optional_string(object.get("tableState")),
            timestamp,
        })
    }
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_owned)
}

/// Tenant IDs are sent either as strings or as bare numbers.
fn tenant_from_value(value: &Value) -> Option<TenantId> {
    match value {
        Value::String(s) => TenantId::parse(s),
        Value::Number(n) => Some(TenantId::from_string(n.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use serde_json::json;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_full_payload() {
        let payload = json!({
            "orderId": 42,
            "orderStatus": "NEW_ORDER",
            "tableId": 7,
            "newState": "PENDING",
            "timestamp": "2024-01-01T10:00:00Z"
        });
        let n = Notification::from_payload("order_notification", &payload, received()).unwrap();
        assert_eq!(n.order_id, 42);
        assert_eq!(n.table_id, Some(7));
        assert_eq!(n.order_status, OrderStatus::NewOrder);
        assert_eq!(n.new_state.as_deref(), Some("PENDING"));
        assert_eq!(n.event, "order_notification");
        assert_eq!(
            n.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn missing_order_id_rejected() {
        let payload = json!({"orderStatus": "DISH_UPDATE"});
        assert_eq!(
            Notification::from_payload("e", &payload, received()),
            Err(RejectReason::MissingField("orderId"))
        );
    }

    #[test]
    fn null_order_status_rejected() {
        let payload = json!({"orderId": 1, "orderStatus": null});
        assert_eq!(
            Notification::from_payload("e", &payload, received()),
            Err(RejectReason::MissingField("orderStatus"))
        );
    }

    #[test]
    fn string_order_id_rejected() {
        let payload = json!({"orderId": "42", "orderStatus": "NEW_ORDER"});
        assert_matches!(
            Notification::from_payload("e", &payload, received()),
            Err(RejectReason::WrongType { field: "orderId", .. })
        );
    }

    #[test]
    fn numeric_order_status_rejected() {
        let payload = json!({"orderId": 1, "orderStatus": 3});
        assert_matches!(
            Notification::from_payload("e", &payload, received()),
            Err(RejectReason::WrongType { field: "orderStatus", .. })
        );
    }

    #[test]
    fn unknown_order_status_rejected() {
        let payload = json!({"orderId": 1, "orderStatus": "DESSERT_FLAMBE"});
        assert_eq!(
            Notification::from_payload("e", &payload, received()),
            Err(RejectReason::UnknownOrderStatus("DESSERT_FLAMBE".into()))
        );
    }

    #[test]
    fn non_object_rejected() {
        assert_eq!(
            Notification::from_payload("e", &json!([1, 2]), received()),
            Err(RejectReason::NotAnObject)
        );
    }

    #[test]
    fn missing_timestamp_uses_receipt_time() {
        let payload = json!({"orderId": 5, "orderStatus": "PAYMENT_UPDATE"});
        let n = Notification::from_payload("e", &payload, received()).unwrap();
        assert_eq!(n.timestamp, received());
    }

    #[test]
    fn garbage_timestamp_uses_receipt_time() {
        let payload = json!({"orderId": 5, "orderStatus": "PAYMENT_UPDATE", "timestamp": "yesterday"});
        let n = Notification::from_payload("e", &payload, received()).unwrap();
        assert_eq!(n.timestamp, received());
    }

    #[test]
    fn mistyped_optionals_become_none() {
        let payload = json!({
            "orderId": 5,
            "orderStatus": "TABLE_STATUS_UPDATE",
            "tableId": "seven",
            "tableState": 3
        });
        let n = Notification::from_payload("e", &payload, received()).unwrap();
        assert!(n.table_id.is_none());
        assert!(n.table_state.is_none());
    }

    #[test]
    fn restaurant_id_accepts_numbers_and_strings() {
        let numeric = json!({"orderId": 1, "orderStatus": "NEW_ORDER", "restaurantId": 17});
        let n = Notification::from_payload("e", &numeric, received()).unwrap();
        assert_eq!(n.restaurant_id, Some(TenantId::from("17")));

        let text = json!({"orderId": 1, "orderStatus": "NEW_ORDER", "restaurantId": "T1"});
        let n = Notification::from_payload("e", &text, received()).unwrap();
        assert_eq!(n.restaurant_id, Some(TenantId::from("T1")));
    }

    #[test]
    fn every_status_roundtrips_through_wire_name() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::from_wire(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn reject_reason_display() {
        let err = RejectReason::MissingField("orderId");
        assert_eq!(err.to_string(), "missing required field 'orderId'");
    }
}
