//! Gateway request/response structs and status interpretation.

use crate::protocol::notification::string_or_number;
use crate::TollgateError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hosted checkout transaction request.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    /// Order and amount.
    pub transaction_details: TransactionDetails,
    /// Payment methods offered at checkout, e.g. `["gopay"]`.
    pub enabled_payments: Vec<String>,
    /// Line items.
    pub item_details: Vec<ItemDetail>,
    /// Buyer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_details: Option<CustomerDetails>,
}

/// Order id and amount.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionDetails {
    /// Merchant order id.
    pub order_id: String,
    /// Amount in whole currency units.
    pub gross_amount: i64,
}

/// One purchased item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDetail {
    /// Item id (plan id).
    pub id: String,
    /// Unit price.
    pub price: i64,
    /// Quantity.
    pub quantity: u32,
    /// Display name.
    pub name: String,
}

/// Buyer contact.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerDetails {
    /// Email address.
    pub email: String,
}

/// Hosted checkout transaction handle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChargeResponse {
    /// Transaction token for the client SDK.
    pub token: String,
    /// Hosted payment page.
    pub redirect_url: String,
}

/// Authoritative transaction status returned by the status query.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionStatus {
    /// `"200"`/`"201"` on success.
    #[serde(deserialize_with = "string_or_number")]
    pub status_code: String,
    /// Human-readable message.
    #[serde(default)]
    pub status_message: Option<String>,
    /// Merchant order id.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Gateway transaction id.
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Raw status string.
    #[serde(default)]
    pub transaction_status: Option<String>,
    /// Fraud screening verdict.
    #[serde(default)]
    pub fraud_status: Option<String>,
    /// e.g. `"gopay"`.
    #[serde(default)]
    pub payment_type: Option<String>,
    /// Amount.
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub gross_amount: Option<String>,
    /// When the payment settled.
    #[serde(default)]
    pub settlement_time: Option<String>,
    /// The full JSON body.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl TransactionStatus {
    /// Parse a status body, keeping the raw JSON for auditing.
    pub fn from_json(body: &[u8]) -> Result<Self, TollgateError> {
        let raw: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
            TollgateError::ProtocolError(format!("Failed to parse gateway status: {}", e))
        })?;
        let mut status: TransactionStatus = serde_json::from_value(raw.clone()).map_err(|e| {
            TollgateError::ProtocolError(format!("Malformed gateway status: {}", e))
        })?;
        status.raw = raw;
        Ok(status)
    }

    /// Whether the query itself succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code.as_str(), "200" | "201")
    }

    /// Interpreted transaction status.
    pub fn gateway_status(&self) -> GatewayStatus {
        GatewayStatus::parse(self.transaction_status.as_deref().unwrap_or_default())
    }

    /// What this status means for the subscription.
    pub fn effect(&self) -> StatusEffect {
        self.gateway_status().effect(self.fraud_status.as_deref())
    }
}

/// Gateway transaction status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Card payment captured.
    Capture,
    /// Funds settled.
    Settlement,
    /// Awaiting payment.
    Pending,
    /// Card authorized, not captured.
    Authorize,
    /// Rejected by the gateway or bank.
    Deny,
    /// Cancelled.
    Cancel,
    /// Payment window elapsed.
    Expire,
    /// Processing failure.
    Failure,
    /// Fully refunded.
    Refund,
    /// Partially refunded.
    PartialRefund,
    /// Anything else; recorded but not acted on.
    Unknown(String),
}

impl GatewayStatus {
    /// Parse a `transaction_status` string.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "capture" => Self::Capture,
            "settlement" => Self::Settlement,
            "pending" => Self::Pending,
            "authorize" => Self::Authorize,
            "deny" => Self::Deny,
            "cancel" => Self::Cancel,
            "expire" => Self::Expire,
            "failure" => Self::Failure,
            "refund" => Self::Refund,
            "partial_refund" => Self::PartialRefund,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Effect on the subscription. A capture under fraud review does not activate.
    pub fn effect(&self, fraud_status: Option<&str>) -> StatusEffect {
        match self {
            Self::Settlement => StatusEffect::Activate,
            Self::Capture => match fraud_status {
                None | Some("accept") => StatusEffect::Activate,
                Some(_) => StatusEffect::NoChange,
            },
            Self::Deny
            | Self::Cancel
            | Self::Expire
            | Self::Failure
            | Self::Refund
            | Self::PartialRefund => StatusEffect::Deactivate,
            Self::Pending | Self::Authorize | Self::Unknown(_) => StatusEffect::NoChange,
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Capture => "capture",
            Self::Settlement => "settlement",
            Self::Pending => "pending",
            Self::Authorize => "authorize",
            Self::Deny => "deny",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
            Self::Failure => "failure",
            Self::Refund => "refund",
            Self::PartialRefund => "partial_refund",
            Self::Unknown(other) => other.as_str(),
        };
        f.write_str(s)
    }
}

/// Subscription consequence of a gateway status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEffect {
    /// Payment confirmed.
    Activate,
    /// Payment will not complete.
    Deactivate,
    /// Nothing to do yet.
    NoChange,
}

/// Refund request body.
#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    /// Idempotency key for the refund.
    pub refund_key: String,
    /// Free-text reason.
    pub reason: String,
}

/// Refund response.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundResponse {
    /// `"200"` on success.
    #[serde(deserialize_with = "string_or_number")]
    pub status_code: String,
    /// Human-readable message.
    #[serde(default)]
    pub status_message: Option<String>,
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    string_or_number(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_SETTLED: &str = r#"{
        "status_code": "200",
        "status_message": "Success, transaction is found",
        "transaction_id": "T1",
        "order_id": "SUB-1",
        "gross_amount": "30000.00",
        "payment_type": "gopay",
        "transaction_status": "settlement",
        "settlement_time": "2025-01-15 12:01:00"
    }"#;

    #[test]
    fn test_parse_status_keeps_raw() {
        let status = TransactionStatus::from_json(STATUS_SETTLED.as_bytes()).unwrap();
        assert!(status.is_success());
        assert_eq!(status.gateway_status(), GatewayStatus::Settlement);
        assert_eq!(status.effect(), StatusEffect::Activate);
        assert_eq!(status.raw["order_id"], "SUB-1");
        assert_eq!(status.gross_amount.as_deref(), Some("30000.00"));
    }

    #[test]
    fn test_not_found_status_is_not_success() {
        let body = r#"{"status_code":"404","status_message":"Transaction doesn't exist."}"#;
        let status = TransactionStatus::from_json(body.as_bytes()).unwrap();
        assert!(!status.is_success());
        assert_eq!(status.effect(), StatusEffect::NoChange);
    }

    #[test]
    fn test_status_effects() {
        assert_eq!(GatewayStatus::parse("deny").effect(None), StatusEffect::Deactivate);
        assert_eq!(GatewayStatus::parse("cancel").effect(None), StatusEffect::Deactivate);
        assert_eq!(GatewayStatus::parse("expire").effect(None), StatusEffect::Deactivate);
        assert_eq!(GatewayStatus::parse("refund").effect(None), StatusEffect::Deactivate);
        assert_eq!(GatewayStatus::parse("pending").effect(None), StatusEffect::NoChange);
        assert_eq!(GatewayStatus::parse("SETTLEMENT").effect(None), StatusEffect::Activate);
    }

    #[test]
    fn test_capture_under_review_does_not_activate() {
        assert_eq!(GatewayStatus::Capture.effect(Some("accept")), StatusEffect::Activate);
        assert_eq!(GatewayStatus::Capture.effect(Some("challenge")), StatusEffect::NoChange);
    }

    #[test]
    fn test_unknown_status_is_preserved() {
        let status = GatewayStatus::parse("chargeback");
        assert_eq!(status, GatewayStatus::Unknown("chargeback".to_string()));
        assert_eq!(status.to_string(), "chargeback");
    }

    #[test]
    fn test_charge_request_shape() {
        let request = ChargeRequest {
            transaction_details: TransactionDetails {
                order_id: "SUB-1".to_string(),
                gross_amount: 30000,
            },
            enabled_payments: vec!["gopay".to_string()],
            item_details: vec![],
            customer_details: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["transaction_details"]["gross_amount"], 30000);
        assert!(json.get("customer_details").is_none());
    }
}
