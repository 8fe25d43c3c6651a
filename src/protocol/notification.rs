//! Inbound payment notification payload.

use crate::crypto::signature::SignedFields;
use crate::TollgateError;
use serde::{Deserialize, Deserializer};

/// Webhook body posted by the gateway.
///
/// Only the signed fields are required; everything else is advisory,
/// since the reconciler re-queries the gateway for the real status.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    /// Merchant order id.
    pub order_id: String,
    /// Gateway status code, e.g. `"200"`.
    #[serde(deserialize_with = "string_or_number")]
    pub status_code: String,
    /// Amount as the gateway rendered it.
    #[serde(deserialize_with = "string_or_number")]
    pub gross_amount: String,
    /// Hex SHA-512 signature.
    pub signature_key: String,
    /// Claimed status; never trusted for state changes.
    #[serde(default)]
    pub transaction_status: Option<String>,
    /// Gateway transaction id.
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// e.g. `"gopay"`.
    #[serde(default)]
    pub payment_type: Option<String>,
}

impl PaymentNotification {
    /// Fields covered by `signature_key`.
    pub fn signed_fields(&self) -> SignedFields<'_> {
        SignedFields {
            order_id: &self.order_id,
            status_code: &self.status_code,
            gross_amount: &self.gross_amount,
        }
    }
}

/// A notification body parsed as far as it would go.
#[derive(Debug)]
pub struct ParsedNotification {
    /// `order_id` if the body was JSON and carried one, for logging.
    pub order_id: Option<String>,
    /// The typed payload, or why it could not be built.
    pub payload: Result<PaymentNotification, TollgateError>,
}

/// Parse a webhook body.
///
/// The body is first read as opaque JSON so `order_id` can be logged even
/// when the typed parse fails.
pub fn parse_notification(body: &[u8]) -> ParsedNotification {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return ParsedNotification {
                order_id: None,
                payload: Err(TollgateError::ProtocolError(format!(
                    "Notification is not JSON: {}",
                    e
                ))),
            }
        }
    };

    let order_id = value
        .get("order_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let payload = serde_json::from_value(value).map_err(|e| {
        TollgateError::ProtocolError(format!("Malformed notification: {}", e))
    });

    ParsedNotification { order_id, payload }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
