//! Reqwest-based HTTP client for the payment gateway.
//!
//! Every call carries the configured timeout so a slow gateway cannot
//! stall the webhook endpoint or a purchase request indefinitely.

use crate::config::GatewayConfig;
use crate::protocol::gateway::{
    ChargeRequest, ChargeResponse, RefundRequest, RefundResponse, TransactionStatus,
};
use crate::TollgateError;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;

/// Outbound operations the engine needs from a payment gateway.
pub trait PaymentGateway: Send + Sync {
    /// Create a checkout transaction and return its handle.
    fn create_transaction(&self, request: &ChargeRequest) -> Result<ChargeResponse, TollgateError>;

    /// Query the authoritative status of an order.
    ///
    /// A body with a non-success `status_code` is returned as-is; only
    /// transport and parse failures are errors here.
    fn transaction_status(&self, order_id: &str) -> Result<TransactionStatus, TollgateError>;

    /// Refund (or cancel) an order.
    fn refund(&self, order_id: &str, request: &RefundRequest) -> Result<(), TollgateError>;
}

/// Gateway client speaking the hosted-checkout and core status APIs.
pub struct SnapGatewayClient {
    client: Client,
    authorization: String,
    user_agent: String,
    api_base: String,
    snap_base: String,
    timeout: Duration,
}

impl SnapGatewayClient {
    /// Create a new client from gateway config.
    pub fn new(config: &GatewayConfig) -> Result<Self, TollgateError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                TollgateError::GatewayTransport(format!("Failed to create client: {}", e))
            })?;

        Ok(Self {
            client,
            authorization: authorization_header(&config.server_key),
            user_agent: build_user_agent(),
            api_base: config.environment.api_base_url().to_string(),
            snap_base: config.environment.snap_base_url().to_string(),
            timeout: config.timeout,
        })
    }

    /// Point the client at other hosts (mock servers, proxies).
    pub fn with_base_urls(mut self, api_base: impl Into<String>, snap_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.snap_base = snap_base.into();
        self
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Core API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn send_json(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<(u16, Vec<u8>), TollgateError> {
        let response = request
            .header(AUTHORIZATION, &self.authorization)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|e| TollgateError::GatewayTransport(format!("Request failed: {}", e)))?;
        read_body(response)
    }
}

impl PaymentGateway for SnapGatewayClient {
    fn create_transaction(&self, request: &ChargeRequest) -> Result<ChargeResponse, TollgateError> {
        let url = format!("{}/snap/v1/transactions", self.snap_base);
        let body = serde_json::to_vec(request)
            .map_err(|e| TollgateError::ProtocolError(format!("Failed to serialize: {}", e)))?;

        let (status, bytes) = self.send_json(
            self.client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )?;

        if !(200..300).contains(&status) {
            return Err(TollgateError::GatewayError(format!(
                "create transaction returned HTTP {}: {}",
                status,
                snippet(&bytes)
            )));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            TollgateError::ProtocolError(format!("Failed to parse charge response: {}", e))
        })
    }

    fn transaction_status(&self, order_id: &str) -> Result<TransactionStatus, TollgateError> {
        let url = format!("{}/v2/{}/status", self.api_base, order_id);
        let (status, bytes) = self.send_json(self.client.get(&url))?;

        match TransactionStatus::from_json(&bytes) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !(200..300).contains(&status) => Err(TollgateError::GatewayError(format!(
                "status query returned HTTP {}: {}",
                status,
                snippet(&bytes)
            ))),
            Err(e) => Err(e),
        }
    }

    fn refund(&self, order_id: &str, request: &RefundRequest) -> Result<(), TollgateError> {
        let url = format!("{}/v2/{}/refund", self.api_base, order_id);
        let body = serde_json::to_vec(request)
            .map_err(|e| TollgateError::ProtocolError(format!("Failed to serialize: {}", e)))?;

        let (status, bytes) = self.send_json(
            self.client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )?;

        let parsed: RefundResponse = serde_json::from_slice(&bytes).map_err(|_| {
            TollgateError::GatewayError(format!(
                "refund returned HTTP {}: {}",
                status,
                snippet(&bytes)
            ))
        })?;

        if parsed.status_code != "200" {
            return Err(TollgateError::GatewayError(format!(
                "refund rejected ({}): {}",
                parsed.status_code,
                parsed.status_message.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

fn read_body(response: Response) -> Result<(u16, Vec<u8>), TollgateError> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .map_err(|e| TollgateError::GatewayTransport(format!("Failed to read body: {}", e)))?
        .to_vec();
    Ok((status, body))
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned()
}

/// HTTP Basic value for a server key (the key is the username, password empty).
pub fn authorization_header(server_key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:", server_key)))
}

/// Build a User-Agent string.
///
/// Format: `tollgate/<version>`
pub fn build_user_agent() -> String {
    format!("tollgate/{}", env!("CARGO_PKG_VERSION"))
}
