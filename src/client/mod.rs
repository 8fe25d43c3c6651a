//! Outbound payment gateway client.

pub mod http;

pub use http::{PaymentGateway, SnapGatewayClient};
