//! # Payment Gateway
//!
//! Typed wrapper around the hosted payment gateway.
//!
//! ## Contract
//!
//! - **Orders**: every contribution attempt gets its own gateway order. The order id is the
//!   idempotency key for the whole settlement flow, so the client never retries order creation
//!   on its own. A lost response followed by an internal retry would mint a second order.
//! - **Signatures**: after checkout the gateway hands the payer an `(order id, payment id,
//!   signature)` triple. The signature is `hex(HMAC-SHA256(key secret, "{order id}|{payment id}"))`.
//!   Verification is local and never touches the network.
//!
//! ## Errors
//!
//! [`GatewayError::Unavailable`] is the only retryable error. Anything the gateway actively
//! refused (4xx) is [`GatewayError::Rejected`].
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod amount;
pub mod client;
pub mod signature;

pub use amount::Amount;
pub use client::HttpGateway;
pub use signature::SignatureVerifier;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Payment gateway rejected the order: {0}")]
    Rejected(String),

    #[error("Payment gateway client misconfigured: {0}")]
    Misconfigured(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Everything the gateway needs to open an order.
///
/// `receipt` is chosen by the caller once per contribution attempt and reused across retries,
/// which lets the gateway collapse duplicates on its side.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub campaign_id: String,
    pub amount: Amount,
    pub currency: String,
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub gateway_amount: u64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError>;
}
