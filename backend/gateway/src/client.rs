use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{GatewayError, Order, OrderRequest, PaymentGateway};

/// Orders API of the hosted gateway, authenticated with the key pair.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: Notes<'a>,
}

#[derive(Serialize)]
struct Notes<'a> {
    campaign_id: &'a str,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    amount: u64,
    currency: String,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        key_id: String,
        key_secret: String,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Misconfigured(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id,
            key_secret,
        })
    }
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let body = CreateOrderBody {
            amount: request.amount.minor(),
            currency: &request.currency,
            receipt: &request.receipt,
            notes: Notes {
                campaign_id: &request.campaign_id,
            },
        };

        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Gateway answered {status} for receipt {}", request.receipt);
            return Err(GatewayError::Unavailable(format!("gateway answered {status}")));
        }

        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {reason}")));
        }

        // A 2xx whose body we cannot read may still have created the order; the receipt lets
        // a retry land on the same one.
        let order: OrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(e.without_url().to_string()))?;

        debug!("Gateway order {} created for receipt {}", order.id, request.receipt);

        Ok(Order {
            order_id: order.id,
            gateway_amount: order.amount,
            currency: order.currency,
        })
    }
}
