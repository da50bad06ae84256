//! # Settlement
//!
//! Drives one contribution attempt from request to ledger update.
//!
//! ```text
//! Requested --> OrderCreated --> Verified --> Settled
//!     |              |
//!     v              v
//! OrderFailed   VerificationFailed
//! ```
//!
//! - **Requested -> OrderCreated**: amount is positive, the campaign is approved, the gateway
//!   opened an order and a pending record exists for it. Gateway failures end in `OrderFailed`
//!   and leave no record behind.
//! - **OrderCreated -> Verified**: the confirmation signature matches. A mismatch fails the
//!   record and ends in `VerificationFailed`.
//! - **Verified -> Settled**: the record is marked succeeded, then the ledger applies the
//!   contribution. Both writes run in a spawned task, so a client hanging up cannot split them.
//!   The order id is the idempotency key: a replayed confirmation finds the record already
//!   settled, and the ledger counts each order id at most once.
//!
//! A replay of a succeeded order answers with the original success only once the ledger holds
//! the order. An order waiting in the reconciliation queue keeps answering with a
//! reconciliation error.
//!
//! The coordinator keeps no state between calls. Each call rebuilds the attempt from the
//! record store.
use std::{fmt, sync::Arc};

use gateway::{
    Amount, GatewayError, Order, OrderRequest, PaymentGateway, SignatureVerifier,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    ledger::{CampaignLedger, LedgerError},
    records::{Contribution, ContributionStore, Outcome, RecordError},
    user::Caller,
    utils::{RetryPolicy, retry_with_backoff},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Requested,
    OrderCreated,
    Verified,
    Settled,
    OrderFailed,
    VerificationFailed,
}

impl AttemptState {
    pub fn can_become(self, next: AttemptState) -> bool {
        use AttemptState::*;

        matches!(
            (self, next),
            (Requested, OrderCreated)
                | (Requested, OrderFailed)
                | (OrderCreated, Verified)
                | (OrderCreated, VerificationFailed)
                | (Verified, Settled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Settled | AttemptState::OrderFailed | AttemptState::VerificationFailed
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Requested => "requested",
            AttemptState::OrderCreated => "order_created",
            AttemptState::Verified => "verified",
            AttemptState::Settled => "settled",
            AttemptState::OrderFailed => "order_failed",
            AttemptState::VerificationFailed => "verification_failed",
        };

        f.write_str(name)
    }
}

/// In-flight context of one attempt.
struct Attempt {
    key: String,
    state: AttemptState,
}

impl Attempt {
    fn new(key: &str, state: AttemptState) -> Self {
        Self {
            key: key.to_string(),
            state,
        }
    }

    fn advance(&mut self, next: AttemptState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal attempt transition {} -> {next}",
            self.state
        );

        debug!("Attempt {}: {} -> {next}", self.key, self.state);
        self.state = next;
    }
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Payment gateway unavailable, retry later")]
    GatewayUnavailable,

    #[error("Payment gateway rejected the order: {0}")]
    GatewayRejected(String),

    #[error("Payment signature verification failed")]
    VerificationFailed,

    #[error("Order {order_id} needs manual reconciliation")]
    Reconciliation { order_id: String },

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(_) => SettlementError::NotFound(e.to_string()),
            LedgerError::NotAcceptingContributions(_) => SettlementError::Validation(e.to_string()),
            other => SettlementError::Storage(other.to_string()),
        }
    }
}

impl From<RecordError> for SettlementError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::NotFound(_) => SettlementError::NotFound(e.to_string()),
            other => SettlementError::Storage(other.to_string()),
        }
    }
}

impl From<GatewayError> for SettlementError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable(_) => SettlementError::GatewayUnavailable,
            GatewayError::Rejected(reason) | GatewayError::Misconfigured(reason) => {
                SettlementError::GatewayRejected(reason)
            }
        }
    }
}

/// Payment confirmation as delivered after checkout.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub campaign_id: Uuid,
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Settled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub status: SettlementStatus,
    pub order_id: String,
    pub replayed: bool,
}

impl SettlementReceipt {
    fn settled(order_id: &str, replayed: bool) -> Self {
        Self {
            status: SettlementStatus::Settled,
            order_id: order_id.to_string(),
            replayed,
        }
    }
}

pub struct Coordinator {
    ledger: Arc<dyn CampaignLedger>,
    records: Arc<dyn ContributionStore>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
    currency: String,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn CampaignLedger>,
        records: Arc<dyn ContributionStore>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
        currency: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            records,
            gateway,
            verifier,
            currency: currency.to_string(),
            retry,
        }
    }

    #[instrument(skip_all, fields(campaign = %campaign_id, contributor = %caller.id))]
    pub async fn create_order(
        &self,
        campaign_id: Uuid,
        amount: Amount,
        caller: &Caller,
    ) -> Result<Order, SettlementError> {
        let receipt = Uuid::new_v4().simple().to_string();
        let mut attempt = Attempt::new(&receipt, AttemptState::Requested);

        if amount.is_zero() {
            return Err(SettlementError::Validation(
                "Contribution amount must be positive".to_string(),
            ));
        }

        self.ledger.get_for_contribution(campaign_id).await?;

        let request = OrderRequest {
            campaign_id: campaign_id.to_string(),
            amount,
            currency: self.currency.clone(),
            receipt,
        };

        let order = match retry_with_backoff(&self.retry, GatewayError::is_retryable, || {
            self.gateway.create_order(&request)
        })
        .await
        {
            Ok(order) if order.gateway_amount == amount.minor() => order,
            Ok(order) => {
                attempt.advance(AttemptState::OrderFailed);
                warn!(
                    "Gateway order {} carries {} minor units, requested {}",
                    order.order_id,
                    order.gateway_amount,
                    amount.minor()
                );

                return Err(SettlementError::GatewayRejected(
                    "gateway order amount differs from the request".to_string(),
                ));
            }
            Err(e) => {
                attempt.advance(AttemptState::OrderFailed);
                warn!("Order creation failed: {e}");

                return Err(e.into());
            }
        };

        match self
            .records
            .create_pending(campaign_id, &caller.id, amount, &order.order_id)
            .await
        {
            Ok(_) => {}
            Err(RecordError::DuplicateOrder(_)) => {
                let existing = self
                    .records
                    .get(&order.order_id)
                    .await?
                    .ok_or_else(|| RecordError::NotFound(order.order_id.clone()))?;

                if existing.campaign_id != campaign_id
                    || existing.contributor != caller.id
                    || existing.amount != amount
                {
                    return Err(SettlementError::Validation(
                        "Order already belongs to another contribution".to_string(),
                    ));
                }

                debug!("Order {} already recorded, handing it back", order.order_id);
            }
            Err(e) => return Err(e.into()),
        }

        attempt.advance(AttemptState::OrderCreated);
        info!("Order {} opened for {amount}", order.order_id);

        Ok(order)
    }

    #[instrument(
        skip_all,
        fields(campaign = %confirmation.campaign_id, order = %confirmation.order_id)
    )]
    pub async fn confirm(
        &self,
        confirmation: &Confirmation,
        caller: &Caller,
    ) -> Result<SettlementReceipt, SettlementError> {
        let order_id = confirmation.order_id.as_str();

        let record = self.records.get(order_id).await?.ok_or_else(|| {
            SettlementError::NotFound(format!("No contribution recorded for order {order_id}"))
        })?;

        if record.campaign_id != confirmation.campaign_id {
            return Err(SettlementError::Validation(
                "Order does not belong to this campaign".to_string(),
            ));
        }
        if record.amount != confirmation.amount {
            return Err(SettlementError::Validation(
                "Amount does not match the order".to_string(),
            ));
        }
        if record.contributor != caller.id {
            return Err(SettlementError::Validation(
                "Order belongs to another contributor".to_string(),
            ));
        }

        let mut attempt = Attempt::new(order_id, AttemptState::OrderCreated);

        if !self
            .verifier
            .verify(order_id, &confirmation.payment_id, &confirmation.signature)
        {
            attempt.advance(AttemptState::VerificationFailed);
            warn!(
                payment = %confirmation.payment_id,
                contributor = %caller.id,
                "Signature mismatch on payment confirmation"
            );

            match self.records.mark_outcome(order_id, Outcome::Failed).await {
                Ok(()) | Err(RecordError::AlreadySettled(_)) => {}
                Err(e) => error!("Could not fail order {order_id}: {e}"),
            }

            return Err(SettlementError::VerificationFailed);
        }
        attempt.advance(AttemptState::Verified);

        let settlement = tokio::spawn(
            settle(self.records.clone(), self.ledger.clone(), record.clone()).in_current_span(),
        );

        match settlement.await {
            Ok(Ok(Marked::Won)) => {}
            Ok(Ok(Marked::AlreadySettled)) => return self.replayed(order_id).await,
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                error!("Settlement of order {order_id} aborted: {e}");
                flag_unreconciled(self.records.as_ref(), order_id).await;

                return Err(SettlementError::Reconciliation {
                    order_id: order_id.to_string(),
                });
            }
        }

        attempt.advance(AttemptState::Settled);
        info!("Settled {} from {}", record.amount, record.contributor);

        Ok(SettlementReceipt::settled(order_id, false))
    }

    /// A verified confirmation for a record that is no longer pending.
    async fn replayed(&self, order_id: &str) -> Result<SettlementReceipt, SettlementError> {
        let record = self
            .records
            .get(order_id)
            .await?
            .ok_or_else(|| RecordError::NotFound(order_id.to_string()))?;

        match record.outcome {
            Outcome::Succeeded => {
                if self.ledger.is_applied(record.campaign_id, order_id).await? {
                    info!("Replayed confirmation for settled order {order_id}");

                    return Ok(SettlementReceipt::settled(order_id, true));
                }

                if self.records.is_unreconciled(order_id).await? {
                    warn!("Replayed confirmation for order {order_id} awaiting reconciliation");

                    return Err(SettlementError::Reconciliation {
                        order_id: order_id.to_string(),
                    });
                }

                // Succeeded but not counted: the first settlement is still running or died
                // between its two writes. Applying is keyed by order id, so finishing it here
                // cannot count it twice.
                apply(self.records.as_ref(), self.ledger.as_ref(), &record).await?;
                info!("Completed settlement of order {order_id} on replay");

                Ok(SettlementReceipt::settled(order_id, true))
            }
            Outcome::Failed | Outcome::Pending => {
                error!("Verified payment arrived for closed order {order_id}");
                flag_unreconciled(self.records.as_ref(), order_id).await;

                Err(SettlementError::Reconciliation {
                    order_id: order_id.to_string(),
                })
            }
        }
    }
}

/// Who moved the record out of `pending`.
enum Marked {
    Won,
    AlreadySettled,
}

/// Marks the record succeeded, then counts it into the ledger. Spawned, so a dropped request
/// cannot stop it between the two writes.
async fn settle(
    records: Arc<dyn ContributionStore>,
    ledger: Arc<dyn CampaignLedger>,
    record: Contribution,
) -> Result<Marked, SettlementError> {
    match records.mark_outcome(&record.order_id, Outcome::Succeeded).await {
        Ok(()) => {}
        Err(RecordError::AlreadySettled(_)) => return Ok(Marked::AlreadySettled),
        Err(e) => return Err(e.into()),
    }

    apply(records.as_ref(), ledger.as_ref(), &record).await?;

    Ok(Marked::Won)
}

async fn apply(
    records: &dyn ContributionStore,
    ledger: &dyn CampaignLedger,
    record: &Contribution,
) -> Result<(), SettlementError> {
    let order_id = record.order_id.as_str();

    match ledger
        .apply_contribution(record.campaign_id, order_id, &record.contributor, record.amount)
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => {
            debug!("Order {order_id} was already in the ledger");
            Ok(())
        }
        Err(e) => {
            error!("Order {order_id} succeeded but the ledger update failed: {e}");
            flag_unreconciled(records, order_id).await;

            Err(SettlementError::Reconciliation {
                order_id: order_id.to_string(),
            })
        }
    }
}

async fn flag_unreconciled(records: &dyn ContributionStore, order_id: &str) {
    if let Err(e) = records.flag_unreconciled(order_id).await {
        error!("Could not queue order {order_id} for reconciliation: {e}");
    }
}
