use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use gateway::Amount;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    campaign::{Campaign, CampaignStatus},
    error::AppError,
    settlement::Confirmation,
    state::AppState,
    user::Caller,
    utils::body,
};

const MAX_TITLE_CHARS: usize = 200;
const MAX_GATEWAY_ID_CHARS: usize = 64;

#[derive(Deserialize)]
pub struct NewCampaign {
    pub title: String,
    pub goal: f64,
    pub deadline: DateTime<Utc>,
}

impl NewCampaign {
    pub fn validate(self, owner: &Caller, now: DateTime<Utc>) -> Result<Campaign, AppError> {
        let title = self.title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
            return Err(AppError::Validation(format!(
                "Title must be 1 to {MAX_TITLE_CHARS} characters"
            )));
        }

        if self.deadline <= now {
            return Err(AppError::Validation(
                "Deadline must be in the future".to_string(),
            ));
        }

        Ok(Campaign::new(&owner.id, title, major(self.goal)?, self.deadline))
    }
}

#[derive(Deserialize)]
pub struct StatusChange {
    pub status: CampaignStatus,
}

#[derive(Deserialize)]
pub struct ContributionOrder {
    pub amount: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionConfirmation {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
    pub amount: f64,
}

impl ContributionConfirmation {
    pub fn validate(self, campaign_id: Uuid) -> Result<Confirmation, AppError> {
        for (name, value) in [("orderId", &self.order_id), ("paymentId", &self.payment_id)] {
            if value.is_empty() || value.len() > MAX_GATEWAY_ID_CHARS {
                return Err(AppError::Validation(format!(
                    "{name} must be 1 to {MAX_GATEWAY_ID_CHARS} characters"
                )));
            }
        }

        if self.signature.is_empty() {
            return Err(AppError::Validation("signature is required".to_string()));
        }

        Ok(Confirmation {
            campaign_id,
            amount: major(self.amount)?,
            order_id: self.order_id,
            payment_id: self.payment_id,
            signature: self.signature,
        })
    }
}

fn major(amount: f64) -> Result<Amount, AppError> {
    Amount::from_major(amount).ok_or_else(|| {
        AppError::Validation("Amount must be positive, in major currency units".to_string())
    })
}

pub async fn create_campaign_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<NewCampaign>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let campaign = body(payload)?.validate(&caller, Utc::now())?;
    let campaign = state.ledger.create(campaign).await?;

    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn campaign_handler(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.get(campaign_id).await?))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    caller: Caller,
    payload: Result<Json<StatusChange>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let change = body(payload)?;

    Ok(Json(
        state
            .ledger
            .set_status(campaign_id, change.status, &caller)
            .await?,
    ))
}

pub async fn contributions_handler(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    caller: Caller,
) -> Result<impl IntoResponse, AppError> {
    let campaign = state.ledger.get(campaign_id).await?;
    if campaign.owner != caller.id && !caller.is_moderator() {
        return Err(AppError::Forbidden);
    }

    Ok(Json(state.records.for_campaign(campaign_id).await?))
}

pub async fn order_handler(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    caller: Caller,
    payload: Result<Json<ContributionOrder>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let amount = major(body(payload)?.amount)?;

    let order = state
        .coordinator
        .create_order(campaign_id, amount, &caller)
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    caller: Caller,
    payload: Result<Json<ContributionConfirmation>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let confirmation = body(payload)?.validate(campaign_id)?;

    Ok(Json(
        state.coordinator.confirm(&confirmation, &caller).await?,
    ))
}

pub async fn unreconciled_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<impl IntoResponse, AppError> {
    if !caller.is_moderator() {
        return Err(AppError::Forbidden);
    }

    Ok(Json(state.records.unreconciled().await?))
}
