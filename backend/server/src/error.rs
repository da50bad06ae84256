use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::{ledger::LedgerError, records::RecordError, settlement::SettlementError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Missing caller identity")]
    Unauthenticated,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("{0}")]
    Conflict(String),

    #[error("Payment gateway unavailable, retry later")]
    GatewayUnavailable,

    #[error("Payment gateway rejected the order")]
    GatewayRejected,

    #[error("Payment verification failed")]
    VerificationFailed,

    #[error("Order {0} is held for reconciliation")]
    Reconciliation(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::GatewayUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::GatewayRejected { .. } => StatusCode::BAD_GATEWAY,
            AppError::VerificationFailed { .. } => StatusCode::UNAUTHORIZED,
            AppError::Reconciliation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let AppError::InternalError(e) = &self {
            error!("Internal error: {e}");

            return (status, "Internal error").into_response();
        }

        (status, self.to_string()).into_response()
    }
}

impl From<SettlementError> for AppError {
    fn from(e: SettlementError) -> Self {
        match e {
            SettlementError::Validation(reason) => AppError::Validation(reason),
            SettlementError::NotFound(reason) => AppError::NotFound(reason),
            SettlementError::GatewayUnavailable => AppError::GatewayUnavailable,
            SettlementError::GatewayRejected(_) => AppError::GatewayRejected,
            SettlementError::VerificationFailed => AppError::VerificationFailed,
            SettlementError::Reconciliation { order_id } => AppError::Reconciliation(order_id),
            SettlementError::Storage(reason) => AppError::InternalError(reason.into()),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(_) => AppError::NotFound(e.to_string()),
            LedgerError::NotAcceptingContributions(_) | LedgerError::InvalidTransition { .. } => {
                AppError::Validation(e.to_string())
            }
            LedgerError::Forbidden => AppError::Forbidden,
            LedgerError::Conflict(_) | LedgerError::AlreadyExists(_) => {
                AppError::Conflict(e.to_string())
            }
            LedgerError::Overflow(_) | LedgerError::Storage(_) => {
                AppError::InternalError(Box::new(e))
            }
        }
    }
}

impl From<RecordError> for AppError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::NotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::InternalError(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};
    use uuid::Uuid;

    use super::AppError;
    use crate::{ledger::LedgerError, records::RecordError, settlement::SettlementError};

    fn status(error: impl Into<AppError>) -> StatusCode {
        error.into().into_response().status()
    }

    #[test]
    fn test_settlement_statuses() {
        assert_eq!(
            status(SettlementError::Validation("amount".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SettlementError::GatewayUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(SettlementError::VerificationFailed),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(SettlementError::Reconciliation {
                order_id: "order_1".to_string()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(SettlementError::GatewayRejected("no".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_ledger_statuses() {
        let id = Uuid::new_v4();

        assert_eq!(status(LedgerError::NotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(status(LedgerError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status(LedgerError::Conflict(id)), StatusCode::CONFLICT);
        assert_eq!(
            status(LedgerError::Storage("down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_record_statuses() {
        assert_eq!(
            status(RecordError::NotFound("order_1".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(RecordError::Storage("down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
