//! # Callers
//!
//! Sessions live upstream. The reverse proxy authenticates the request and forwards the
//! caller as two headers:
//!
//! - `x-user-id`: opaque, stable user id
//! - `x-user-role`: `moderator` for moderators, anything else (or absent) for members
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Moderator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn member(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Role::Member,
        }
    }

    pub fn moderator(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Role::Moderator,
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.role == Role::Moderator
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let id = header(USER_ID_HEADER).ok_or(AppError::Unauthenticated)?;
        let role = match header(USER_ROLE_HEADER) {
            Some(role) if role.eq_ignore_ascii_case("moderator") => Role::Moderator,
            _ => Role::Member,
        };

        Ok(Self {
            id: id.to_string(),
            role,
        })
    }
}
