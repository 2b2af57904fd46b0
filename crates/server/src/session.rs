use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Json,
};
use server_api::Session;
use shared::error::{ApiError, ErrorCode};
use tracing::debug;

use crate::{app_state::AppState, reject};

/// Session resolved from an optional `Authorization: Bearer` header.
/// A missing header yields `None`; a present but invalid one is rejected.
pub(crate) struct CurrentSession(pub(crate) Option<Session>);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentSession {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(Self(None));
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                reject(ApiError::new(
                    ErrorCode::Unauthorized,
                    "Authorization header must carry a bearer token",
                ))
            })?;

        let session = state.sessions.verify(token).map_err(|error| {
            debug!(%error, "session token rejected");
            reject(ApiError::new(ErrorCode::Unauthorized, "Invalid or expired session"))
        })?;
        Ok(Self(Some(session)))
    }
}
