use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Header carrying the identity provider's stable user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The signed-in user, as vouched for by the identity provider in front of
/// this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentUser {
    pub uid: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uid = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_ID_HEADER} header")))?;

        Ok(Self {
            uid: uid.to_string(),
        })
    }
}
