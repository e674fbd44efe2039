//! Bearer-token authentication.
//!
//! Tokens are issued by the account service and signed with a shared HS256
//! secret. `sub` carries the numeric user id, `is_staff` grants access to the
//! admin endpoints.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::routes::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub is_staff: bool,
    pub exp: u64,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
    pub is_staff: bool,
}

impl AuthUser {
    /// Owners see their own jobs; staff see everything.
    pub fn can_access(&self, owner_id: i64) -> bool {
        self.is_staff || self.user_id == owner_id
    }

    pub fn require_staff(&self) -> Result<(), ApiError> {
        if self.is_staff {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Token subject {0:?} is not a user id")]
    InvalidSubject(String),
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| AuthError::InvalidSubject(data.claims.sub.clone()))?;

        Ok(AuthUser {
            user_id,
            is_staff: data.claims.is_staff,
        })
    }

    pub fn verify_header(&self, header: Option<&str>) -> Result<AuthUser, AuthError> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        state.auth.verify_header(header).map_err(|e| {
            tracing::debug!(error = %e, "Rejected request credentials");
            ApiError::Unauthorized
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, is_staff: bool, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            is_staff,
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_user() {
        let verifier = JwtVerifier::new(SECRET);
        let user = verifier.verify(&token("42", false, SECRET)).unwrap();
        assert_eq!(user.user_id, 42);
        assert!(!user.is_staff);
    }

    #[test]
    fn test_staff_flag_carried() {
        let verifier = JwtVerifier::new(SECRET);
        let header = format!("Bearer {}", token("1", true, SECRET));
        let user = verifier.verify_header(Some(&header)).unwrap();
        assert!(user.is_staff);
        assert!(user.can_access(999));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&token("42", false, "other-secret")),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&token("alice", false, SECRET)),
            Err(AuthError::InvalidSubject(_))
        ));
    }

    #[test]
    fn test_missing_or_malformed_header() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(verifier.verify_header(None), Err(AuthError::MissingToken)));
        assert!(matches!(
            verifier.verify_header(Some("Basic abc")),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_owner_access() {
        let user = AuthUser {
            user_id: 5,
            is_staff: false,
        };
        assert!(user.can_access(5));
        assert!(!user.can_access(6));
        assert!(user.require_staff().is_err());
    }
}
