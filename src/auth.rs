use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorResponse;

/// Permission strings checked by the HTTP handlers
pub mod consts {
    pub const PAYMENTS_READ: &str = "payments:read";
    pub const PAYMENTS_WRITE: &str = "payments:write";
}

/// Claim structure for JWT tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,              // Subject (user ID)
    pub roles: Vec<String>,       // User's roles
    pub permissions: Vec<String>, // User's explicit permissions
    pub jti: String,              // JWT ID (unique identifier for this token)
    pub iat: i64,                 // Issued at time
    pub exp: i64,                 // Expiration time
    pub nbf: i64,                 // Not valid before time
    pub iss: String,              // Issuer
    pub aud: String,              // Audience
}

/// Authenticated user data extracted from the JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub token_id: String,
}

pub type AuthenticatedUser = AuthUser;

impl AuthUser {
    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Check if the user has a specific permission
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }
}

/// Authentication configuration
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_token_expiration: Duration,
}

impl AuthConfig {
    pub fn new(
        jwt_secret: String,
        jwt_issuer: String,
        jwt_audience: String,
        access_token_expiration: Duration,
    ) -> Self {
        Self {
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            access_token_expiration,
        }
    }
}

/// Validates bearer tokens for request handling and mints them for tooling.
#[derive(Debug, Clone)]
pub struct AuthService {
    pub config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issue a signed access token carrying the given roles and permissions.
    pub fn issue_token(
        &self,
        user_id: &str,
        roles: &[&str],
        permissions: &[&str],
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::seconds(self.config.access_token_expiration.as_secs() as i64))
                .timestamp(),
            nbf: now.timestamp(),
            iss: self.config.jwt_issuer.clone(),
            aud: self.config.jwt_audience.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::InternalError(e.to_string()))
    }

    /// Validate a bearer token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.jwt_audience]);
        validation.set_issuer(&[&self.config.jwt_issuer]);
        validation.validate_nbf = true;

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken(err.to_string()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication credentials")]
    MissingAuth,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has expired")]
    ExpiredToken,
    #[error("authentication service unavailable: {0}")]
    InternalError(String),
}

impl AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.to_string(),
            details: None,
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_service = parts
            .extensions
            .get::<Arc<AuthService>>()
            .cloned()
            .ok_or_else(|| {
                AuthError::InternalError("authentication service not available".to_string())
            })?;

        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingAuth)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or(AuthError::MissingAuth)?;

        let claims = auth_service.validate_token(token)?;

        Ok(AuthUser {
            user_id: claims.sub,
            roles: claims.roles,
            permissions: claims.permissions,
            token_id: claims.jti,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(AuthConfig::new(
            "test_secret_key_for_testing_purposes_only_32chars".into(),
            "storefront-auth".into(),
            "storefront-api".into(),
            Duration::from_secs(3600),
        ))
    }

    #[test]
    fn issued_tokens_round_trip() {
        let svc = service();
        let token = svc
            .issue_token("user-1", &["admin"], &[consts::PAYMENTS_WRITE])
            .expect("issue token");

        let claims = svc.validate_token(&token).expect("validate token");
        assert_eq!(claims.sub, "user-1");
        assert!(claims.permissions.iter().any(|p| p == consts::PAYMENTS_WRITE));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let svc = service();
        let other = AuthService::new(AuthConfig::new(
            "another_secret_key_that_is_also_32_chars_long!!".into(),
            "storefront-auth".into(),
            "storefront-api".into(),
            Duration::from_secs(3600),
        ));

        let token = other
            .issue_token("user-1", &[], &[])
            .expect("issue token");
        assert!(matches!(
            svc.validate_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn token_for_other_audience_is_rejected() {
        let svc = service();
        let other = AuthService::new(AuthConfig::new(
            "test_secret_key_for_testing_purposes_only_32chars".into(),
            "storefront-auth".into(),
            "another-api".into(),
            Duration::from_secs(3600),
        ));

        let token = other.issue_token("user-1", &[], &[]).expect("issue token");
        assert!(svc.validate_token(&token).is_err());
    }

    #[test]
    fn permission_checks_match_exact_strings() {
        let user = AuthUser {
            user_id: "user-1".into(),
            roles: vec!["admin".into()],
            permissions: vec![consts::PAYMENTS_READ.into()],
            token_id: "jti".into(),
        };
        assert!(user.has_permission(consts::PAYMENTS_READ));
        assert!(!user.has_permission(consts::PAYMENTS_WRITE));
        assert!(user.is_admin());
    }
}
