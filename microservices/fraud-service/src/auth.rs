//! Session authentication
//!
//! HS256 bearer tokens carrying the caller's tenant, user id and roles.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use opsdesk_core::{RequestContext, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, tenant: TenantId, roles: &[Role], ttl_secs: i64) -> Self {
        Self {
            sub: user_id.into(),
            tenant_id: *tenant.as_uuid(),
            roles: roles.iter().map(|r| r.as_str().to_string()).collect(),
            exp: Utc::now().timestamp() + ttl_secs,
        }
    }
}

/// Ordered by privilege; a higher role satisfies any lower requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Viewer,
    Analyst,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "viewer" => Some(Self::Viewer),
            "analyst" => Some(Self::Analyst),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Analyst => "analyst",
            Self::Admin => "admin",
        }
    }
}

/// Authenticated caller, extracted per request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl AuthContext {
    fn from_claims(claims: Claims) -> Self {
        Self {
            tenant_id: TenantId::new(claims.tenant_id),
            user_id: claims.sub,
            roles: claims.roles.iter().filter_map(|r| Role::parse(r)).collect(),
        }
    }

    pub fn has_role(&self, required: Role) -> bool {
        self.roles.iter().any(|r| *r >= required)
    }

    pub fn require(&self, required: Role) -> Result<()> {
        if self.has_role(required) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("{} role required", required.as_str())))
        }
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext::new()
            .with_tenant(self.tenant_id)
            .with_user(self.user_id.clone())
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthContext> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {}", e)))?;
        Ok(AuthContext::from_claims(data.claims))
    }

    /// Sign a session token; used by tooling and tests
    pub fn issue(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token signing failed: {}", e)))
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;
        let token = extract_token(header)
            .ok_or_else(|| Error::Unauthorized("expected bearer token".into()))?;
        self.verify(token)
    }
}

pub fn extract_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
    TokenVerifier: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        // The rate-limit layer may already have verified the token
        if let Some(ctx) = parts.extensions.get::<AuthContext>() {
            return Ok(ctx.clone());
        }
        TokenVerifier::from_ref(state).authenticate(&parts.headers)
    }
}
