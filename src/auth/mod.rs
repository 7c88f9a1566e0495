// Authentication module - internal bearer tokens and vendor credentials

pub mod credential;
pub mod providers;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long an internal token stays valid
pub const TOKEN_LIFETIME_SECS: i64 = 60 * 60;

/// Monthly spend ceiling granted to personal-use tokens
const DEFAULT_MAX_MONTHLY_SPEND_CENTS: u32 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("invalid token")]
    Invalid,

    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Signed claim set carried in the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    iat: i64,
    exp: i64,
    jti: String,
    user_id: u64,
    login: String,
}

/// Caller identity resolved from a validated token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmToken {
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub user_id: u64,
    pub login: String,
    pub is_staff: bool,
    pub has_llm_subscription: bool,
    pub max_monthly_spend_cents: u32,
}

impl LlmToken {
    /// Synthetic, fully privileged identity used when caller auth is switched off
    pub fn disabled_auth() -> Self {
        Self {
            iat: 0,
            exp: 0,
            jti: String::new(),
            user_id: 1,
            login: "disabled-auth-user".to_string(),
            is_staff: true,
            has_llm_subscription: true,
            max_monthly_spend_cents: DEFAULT_MAX_MONTHLY_SPEND_CENTS,
        }
    }

    fn from_claims(claims: TokenClaims) -> Self {
        Self {
            iat: claims.iat,
            exp: claims.exp,
            jti: claims.jti,
            user_id: claims.user_id,
            login: claims.login,
            is_staff: true,
            has_llm_subscription: true,
            max_monthly_spend_cents: DEFAULT_MAX_MONTHLY_SPEND_CENTS,
        }
    }
}

/// Issues and validates HS256-signed internal tokens
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: Duration,
    auth_disabled: bool,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("lifetime", &self.lifetime)
            .field("auth_disabled", &self.auth_disabled)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &str, auth_disabled: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            lifetime: Duration::seconds(TOKEN_LIFETIME_SECS),
            auth_disabled,
        }
    }

    pub fn issue(&self, user_id: u64, login: &str) -> Result<String, TokenError> {
        self.issue_at(user_id, login, Utc::now())
    }

    pub fn issue_at(&self, user_id: u64, login: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
        let claims = TokenClaims {
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            jti: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            user_id,
            login: login.to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify signature and expiry of a raw token string
    pub fn validate(&self, token: &str) -> Result<LlmToken, TokenError> {
        if token.is_empty() {
            return Err(TokenError::Invalid);
        }

        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => {
                    tracing::debug!("Token validation failed: {}", e);
                    TokenError::Invalid
                }
            }
        })?;

        Ok(LlmToken::from_claims(data.claims))
    }

    /// Resolve the caller from an `Authorization` header value.
    pub fn authorize(&self, authorization: Option<&str>) -> Result<LlmToken, TokenError> {
        if self.auth_disabled {
            return Ok(LlmToken::disabled_auth());
        }

        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(TokenError::Invalid)?;

        self.validate(token.trim())
    }
}
