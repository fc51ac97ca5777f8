//! Capability token validation.
//!
//! One claims type serves every entry point: the `purpose` discriminant
//! separates general API access from single-session stream access, and
//! `scope` pins stream tokens to one session id. Verification is uniform
//! wherever a credential is consumed; issuance internals live with the
//! identity service, [`sign_token`] exists for the binary and tests.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme prefix expected on the Authorization header.
pub const BEARER_PREFIX: &str = "Bearer ";

/// What a capability credential is good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    /// General API access for the subject.
    Api,
    /// Access to exactly one session's status stream.
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Owning principal.
    pub sub: String,
    pub purpose: TokenPurpose,
    /// Session id for stream-purpose tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl CapabilityClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("malformed or unverifiable token: {0}")]
    Invalid(String),

    #[error("token expired")]
    Expired,

    #[error("token purpose does not permit this operation")]
    WrongPurpose,

    #[error("token scope does not cover this resource")]
    ScopeMismatch,
}

impl CapabilityError {
    pub fn code(&self) -> &'static str {
        match self {
            CapabilityError::Invalid(_) | CapabilityError::Expired => "unauthorized",
            CapabilityError::WrongPurpose | CapabilityError::ScopeMismatch => "forbidden",
        }
    }
}

/// Verify a token's signature, expiry and purpose.
pub fn verify_token(
    token: &str,
    secret: &[u8],
    expected_purpose: TokenPurpose,
) -> Result<CapabilityClaims, CapabilityError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    let data = decode::<CapabilityClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CapabilityError::Expired,
            _ => CapabilityError::Invalid(e.to_string()),
        })?;

    if data.claims.purpose != expected_purpose {
        return Err(CapabilityError::WrongPurpose);
    }
    Ok(data.claims)
}

/// Check that a stream token's scope matches the requested session.
pub fn require_scope(claims: &CapabilityClaims, session_id: &str) -> Result<(), CapabilityError> {
    match claims.scope.as_deref() {
        Some(scope) if scope == session_id => Ok(()),
        _ => Err(CapabilityError::ScopeMismatch),
    }
}

/// Sign a claims set with HS256.
pub fn sign_token(claims: &CapabilityClaims, secret: &[u8]) -> Result<String, CapabilityError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| CapabilityError::Invalid(e.to_string()))
}

/// Best-effort subject extraction without verifying the signature.
///
/// Feeds the pre-auth rate limiter only. Never make an authorization
/// decision on this value.
pub fn peek_subject(token: &str) -> Option<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    // The key is unused once signature validation is off.
    decode::<CapabilityClaims>(token, &DecodingKey::from_secret(b"unused"), &validation)
        .ok()
        .map(|data| data.claims.sub)
}
