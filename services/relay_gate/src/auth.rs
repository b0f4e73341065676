//! Bearer-token authentication.
//!
//! Every path except `/health` requires `Authorization: Bearer <jwt>`.
//! The token must carry a valid signature and matching `exp`, `iss`,
//! `aud`; the decoded claims are attached to the request extensions for
//! downstream handlers.

use crate::{error::GateError, AppState};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Verified claim set. Extra claims ride along untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(
        secret: &str,
        algorithm: &str,
        audience: &str,
        issuer: &str,
    ) -> anyhow::Result<Self> {
        let algorithm: Algorithm = algorithm
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown JWT algorithm: {algorithm}"))?;
        let mut validation = Validation::new(algorithm);
        // No leeway: an expired token is expired the second it expires.
        validation.leeway = 0;
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

/// Middleware: require a valid bearer token on non-bypass paths.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if crate::is_bypass(req.uri().path()) {
        return next.run(req).await;
    }
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = match token {
        Some(t) => t.trim(),
        None => {
            return GateError::unauthorized("Missing or invalid Authorization header")
                .into_response()
        }
    };
    match state.verifier.verify(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(err) => verification_failure(err).into_response(),
    }
}

fn verification_failure(err: jsonwebtoken::errors::Error) -> GateError {
    match err.kind() {
        ErrorKind::ExpiredSignature => GateError::unauthorized("Token expired"),
        // Key and crypto-level failures are our problem, not the caller's.
        ErrorKind::InvalidKeyFormat
        | ErrorKind::InvalidEcdsaKey
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::Crypto(_) => GateError::internal(format!("Auth error: {err}")),
        _ => GateError::unauthorized("Token invalid"),
    }
}
