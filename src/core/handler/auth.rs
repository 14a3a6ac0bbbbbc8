// src/core/handler/auth.rs

//! Bearer-credential verification and the `AUTH` handshake.

use crate::connection::Session;
use crate::core::errors::OlivineError;
use crate::core::permissions::Principal;
use crate::core::protocol::{PROTOCOL_VERSION, ServerMessage, close_code};
use crate::core::state::ServerState;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const PEM_HEADER: &str = "-----BEGIN";

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// Verifies a bearer token against the configured secret: RSA public-key
/// verification when the secret carries a PEM header, symmetric HMAC
/// otherwise. On success returns the normalized principal.
pub fn verify_token(secret: &str, token: &str) -> Result<Principal, OlivineError> {
    let (key, algorithm) = if secret.trim_start().starts_with(PEM_HEADER) {
        let key = DecodingKey::from_rsa_pem(secret.as_bytes())
            .map_err(|e| OlivineError::AuthFailed(format!("bad RSA public key: {e}")))?;
        (key, Algorithm::RS256)
    } else {
        (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    };
    let mut validation = Validation::new(algorithm);
    // Tokens without an `exp` claim never expire; tokens carrying one are
    // still checked against it.
    validation.required_spec_claims.clear();

    let data = decode::<TokenClaims>(token, &key, &validation)
        .map_err(|e| OlivineError::AuthFailed(e.to_string()))?;
    let claims = data.claims;
    Ok(Principal::normalized(
        claims.sub,
        claims.user_id,
        claims.roles.unwrap_or_default(),
        claims.extra,
    ))
}

/// Handles one `AUTH` frame. A duplicate `AUTH` on an authenticated session
/// is ignored; a failed verification answers `AUTH_FAIL` and closes 4001.
pub fn handle_auth(state: &Arc<ServerState>, session: &Arc<Session>, token: &str) {
    if session.is_authenticated() {
        debug!("Ignoring duplicate AUTH on session {}", session.id);
        return;
    }

    let verified = match state.config.auth_secret.as_deref() {
        Some(secret) => verify_token(secret, token),
        // No secret configured: development mode, the token is taken as the
        // caller's identity unverified.
        None => Ok(Principal::normalized(
            token.to_string(),
            None,
            Vec::new(),
            serde_json::Map::new(),
        )),
    };

    match verified {
        Ok(principal) => {
            state
                .connections
                .set_authenticated(session.id, Arc::new(principal));
            state.rate_limiter.on_established();
            session.writer.write(
                &ServerMessage::AuthAck {
                    protocol_version: PROTOCOL_VERSION,
                },
                true,
            );
        }
        Err(e) => {
            // The connection loop runs the limiter's on_failed transition
            // when a never-authenticated session closes.
            warn!("Session {} failed authentication: {}", session.id, e);
            session.writer.write(
                &ServerMessage::AuthFail {
                    error: e.to_string(),
                },
                true,
            );
            session.close(close_code::UNAUTHORIZED, "authentication failed");
        }
    }
}

