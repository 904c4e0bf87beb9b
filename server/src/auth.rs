//! Bearer-token authentication.
//!
//! Tokens are `<payload>,<base64url-der-ecdsa-signature>` where the payload
//! is the base64url-encoded claims JSON. Both halves are URL-safe so a token
//! survives the `?token=` query parameter unmangled. The hub only verifies;
//! issuing tokens to end users is the account service's job (the `sign-token`
//! CLI mints development tokens with the same key).

use std::env;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use cowrite_core::epoch_ms;
use cowrite_core::ids::PrincipalId;
use once_cell::sync::Lazy;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;

static GENERATED_KEY_NOTICE: Lazy<()> = Lazy::new(|| {
    warn!(
        "No COWRITE_TOKEN_PRIVATE_KEY provided. Generated a transient signing key; \
         tokens will not survive a restart."
    );
});

/// The identity a verified token asserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenClaims {
    principal_id: PrincipalId,
    display_name: String,
    /// Epoch ms after which the token is rejected.
    expires_at: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    InvalidEncoding,
    InvalidSignature,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TokenError::Malformed => "malformed token",
            TokenError::InvalidEncoding => "token encoding invalid",
            TokenError::InvalidSignature => "token signature invalid",
            TokenError::Expired => "token expired",
        };
        f.write_str(text)
    }
}

fn read_env_private_key() -> Option<String> {
    if let Ok(value) = env::var("COWRITE_TOKEN_PRIVATE_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_owned());
        }
    }
    None
}

fn generate_private_key_pem() -> (SigningKey, String) {
    Lazy::force(&GENERATED_KEY_NOTICE);
    let signing_key = SigningKey::random(&mut OsRng);
    let pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("failed to encode generated private key");
    (signing_key, pem.to_string())
}

fn load_private_key() -> (SigningKey, String) {
    if let Some(pem) = read_env_private_key() {
        match SigningKey::from_pkcs8_pem(&pem) {
            Ok(key) => (key, pem),
            Err(err) => {
                warn!(
                    ?err,
                    "failed to parse token private key, generating fallback keypair"
                );
                generate_private_key_pem()
            }
        }
    } else {
        generate_private_key_pem()
    }
}

pub struct AccessTokenSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl AccessTokenSigner {
    pub fn new() -> Self {
        let (signing_key, _pem) = load_private_key();
        let verifying_key = VerifyingKey::from(&signing_key);
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Mint a token for a principal, valid for `ttl` from now.
    pub fn mint(&self, principal_id: &PrincipalId, display_name: &str, ttl: Duration) -> String {
        let claims = TokenClaims {
            principal_id: principal_id.clone(),
            display_name: display_name.to_owned(),
            expires_at: epoch_ms() + ttl.as_millis() as i64,
        };
        let encoded = serde_json::to_vec(&claims).expect("token claims serialize");
        let payload = BASE64URL.encode(encoded);
        let signature: Signature = self.signing_key.sign(payload.as_bytes());
        let encoded_signature = BASE64URL.encode(signature.to_der());
        format!("{payload},{encoded_signature}")
    }

    pub fn verify(&self, token: &str) -> Result<Principal, TokenError> {
        let (payload, signature) = token.split_once(',').ok_or(TokenError::Malformed)?;

        let signature_bytes = BASE64URL
            .decode(signature.as_bytes())
            .map_err(|_| TokenError::InvalidEncoding)?;
        let signature =
            Signature::from_der(&signature_bytes).map_err(|_| TokenError::InvalidEncoding)?;
        self.verifying_key
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims_bytes = BASE64URL
            .decode(payload.as_bytes())
            .map_err(|_| TokenError::InvalidEncoding)?;
        let claims: TokenClaims =
            serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;

        if claims.expires_at <= epoch_ms() {
            return Err(TokenError::Expired);
        }

        Ok(Principal {
            principal_id: claims.principal_id,
            display_name: claims.display_name,
        })
    }
}

impl Default for AccessTokenSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Authenticate an HTTP request via `Authorization: Bearer <token>`.
pub fn authenticate_request(
    signer: &AccessTokenSigner,
    headers: &HeaderMap,
) -> Result<Principal, AppError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| AppError::unauthorized("expected a bearer token"))?;

    signer
        .verify(token.trim())
        .map_err(|err| AppError::unauthorized(err.to_string()))
}
