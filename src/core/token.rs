//! Authorization and response tokens
//!
//! Both token kinds are HS256 JWTs signed with the core's token key. An
//! authorization token is minted on a successful PIN check and is bound to
//! the user's secrets blob through its `sub` claim, so validating one always
//! requires the blob. A response token carries a completed `ProofP`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::idemix::ProofP;
use crate::types::{KeyshareError, Result};

use super::packet::UserSecretsPacket;
use super::Core;

/// Payload of an authorization token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Account identifier derived from the secrets blob.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Payload of a signed `ProofP` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProofPClaims {
    #[serde(rename = "ProofP")]
    pub proof_p: ProofP,
    pub iat: i64,
    pub iss: String,
    pub sub: String,
}

/// Account identifier bound into authorization tokens: a digest of the PIN
/// field, which is unique per user (random salt) and changes on PIN change.
pub(crate) fn packet_identifier(packet: &UserSecretsPacket) -> String {
    let digest: [u8; 32] = Sha256::digest(packet.pin_field()).into();
    URL_SAFE_NO_PAD.encode(digest)
}

impl Core {
    /// Mint a fresh authorization token for the account behind `packet`.
    pub(crate) fn mint_auth_token(&self, packet: &UserSecretsPacket) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AuthClaims {
            sub: packet_identifier(packet),
            iat: now,
            exp: now + self.cfg.token_lifetime.as_secs() as i64,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.token_key),
        )
        .map_err(|e| KeyshareError::Internal(format!("could not sign authorization token: {e}")))
    }

    /// Verify signature, expiry, and blob binding of an authorization token.
    pub(crate) fn verify_auth_token(
        &self,
        packet: &UserSecretsPacket,
        token: &str,
    ) -> Result<()> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<AuthClaims>(
            token,
            &DecodingKey::from_secret(&self.token_key),
            &validation,
        )
        .map_err(|_| KeyshareError::InvalidJwt)?;

        let expected = packet_identifier(packet);
        if !bool::from(data.claims.sub.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(KeyshareError::InvalidJwt);
        }
        Ok(())
    }

    /// Sign a completed `ProofP` as a compact JWS.
    pub(crate) fn sign_proof_p(&self, proof_p: ProofP) -> Result<String> {
        let claims = ProofPClaims {
            proof_p,
            iat: chrono::Utc::now().timestamp(),
            iss: self.cfg.issuer_name.clone(),
            sub: "ProofP".to_string(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.token_key),
        )
        .map_err(|e| KeyshareError::Internal(format!("could not sign response token: {e}")))
    }
}
