//! Cryptographic core of the keyshare server
//!
//! Custody of the encryption key ring, the blob MAC key, the token signing
//! key, and the trusted issuer public keys. Every operation that touches a
//! user's secrets blob decrypts it in here; plaintext never leaves the core.
//!
//! The key ring and trusted-key set are append-only after startup and sit
//! behind read-mostly locks; the live commitment table is concurrent and
//! swept in the background.

mod commitments;
pub mod packet;
mod token;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::watch;
use tracing::warn;

use crate::idemix::{
    IssuerPublicKey, ProofP, ProofPCommitment, PublicKeyIdentifier, CHALLENGE_BITS,
    COMMITMENT_BITS, KEYSHARE_SECRET_BITS,
};
use crate::types::{KeyshareError, Result};

use commitments::CommitmentTable;
use packet::{new_pin_field, pin_field_matches, UserSecretsPacket};

pub use token::{AuthClaims, ProofPClaims};

/// 32-byte AES key as installed into the ring.
pub type AesKey = [u8; 32];

/// Tunables the core reads on the request path.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Lifetime of authorization tokens minted on PIN success.
    pub token_lifetime: Duration,
    /// How long commitment randomness stays usable.
    pub commitment_ttl: Duration,
    /// Longest accepted PIN, in bytes.
    pub pin_length_limit: usize,
    /// `iss` claim on signed responses.
    pub issuer_name: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            token_lifetime: Duration::from_secs(300),
            commitment_ttl: Duration::from_secs(10),
            pin_length_limit: 64,
            issuer_name: "keyshare_server".to_string(),
        }
    }
}

/// Decryption keys by id, with one designated for encryption.
struct KeyRing {
    keys: HashMap<u32, AesKey>,
    current: Option<u32>,
}

pub struct Core {
    cfg: CoreConfig,
    key_ring: RwLock<KeyRing>,
    mac_key: [u8; 32],
    token_key: [u8; 32],
    trusted_keys: RwLock<HashMap<PublicKeyIdentifier, Arc<IssuerPublicKey>>>,
    commitments: Arc<CommitmentTable>,
}

impl Core {
    pub fn new(cfg: CoreConfig, mac_key: [u8; 32], token_key: [u8; 32]) -> Self {
        let commitment_ttl = cfg.commitment_ttl;
        Self {
            cfg,
            key_ring: RwLock::new(KeyRing {
                keys: HashMap::new(),
                current: None,
            }),
            mac_key,
            token_key,
            trusted_keys: RwLock::new(HashMap::new()),
            commitments: Arc::new(CommitmentTable::new(commitment_ttl)),
        }
    }

    /// Core with freshly drawn MAC and token keys. Blobs and tokens minted by
    /// it do not survive a restart; meant for tests and ephemeral dev setups.
    pub fn new_random(cfg: CoreConfig) -> Self {
        let mut mac_key = [0u8; 32];
        let mut token_key = [0u8; 32];
        OsRng.fill_bytes(&mut mac_key);
        OsRng.fill_bytes(&mut token_key);
        Self::new(cfg, mac_key, token_key)
    }

    // ------------------------------------------------------------------
    // Administrative operations, not on the request path
    // ------------------------------------------------------------------

    /// Install a decryption key. Does not touch the current encryption key.
    pub fn dangerous_add_aes_key(&self, key_id: u32, key: AesKey) {
        let mut ring = self.key_ring.write().expect("key ring lock poisoned");
        ring.keys.insert(key_id, key);
    }

    /// Install a key and designate it for encryption of new blobs.
    pub fn dangerous_set_aes_encryption_key(&self, key_id: u32, key: AesKey) {
        let mut ring = self.key_ring.write().expect("key ring lock poisoned");
        ring.keys.insert(key_id, key);
        ring.current = Some(key_id);
    }

    /// Add an issuer public key to the trusted set. The set only grows; a key
    /// once added is never replaced during a process lifetime.
    pub fn dangerous_add_trusted_public_key(
        &self,
        pkid: PublicKeyIdentifier,
        key: IssuerPublicKey,
    ) {
        let mut trusted = self.trusted_keys.write().expect("trusted keys lock poisoned");
        if trusted.contains_key(&pkid) {
            warn!(%pkid, "Ignoring repeated registration of trusted public key");
            return;
        }
        trusted.insert(pkid, Arc::new(key));
    }

    /// Start the background sweeper for expired commitment records.
    pub fn spawn_commitment_sweeper(&self, shutdown: watch::Receiver<bool>) {
        commitments::spawn_sweeper(
            Arc::clone(&self.commitments),
            self.cfg.commitment_ttl,
            shutdown,
        );
    }

    pub(crate) fn current_encryption_key(&self) -> Result<(u32, AesKey)> {
        let ring = self
            .key_ring
            .read()
            .map_err(|_| KeyshareError::Internal("key ring lock poisoned".into()))?;
        let id = ring.current.ok_or(KeyshareError::UnknownKey)?;
        let key = ring.keys.get(&id).ok_or(KeyshareError::UnknownKey)?;
        Ok((id, *key))
    }

    pub(crate) fn decryption_key(&self, key_id: u32) -> Result<AesKey> {
        let ring = self
            .key_ring
            .read()
            .map_err(|_| KeyshareError::Internal("key ring lock poisoned".into()))?;
        ring.keys
            .get(&key_id)
            .copied()
            .ok_or(KeyshareError::UnknownKey)
    }

    fn trusted_key(&self, pkid: &PublicKeyIdentifier) -> Result<Arc<IssuerPublicKey>> {
        let trusted = self
            .trusted_keys
            .read()
            .map_err(|_| KeyshareError::Internal("trusted keys lock poisoned".into()))?;
        trusted.get(pkid).cloned().ok_or(KeyshareError::UnknownKey)
    }

    fn check_pin_length(&self, pin: &str) -> Result<()> {
        if pin.len() > self.cfg.pin_length_limit {
            return Err(KeyshareError::PinTooLong);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request-path operations
    // ------------------------------------------------------------------

    /// Build the encrypted secrets blob for a new user: fresh salt, salted
    /// PIN hash, and a random keyshare secret in the statistical-ZK range.
    pub fn new_user_secrets(&self, pin: &str) -> Result<Vec<u8>> {
        self.check_pin_length(pin)?;
        let secret = OsRng.gen_biguint(KEYSHARE_SECRET_BITS);
        let packet = UserSecretsPacket::new(new_pin_field(pin), &secret)?;
        self.encrypt_packet(&packet)
    }

    /// Check a PIN against the blob; on a match, mint an authorization token.
    pub fn validate_pin(&self, secrets: &[u8], pin: &str) -> Result<String> {
        let packet = self.decrypt_packet(secrets)?;
        if !pin_field_matches(packet.pin_field(), pin) {
            return Err(KeyshareError::InvalidPin);
        }
        self.mint_auth_token(&packet)
    }

    /// Verify the old PIN and re-encrypt the blob with a fresh salt under the
    /// current encryption key. Doubles as the key-rotation opportunity.
    pub fn change_pin(&self, secrets: &[u8], old_pin: &str, new_pin: &str) -> Result<Vec<u8>> {
        self.check_pin_length(new_pin)?;
        let mut packet = self.decrypt_packet(secrets)?;
        if !pin_field_matches(packet.pin_field(), old_pin) {
            return Err(KeyshareError::InvalidPin);
        }
        packet.set_pin_field(new_pin_field(new_pin));
        self.encrypt_packet(&packet)
    }

    /// Pure token verification, used by the authorization middleware.
    pub fn validate_jwt(&self, secrets: &[u8], auth_token: &str) -> Result<()> {
        let packet = self.decrypt_packet(secrets)?;
        self.verify_auth_token(&packet, auth_token)
    }

    /// Produce the first Schnorr message for every requested public key and
    /// park the randomness under a fresh commitment identifier.
    pub fn generate_commitments(
        &self,
        secrets: &[u8],
        auth_token: &str,
        keys: &[PublicKeyIdentifier],
    ) -> Result<(Vec<ProofPCommitment>, u64)> {
        let packet = self.decrypt_packet(secrets)?;
        self.verify_auth_token(&packet, auth_token)?;

        let secret = packet.keyshare_secret();
        let mut out = Vec::with_capacity(keys.len());
        let mut randomizers = Vec::with_capacity(keys.len());
        for pkid in keys {
            let key = self.trusted_key(pkid)?;
            let w = OsRng.gen_biguint(COMMITMENT_BITS);
            out.push(ProofPCommitment {
                p: key.secret_base().modpow(&secret, &key.n),
                p_commit: key.secret_base().modpow(&w, &key.n),
            });
            randomizers.push((pkid.clone(), w));
        }

        let commit_id = self.commitments.insert(randomizers);
        Ok((out, commit_id))
    }

    /// Complete the Schnorr exchange: `s = w + c*m` over the integers, using
    /// the randomness reserved for `key_id`. Consumes the commitment record.
    pub fn generate_response(
        &self,
        secrets: &[u8],
        auth_token: &str,
        commit_id: u64,
        challenge: &BigUint,
        key_id: &PublicKeyIdentifier,
    ) -> Result<String> {
        let packet = self.decrypt_packet(secrets)?;
        self.verify_auth_token(&packet, auth_token)?;

        if challenge.bits() > CHALLENGE_BITS {
            return Err(KeyshareError::InvalidChallenge);
        }

        let record = self
            .commitments
            .take(commit_id)
            .ok_or(KeyshareError::InvalidChallenge)?;
        let w = record
            .randomizers
            .iter()
            .find(|(pkid, _)| pkid == key_id)
            .map(|(_, w)| w)
            .ok_or(KeyshareError::InvalidChallenge)?;

        let key = self.trusted_key(key_id)?;
        let secret = packet.keyshare_secret();
        let proof_p = ProofP {
            p: key.secret_base().modpow(&secret, &key.n),
            c: challenge.clone(),
            s_response: w + challenge * &secret,
        };
        self.sign_proof_p(proof_p)
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    use super::*;

    fn test_core() -> Core {
        let core = Core::new_random(CoreConfig::default());
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        core.dangerous_set_aes_encryption_key(1, key);
        core
    }

    fn demo_key() -> IssuerPublicKey {
        // Small RSA-style modulus; big enough to exercise the arithmetic
        IssuerPublicKey::new(
            BigUint::from(1009u32) * BigUint::from(1013u32),
            vec![BigUint::from(5u32), BigUint::from(7u32)],
        )
    }

    fn pkid(issuer: &str) -> PublicKeyIdentifier {
        PublicKeyIdentifier::new(issuer, 2)
    }

    fn decode_proof(jws: &str) -> ProofP {
        let payload = jws.split('.').nth(1).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        let claims: ProofPClaims = serde_json::from_slice(&bytes).unwrap();
        claims.proof_p
    }

    #[test]
    fn test_pin_roundtrip() {
        let core = test_core();
        let secrets = core.new_user_secrets("12345").unwrap();

        let token = core.validate_pin(&secrets, "12345").unwrap();
        core.validate_jwt(&secrets, &token).unwrap();
        assert!(matches!(
            core.validate_pin(&secrets, "54321"),
            Err(KeyshareError::InvalidPin)
        ));
    }

    #[test]
    fn test_pin_too_long() {
        let core = test_core();
        let long_pin = "x".repeat(65);
        assert!(matches!(
            core.new_user_secrets(&long_pin),
            Err(KeyshareError::PinTooLong)
        ));

        let secrets = core.new_user_secrets("12345").unwrap();
        assert!(matches!(
            core.change_pin(&secrets, "12345", &long_pin),
            Err(KeyshareError::PinTooLong)
        ));
    }

    #[test]
    fn test_change_pin_roundtrip() {
        let core = test_core();
        let secrets = core.new_user_secrets("12345").unwrap();

        assert!(matches!(
            core.change_pin(&secrets, "99999", "67890"),
            Err(KeyshareError::InvalidPin)
        ));

        let changed = core.change_pin(&secrets, "12345", "67890").unwrap();
        assert!(core.validate_pin(&changed, "67890").is_ok());
        assert!(matches!(
            core.validate_pin(&changed, "12345"),
            Err(KeyshareError::InvalidPin)
        ));
    }

    #[test]
    fn test_change_pin_rotates_to_current_key() {
        let core = test_core();
        let secrets = core.new_user_secrets("12345").unwrap();
        assert_eq!(u32::from_be_bytes(secrets[..4].try_into().unwrap()), 1);

        let mut key2 = [0u8; 32];
        OsRng.fill_bytes(&mut key2);
        core.dangerous_set_aes_encryption_key(2, key2);

        let changed = core.change_pin(&secrets, "12345", "67890").unwrap();
        assert_eq!(u32::from_be_bytes(changed[..4].try_into().unwrap()), 2);
        // The old blob still decrypts under the retained key 1
        assert!(core.validate_pin(&secrets, "12345").is_ok());
    }

    #[test]
    fn test_commitment_response_schnorr_equation() {
        let core = test_core();
        core.dangerous_add_trusted_public_key(pkid("demo.RU"), demo_key());
        core.dangerous_add_trusted_public_key(pkid("demo.MO"), demo_key());

        let secrets = core.new_user_secrets("12345").unwrap();
        let token = core.validate_pin(&secrets, "12345").unwrap();

        let keys = [pkid("demo.RU"), pkid("demo.MO")];
        let (commitments, commit_id) = core
            .generate_commitments(&secrets, &token, &keys)
            .unwrap();
        assert_eq!(commitments.len(), 2);

        let challenge = OsRng.gen_biguint(CHALLENGE_BITS);
        let jws = core
            .generate_response(&secrets, &token, commit_id, &challenge, &keys[0])
            .unwrap();
        let proof = decode_proof(&jws);

        // R^s == W * P^c (mod n) must hold for the committed key
        let key = demo_key();
        let lhs = key.secret_base().modpow(&proof.s_response, &key.n);
        let rhs = (&commitments[0].p_commit * proof.p.modpow(&proof.c, &key.n)) % &key.n;
        assert_eq!(lhs, rhs);
        assert_eq!(proof.c, challenge);
        assert_eq!(proof.p, commitments[0].p);
    }

    #[test]
    fn test_commitments_require_valid_token() {
        let core = test_core();
        core.dangerous_add_trusted_public_key(pkid("demo.RU"), demo_key());
        let secrets = core.new_user_secrets("12345").unwrap();

        assert!(matches!(
            core.generate_commitments(&secrets, "bogus", &[pkid("demo.RU")]),
            Err(KeyshareError::InvalidJwt)
        ));
    }

    #[test]
    fn test_commitments_unknown_public_key() {
        let core = test_core();
        let secrets = core.new_user_secrets("12345").unwrap();
        let token = core.validate_pin(&secrets, "12345").unwrap();

        assert!(matches!(
            core.generate_commitments(&secrets, &token, &[pkid("demo.RU")]),
            Err(KeyshareError::UnknownKey)
        ));
    }

    #[test]
    fn test_response_single_use() {
        let core = test_core();
        core.dangerous_add_trusted_public_key(pkid("demo.RU"), demo_key());
        let secrets = core.new_user_secrets("12345").unwrap();
        let token = core.validate_pin(&secrets, "12345").unwrap();

        let (_, commit_id) = core
            .generate_commitments(&secrets, &token, &[pkid("demo.RU")])
            .unwrap();
        let challenge = BigUint::from(1234567u32);
        core.generate_response(&secrets, &token, commit_id, &challenge, &pkid("demo.RU"))
            .unwrap();

        assert!(matches!(
            core.generate_response(&secrets, &token, commit_id, &challenge, &pkid("demo.RU")),
            Err(KeyshareError::InvalidChallenge)
        ));
    }

    #[test]
    fn test_response_commitment_ttl() {
        let core = Core::new_random(CoreConfig {
            commitment_ttl: Duration::from_millis(20),
            ..CoreConfig::default()
        });
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        core.dangerous_set_aes_encryption_key(1, key);
        core.dangerous_add_trusted_public_key(pkid("demo.RU"), demo_key());

        let secrets = core.new_user_secrets("12345").unwrap();
        let token = core.validate_pin(&secrets, "12345").unwrap();
        let (_, commit_id) = core
            .generate_commitments(&secrets, &token, &[pkid("demo.RU")])
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            core.generate_response(
                &secrets,
                &token,
                commit_id,
                &BigUint::from(7u32),
                &pkid("demo.RU")
            ),
            Err(KeyshareError::InvalidChallenge)
        ));
    }

    #[test]
    fn test_response_oversized_challenge() {
        let core = test_core();
        core.dangerous_add_trusted_public_key(pkid("demo.RU"), demo_key());
        let secrets = core.new_user_secrets("12345").unwrap();
        let token = core.validate_pin(&secrets, "12345").unwrap();
        let (_, commit_id) = core
            .generate_commitments(&secrets, &token, &[pkid("demo.RU")])
            .unwrap();

        let oversized = OsRng.gen_biguint(CHALLENGE_BITS + 64) | (BigUint::from(1u32) << CHALLENGE_BITS);
        assert!(matches!(
            core.generate_response(&secrets, &token, commit_id, &oversized, &pkid("demo.RU")),
            Err(KeyshareError::InvalidChallenge)
        ));
    }

    #[test]
    fn test_tampered_blob_rejected_by_operations() {
        let core = test_core();
        let mut secrets = core.new_user_secrets("12345").unwrap();
        let mid = secrets.len() / 2;
        secrets[mid] ^= 0xff;

        assert!(matches!(
            core.validate_pin(&secrets, "12345"),
            Err(KeyshareError::InvalidBlob)
        ));
        assert!(matches!(
            core.generate_commitments(&secrets, "token", &[pkid("demo.RU")]),
            Err(KeyshareError::InvalidBlob)
        ));
    }
}
