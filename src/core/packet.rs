//! User secrets blob: fixed inner layout and encrypt-then-MAC framing
//!
//! On the wire a blob is `key_id[4 BE] || iv[16] || ct[96] || mac[32]`, 148
//! bytes total. The inner plaintext is `pin_field[64] || secret[32 BE]`,
//! where the PIN field packs the per-user salt next to the salted hash so the
//! blob stays self-contained:
//!
//! ```text
//! pin_field = salt[32] || SHA-256(salt || pin)[32]
//! ```
//!
//! Any tampering with the blob must surface as `InvalidBlob`, never as a
//! silent decrypt to garbage; the MAC covers the key id and IV as well as the
//! ciphertext.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::idemix::KEYSHARE_SECRET_BYTES;
use crate::types::{KeyshareError, Result};

use super::Core;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Salt and salted-hash halves of the PIN field.
pub(crate) const SALT_LEN: usize = 32;
pub(crate) const PIN_HASH_LEN: usize = 32;

/// Width of the salted-PIN-hash field inside the packet.
pub const PIN_FIELD_LEN: usize = SALT_LEN + PIN_HASH_LEN;

/// Width of the packet plaintext.
pub const INNER_LEN: usize = PIN_FIELD_LEN + KEYSHARE_SECRET_BYTES;

const KEY_ID_LEN: usize = 4;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Total blob length on the wire.
pub const BLOB_LEN: usize = KEY_ID_LEN + IV_LEN + INNER_LEN + MAC_LEN;

/// Decrypted packet contents. Zeroized on drop; the plaintext never leaves
/// the core.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct UserSecretsPacket([u8; INNER_LEN]);

impl std::fmt::Debug for UserSecretsPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSecretsPacket").finish_non_exhaustive()
    }
}

impl UserSecretsPacket {
    pub(crate) fn new(pin_field: [u8; PIN_FIELD_LEN], secret: &BigUint) -> Result<Self> {
        let mut packet = Self([0u8; INNER_LEN]);
        packet.0[..PIN_FIELD_LEN].copy_from_slice(&pin_field);
        packet.set_keyshare_secret(secret)?;
        Ok(packet)
    }

    fn from_inner(inner: [u8; INNER_LEN]) -> Self {
        Self(inner)
    }

    pub(crate) fn pin_field(&self) -> &[u8] {
        &self.0[..PIN_FIELD_LEN]
    }

    pub(crate) fn set_pin_field(&mut self, field: [u8; PIN_FIELD_LEN]) {
        self.0[..PIN_FIELD_LEN].copy_from_slice(&field);
    }

    pub(crate) fn keyshare_secret(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0[PIN_FIELD_LEN..])
    }

    fn set_keyshare_secret(&mut self, secret: &BigUint) -> Result<()> {
        let bytes = secret.to_bytes_be();
        if bytes.len() > KEYSHARE_SECRET_BYTES {
            return Err(KeyshareError::Internal(
                "keyshare secret exceeds fixed field width".into(),
            ));
        }
        let field = &mut self.0[PIN_FIELD_LEN..];
        field.fill(0);
        field[KEYSHARE_SECRET_BYTES - bytes.len()..].copy_from_slice(&bytes);
        Ok(())
    }
}

/// Compute the salted hash half of a PIN field.
fn salted_pin_hash(salt: &[u8], pin: &str) -> [u8; PIN_HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

/// Build a fresh PIN field with a newly drawn salt.
pub(crate) fn new_pin_field(pin: &str) -> [u8; PIN_FIELD_LEN] {
    let mut field = [0u8; PIN_FIELD_LEN];
    OsRng.fill_bytes(&mut field[..SALT_LEN]);
    let hash = salted_pin_hash(&field[..SALT_LEN], pin);
    field[SALT_LEN..].copy_from_slice(&hash);
    field
}

/// Recompute the salted hash against a stored PIN field, in constant time.
pub(crate) fn pin_field_matches(field: &[u8], pin: &str) -> bool {
    let hash = salted_pin_hash(&field[..SALT_LEN], pin);
    bool::from(hash.ct_eq(&field[SALT_LEN..]))
}

impl Core {
    /// Encrypt a packet under the current encryption key.
    pub(crate) fn encrypt_packet(&self, packet: &UserSecretsPacket) -> Result<Vec<u8>> {
        let (key_id, key) = self.current_encryption_key()?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut ct = packet.0;
        let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
        cipher.apply_keystream(&mut ct);

        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.extend_from_slice(&key_id.to_be_bytes());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ct);
        let tag = self.blob_mac(&blob)?;
        blob.extend_from_slice(&tag);
        ct.zeroize();
        Ok(blob)
    }

    /// Verify and decrypt a blob. Fails with `UnknownKey` for an unrecognized
    /// key id and `InvalidBlob` for anything malformed or tampered with.
    pub(crate) fn decrypt_packet(&self, blob: &[u8]) -> Result<UserSecretsPacket> {
        if blob.len() != BLOB_LEN {
            return Err(KeyshareError::InvalidBlob);
        }

        let key_id = u32::from_be_bytes(
            blob[..KEY_ID_LEN]
                .try_into()
                .map_err(|_| KeyshareError::InvalidBlob)?,
        );
        let key = self.decryption_key(key_id)?;

        let prefix = &blob[..BLOB_LEN - MAC_LEN];
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| KeyshareError::Internal(format!("mac init failed: {e}")))?;
        mac.update(prefix);
        mac.verify_slice(&blob[BLOB_LEN - MAC_LEN..])
            .map_err(|_| KeyshareError::InvalidBlob)?;

        let iv: [u8; IV_LEN] = blob[KEY_ID_LEN..KEY_ID_LEN + IV_LEN]
            .try_into()
            .map_err(|_| KeyshareError::InvalidBlob)?;
        let mut inner = [0u8; INNER_LEN];
        inner.copy_from_slice(&blob[KEY_ID_LEN + IV_LEN..BLOB_LEN - MAC_LEN]);
        let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
        cipher.apply_keystream(&mut inner);

        Ok(UserSecretsPacket::from_inner(inner))
    }

    fn blob_mac(&self, prefix: &[u8]) -> Result<[u8; MAC_LEN]> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| KeyshareError::Internal(format!("mac init failed: {e}")))?;
        mac.update(prefix);
        Ok(mac.finalize().into_bytes().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Core, CoreConfig};

    fn test_core() -> Core {
        let core = Core::new_random(CoreConfig::default());
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        core.dangerous_set_aes_encryption_key(1, key);
        core
    }

    fn test_packet() -> UserSecretsPacket {
        UserSecretsPacket::new(new_pin_field("12345"), &BigUint::from(51232u32)).unwrap()
    }

    #[test]
    fn test_packet_access() {
        let secret = BigUint::from(51232u32);
        let field = new_pin_field("12345");
        let packet = UserSecretsPacket::new(field, &secret).unwrap();
        assert_eq!(packet.pin_field(), &field);
        assert_eq!(packet.keyshare_secret(), secret);
    }

    #[test]
    fn test_pin_field_matching() {
        let field = new_pin_field("12345");
        assert!(pin_field_matches(&field, "12345"));
        assert!(!pin_field_matches(&field, "54321"));

        // Fresh salts make fields differ even for equal PINs
        assert_ne!(field, new_pin_field("12345"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let core = test_core();
        let packet = test_packet();

        let blob = core.encrypt_packet(&packet).unwrap();
        assert_eq!(blob.len(), BLOB_LEN);

        let decrypted = core.decrypt_packet(&blob).unwrap();
        assert_eq!(decrypted.pin_field(), packet.pin_field());
        assert_eq!(decrypted.keyshare_secret(), packet.keyshare_secret());
    }

    #[test]
    fn test_tampering_detected_on_every_byte() {
        let core = test_core();
        let blob = core.encrypt_packet(&test_packet()).unwrap();

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            let err = core.decrypt_packet(&tampered).unwrap_err();
            // A flipped key-id byte is an unknown key; anything else must be
            // caught by the MAC.
            match err {
                KeyshareError::InvalidBlob => {}
                KeyshareError::UnknownKey => assert!(i < KEY_ID_LEN),
                other => panic!("unexpected error at byte {i}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let core = test_core();
        let blob = core.encrypt_packet(&test_packet()).unwrap();
        assert!(matches!(
            core.decrypt_packet(&blob[..blob.len() - 1]),
            Err(KeyshareError::InvalidBlob)
        ));
        assert!(matches!(
            core.decrypt_packet(&[]),
            Err(KeyshareError::InvalidBlob)
        ));
    }

    #[test]
    fn test_multi_key_decryption() {
        let core = test_core();
        let packet = test_packet();
        let blob_k1 = core.encrypt_packet(&packet).unwrap();

        // Install a second key and make it current
        let mut key2 = [0u8; 32];
        OsRng.fill_bytes(&mut key2);
        core.dangerous_set_aes_encryption_key(2, key2);
        let blob_k2 = core.encrypt_packet(&packet).unwrap();

        // Blobs under either key still decrypt
        assert_eq!(
            core.decrypt_packet(&blob_k1).unwrap().keyshare_secret(),
            packet.keyshare_secret()
        );
        assert_eq!(
            core.decrypt_packet(&blob_k2).unwrap().keyshare_secret(),
            packet.keyshare_secret()
        );

        // New encryptions use the current key id
        assert_eq!(u32::from_be_bytes(blob_k2[..4].try_into().unwrap()), 2);
    }

    #[test]
    fn test_unknown_key_id() {
        let core = test_core();
        let mut blob = core.encrypt_packet(&test_packet()).unwrap();
        blob[3] = 99;
        assert!(matches!(
            core.decrypt_packet(&blob),
            Err(KeyshareError::UnknownKey)
        ));
    }
}
