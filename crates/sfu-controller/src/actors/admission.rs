//! Admission key issuance/validation and the pending-admission record.
//!
//! - **Key derivation**: `HKDF-SHA256(master_secret, salt=sfu_id, info="admission-key")`
//! - **Key format**: `<nonce_hex>.<hmac_hex>` with `hmac = HMAC-SHA256(derived_key, nonce_hex)`
//! - **Validation**: format check, then constant-time verification via `ring::hmac::verify`

use crate::errors::{AdmissionKeyError, SfuError};
use crate::types::{AdmissionKey, Capabilities, PeerId};

use ring::{hkdf, hmac, rand};
use secrecy::{ExposeSecret, SecretBox};
use serde_json::Value;
use tokio::time::Instant;

/// Minimum master secret length (HMAC-SHA256 key size).
const MIN_MASTER_SECRET_LEN: usize = 32;

/// Nonce length in bytes.
const NONCE_LEN: usize = 16;

/// HMAC-SHA256 tag length in bytes.
const TAG_LEN: usize = 32;

/// Issues and validates admission keys for one SFU instance.
pub struct AdmissionKeyManager {
    /// Key derived from the master secret, scoped to this SFU instance.
    key: hmac::Key,
}

impl AdmissionKeyManager {
    /// Create a key manager for the SFU identified by `sfu_id`.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Config` if the master secret is shorter than 32 bytes.
    pub fn new(sfu_id: &str, master_secret: &SecretBox<Vec<u8>>) -> Result<Self, SfuError> {
        let secret = master_secret.expose_secret();
        if secret.len() < MIN_MASTER_SECRET_LEN {
            return Err(SfuError::Config(format!(
                "admission master secret must be at least {MIN_MASTER_SECRET_LEN} bytes"
            )));
        }

        let derived = derive_key(sfu_id, secret)?;
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &derived),
        })
    }

    /// Issue a fresh admission key.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the system RNG fails.
    pub fn issue(&self) -> Result<AdmissionKey, SfuError> {
        let rng = rand::SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::SecureRandom::fill(&rng, &mut nonce_bytes)
            .map_err(|_| SfuError::Internal("system RNG failure".to_string()))?;
        let nonce = hex::encode(nonce_bytes);

        let tag = hmac::sign(&self.key, nonce.as_bytes());
        Ok(AdmissionKey::new(format!(
            "{nonce}.{}",
            hex::encode(tag.as_ref())
        )))
    }

    /// Validate an admission key's format and signature.
    pub fn validate(&self, key: &AdmissionKey) -> Result<(), AdmissionKeyError> {
        let (nonce, tag_hex) = key
            .expose()
            .split_once('.')
            .ok_or(AdmissionKeyError::Malformed)?;

        if nonce.len() != NONCE_LEN * 2 || tag_hex.len() != TAG_LEN * 2 {
            return Err(AdmissionKeyError::Malformed);
        }
        if hex::decode(nonce).is_err() {
            return Err(AdmissionKeyError::Malformed);
        }
        let tag = hex::decode(tag_hex).map_err(|_| AdmissionKeyError::Malformed)?;

        hmac::verify(&self.key, nonce.as_bytes(), &tag)
            .map_err(|_| AdmissionKeyError::InvalidSignature)
    }
}

fn derive_key(sfu_id: &str, secret: &[u8]) -> Result<[u8; 32], SfuError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, sfu_id.as_bytes());
    let prk = salt.extract(secret);
    let okm = prk
        .expand(&[b"admission-key"], DerivedKeyLen)
        .map_err(|_| SfuError::Internal("HKDF expand failed".to_string()))?;

    let mut key = [0u8; 32];
    okm.fill(&mut key)
        .map_err(|_| SfuError::Internal("HKDF fill failed".to_string()))?;
    Ok(key)
}

/// HKDF output key length.
struct DerivedKeyLen;

impl hkdf::KeyType for DerivedKeyLen {
    fn len(&self) -> usize {
        32
    }
}

/// A join waiting for the admission authority's decision.
#[derive(Debug)]
pub struct PendingAdmission {
    pub key: AdmissionKey,
    pub peer_id: PeerId,
    pub metadata: Value,
    pub track_metadata: Value,
    pub capabilities: Capabilities,
    /// After this instant the join is treated as denied.
    pub deadline: Instant,
}

impl PendingAdmission {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager(sfu_id: &str, fill: u8) -> AdmissionKeyManager {
        AdmissionKeyManager::new(sfu_id, &SecretBox::new(Box::new(vec![fill; 32]))).unwrap()
    }

    #[test]
    fn test_issued_key_has_expected_shape() {
        let manager = test_manager("sfu-1", 0);
        let key = manager.issue().unwrap();

        let (nonce, tag) = key.expose().split_once('.').unwrap();
        assert_eq!(nonce.len(), 32);
        assert_eq!(tag.len(), 64);
        assert!(hex::decode(nonce).is_ok());
        assert!(hex::decode(tag).is_ok());
    }

    #[test]
    fn test_issued_key_validates() {
        let manager = test_manager("sfu-1", 0);
        let key = manager.issue().unwrap();
        assert_eq!(manager.validate(&key), Ok(()));
    }

    #[test]
    fn test_issued_keys_are_unique() {
        let manager = test_manager("sfu-1", 0);
        assert_ne!(manager.issue().unwrap(), manager.issue().unwrap());
    }

    #[test]
    fn test_key_from_other_sfu_is_rejected() {
        let key = test_manager("sfu-1", 0).issue().unwrap();
        let other = test_manager("sfu-2", 0);
        assert_eq!(
            other.validate(&key),
            Err(AdmissionKeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_key_from_other_secret_is_rejected() {
        let key = test_manager("sfu-1", 1).issue().unwrap();
        let other = test_manager("sfu-1", 2);
        assert_eq!(
            other.validate(&key),
            Err(AdmissionKeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_nonce_is_rejected() {
        let manager = test_manager("sfu-1", 0);
        let key = manager.issue().unwrap();
        let (_, tag) = key.expose().split_once('.').unwrap();
        let forged = AdmissionKey::new(format!("{}.{tag}", "0".repeat(32)));
        assert_eq!(
            manager.validate(&forged),
            Err(AdmissionKeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        let manager = test_manager("sfu-1", 0);
        let bad_nonce = format!("{}.{}", "z".repeat(32), "0".repeat(64));
        let bad_tag = format!("{}.{}", "0".repeat(32), "g".repeat(64));
        for raw in [
            "",
            "no-separator",
            "abcd.1234",
            bad_nonce.as_str(),
            bad_tag.as_str(),
        ] {
            assert_eq!(
                manager.validate(&AdmissionKey::from(raw)),
                Err(AdmissionKeyError::Malformed),
                "key {raw:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_short_master_secret_is_rejected() {
        let result = AdmissionKeyManager::new("sfu-1", &SecretBox::new(Box::new(vec![0u8; 16])));
        assert!(matches!(result, Err(SfuError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_admission_expiry() {
        let pending = PendingAdmission {
            key: AdmissionKey::from("k"),
            peer_id: PeerId::from("peer-1"),
            metadata: Value::Null,
            track_metadata: Value::Null,
            capabilities: Capabilities::default(),
            deadline: Instant::now() + Duration::from_secs(30),
        };

        assert!(!pending.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(pending.is_expired(Instant::now()));
    }
}
