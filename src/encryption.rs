//! # Encryption Gateway — envelope encryption, pseudonymization, k-anonymity
//!
//! Every message gets its own key: HKDF-SHA256 over (data key, fresh random
//! salt) feeds AES-256-GCM under a fresh random nonce. The envelope carries
//! the key ID and version so historical ciphertext survives rotation. A
//! failed authentication tag is both an error to the caller and a
//! `SecurityEvent` on the bus.

use crate::anonymizer::{self, DataCategory};
use crate::error::{AegisError, AegisResult};
use crate::event_bus::EventBus;
use crate::key_vault::KeyVault;
use crate::store::{KvStore, Repository};
use crate::types::SecurityEvent;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroize;

const PSEUDONYM_PREFIX: &str = "pseudonym_";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"aegis-envelope-v1";

/// Ciphertext plus everything needed to decrypt it later.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub key_id: String,
    pub key_version: u32,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub encrypted_at: DateTime<Utc>,
}

/// Persisted pseudonym mapping: (context, value hash) → surrogate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PseudonymRecord {
    context: String,
    pseudonym: String,
    created_at: i64,
}

pub struct EncryptionGateway {
    vault: Arc<KeyVault>,
    pseudonyms: Repository<PseudonymRecord>,
    bus: Arc<EventBus>,
}

impl EncryptionGateway {
    pub fn new(vault: Arc<KeyVault>, store: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Self {
        Self {
            vault,
            pseudonyms: Repository::new(store, PSEUDONYM_PREFIX),
            bus,
        }
    }

    fn derive_message_key(ikm: &[u8; 32], salt: &[u8]) -> AegisResult<[u8; 32]> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|_| AegisError::Integrity("key derivation failed".into()))?;
        Ok(okm)
    }

    /// Authenticated-encrypt `plaintext` under the active version of `key_id`.
    pub fn encrypt(&self, plaintext: &[u8], key_id: &str) -> AegisResult<Envelope> {
        let version = self.vault.current_version(key_id)?;
        let mut ikm = self.vault.key_material(key_id, Some(version))?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut msg_key = Self::derive_message_key(&ikm, &salt)?;
        ikm.zeroize();

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&msg_key));
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AegisError::Integrity("encryption failed".into()));
        msg_key.zeroize();

        Ok(Envelope {
            key_id: key_id.into(),
            key_version: version,
            salt: B64.encode(salt),
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ct?),
            encrypted_at: Utc::now(),
        })
    }

    /// Decrypt an envelope, resolving archived key versions as needed.
    /// A failed tag is logged as a security event and surfaced as
    /// [`AegisError::Integrity`].
    pub fn decrypt(&self, envelope: &Envelope) -> AegisResult<Vec<u8>> {
        let mut ikm = self
            .vault
            .key_material(&envelope.key_id, Some(envelope.key_version))?;

        let salt = B64
            .decode(&envelope.salt)
            .map_err(|_| AegisError::Validation("envelope salt is not valid base64".into()))?;
        let nonce = B64
            .decode(&envelope.nonce)
            .map_err(|_| AegisError::Validation("envelope nonce is not valid base64".into()))?;
        let ct = B64
            .decode(&envelope.ciphertext)
            .map_err(|_| AegisError::Validation("envelope ciphertext is not valid base64".into()))?;
        if nonce.len() != NONCE_LEN {
            return Err(AegisError::Validation("envelope nonce has wrong length".into()));
        }

        let mut msg_key = Self::derive_message_key(&ikm, &salt)?;
        ikm.zeroize();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&msg_key));
        let result = cipher.decrypt(Nonce::from_slice(&nonce), ct.as_ref());
        msg_key.zeroize();

        match result {
            Ok(pt) => Ok(pt),
            Err(_) => {
                warn!(key = %envelope.key_id, version = envelope.key_version, "Decrypt authentication failed");
                let mut event = SecurityEvent::new("decrypt_integrity_failure", None);
                event.metadata.insert("key_id".into(), envelope.key_id.clone());
                event
                    .metadata
                    .insert("key_version".into(), envelope.key_version.to_string());
                self.bus.security_events.publish(event);
                Err(AegisError::Integrity(format!(
                    "authentication failed for key '{}' v{}",
                    envelope.key_id, envelope.key_version
                )))
            }
        }
    }

    /// Category-specific masking. Pure and idempotent.
    pub fn anonymize(&self, value: &str, category: DataCategory) -> String {
        anonymizer::anonymize(value, category)
    }

    /// Deterministic surrogate for `value` within `context`. The same input
    /// always maps to the same pseudonym; a different context yields a
    /// different one. Mappings are persisted.
    pub fn pseudonymize(&self, value: &str, context: &str) -> AegisResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(context.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let mapping_id = format!("{}.{}", context, &digest[..32]);
        if let Some(existing) = self.pseudonyms.get(&mapping_id)? {
            return Ok(existing.pseudonym);
        }

        let pseudonym = format!("pn_{}", &digest[..16]);
        self.pseudonyms.put(
            &mapping_id,
            &PseudonymRecord {
                context: context.into(),
                pseudonym: pseudonym.clone(),
                created_at: Utc::now().timestamp(),
            },
        )?;
        Ok(pseudonym)
    }

    /// Enforce k-anonymity over `quasi_identifiers`: any group smaller than
    /// `k` has those fields suppressed; groups of size >= k pass unchanged.
    pub fn apply_k_anonymity(
        &self,
        records: &[HashMap<String, String>],
        quasi_identifiers: &[&str],
        k: usize,
    ) -> Vec<HashMap<String, String>> {
        let mut groups: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
        for (i, rec) in records.iter().enumerate() {
            let tuple: Vec<String> = quasi_identifiers
                .iter()
                .map(|q| rec.get(*q).cloned().unwrap_or_default())
                .collect();
            groups.entry(tuple).or_default().push(i);
        }

        let mut out: Vec<HashMap<String, String>> = records.to_vec();
        for indices in groups.values() {
            if indices.len() >= k {
                continue;
            }
            for &i in indices {
                for q in quasi_identifiers {
                    if let Some(v) = out[i].get_mut(*q) {
                        *v = "*".into();
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::{MasterKey, KEY_TYPE_AES_256_GCM};
    use crate::store::MemoryKvStore;

    fn gateway() -> (EncryptionGateway, Arc<KeyVault>, Arc<EventBus>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let vault = Arc::new(KeyVault::new(store.clone(), MasterKey::generate()));
        vault.create_key("data", KEY_TYPE_AES_256_GCM, 86400).unwrap();
        let bus = Arc::new(EventBus::new());
        (EncryptionGateway::new(vault.clone(), store, bus.clone()), vault, bus)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (gw, _, _) = gateway();
        let plaintext = b"the quick brown fox";
        let env = gw.encrypt(plaintext, "data").unwrap();
        assert_eq!(gw.decrypt(&env).unwrap(), plaintext);
    }

    #[test]
    fn test_tamper_detection_logs_security_event() {
        let (gw, _, bus) = gateway();
        let env = gw.encrypt(b"secret", "data").unwrap();

        let mut ct = B64.decode(&env.ciphertext).unwrap();
        ct[0] ^= 0x01;
        let tampered = Envelope { ciphertext: B64.encode(ct), ..env };

        assert!(matches!(gw.decrypt(&tampered), Err(AegisError::Integrity(_))));
        assert_eq!(bus.security_events.total_published(), 1);
        let logged = bus.security_events.recent(1);
        assert_eq!(logged[0].event_type, "decrypt_integrity_failure");
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let (gw, _, _) = gateway();
        assert!(matches!(
            gw.encrypt(b"x", "missing"),
            Err(AegisError::NotFound { .. })
        ));
    }

    #[test]
    fn test_old_envelopes_decrypt_after_rotation() {
        let (gw, vault, _) = gateway();
        let env = gw.encrypt(b"historical", "data").unwrap();
        vault.rotate_key("data").unwrap();

        let fresh = gw.encrypt(b"current", "data").unwrap();
        assert_eq!(fresh.key_version, 2);
        assert_eq!(gw.decrypt(&env).unwrap(), b"historical");
        assert_eq!(gw.decrypt(&fresh).unwrap(), b"current");
    }

    #[test]
    fn test_pseudonym_stability_and_context_separation() {
        let (gw, _, _) = gateway();
        let a1 = gw.pseudonymize("alice@example.com", "billing").unwrap();
        let a2 = gw.pseudonymize("alice@example.com", "billing").unwrap();
        let a3 = gw.pseudonymize("alice@example.com", "analytics").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
    }

    #[test]
    fn test_k_anonymity_suppresses_small_groups() {
        let (gw, _, _) = gateway();
        let mk = |zip: &str, age: &str, name: &str| {
            HashMap::from([
                ("zip".to_string(), zip.to_string()),
                ("age".to_string(), age.to_string()),
                ("name".to_string(), name.to_string()),
            ])
        };
        let records = vec![
            mk("10001", "30", "a"),
            mk("10001", "30", "b"),
            mk("10001", "30", "c"),
            mk("94105", "41", "d"),
        ];
        let out = gw.apply_k_anonymity(&records, &["zip", "age"], 3);

        // The group of three passes; the singleton is suppressed.
        for rec in &out[..3] {
            assert_eq!(rec["zip"], "10001");
        }
        assert_eq!(out[3]["zip"], "*");
        assert_eq!(out[3]["age"], "*");
        assert_eq!(out[3]["name"], "d");
    }
}
