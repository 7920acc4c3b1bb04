//! # Key Vault — encryption-key lifecycle
//!
//! Data keys are generated from the OS RNG and wrapped under a long-lived
//! master key with AES-256-GCM (envelope encryption). Every version of a key
//! is retained: rotation archives the current version and activates
//! version+1, so ciphertext produced under any prior version stays
//! decryptable. Exactly one version per key ID is active at a time.

use crate::error::{AegisError, AegisResult};
use crate::store::{KvStore, Repository};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_PREFIX: &str = "key_";
const NONCE_LEN: usize = 12;

/// The only key type the vault will generate. Anything else is rejected
/// rather than silently downgraded.
pub const KEY_TYPE_AES_256_GCM: &str = "aes-256-gcm";

#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Load the master key from `path`, generating and persisting one on
    /// first boot.
    pub fn load_or_create(path: &Path) -> AegisResult<Self> {
        if path.exists() {
            let raw = std::fs::read(path)?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| AegisError::Integrity("master key file is malformed".into()))?;
            Ok(Self { bytes })
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let key = Self::generate();
            std::fs::write(path, key.bytes)?;
            info!(path = %path.display(), "Master key generated");
            Ok(key)
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum KeyStatus {
    Active,
    Archived,
    Revoked,
    Expired,
}

/// One persisted key version: metadata plus the wrapped key material.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub key_type: String,
    pub version: u32,
    pub status: KeyStatus,
    pub rotation_interval_secs: i64,
    pub created_at: i64,
    pub last_rotated: i64,
    /// base64(nonce || AES-GCM(master, data_key))
    wrapped_key: String,
}

/// Public view of a key version, without the wrapped material.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyMetadata {
    pub id: String,
    pub key_type: String,
    pub version: u32,
    pub status: KeyStatus,
    pub rotation_interval_secs: i64,
    pub created_at: i64,
    pub last_rotated: i64,
}

impl From<&KeyRecord> for KeyMetadata {
    fn from(r: &KeyRecord) -> Self {
        Self {
            id: r.id.clone(),
            key_type: r.key_type.clone(),
            version: r.version,
            status: r.status,
            rotation_interval_secs: r.rotation_interval_secs,
            created_at: r.created_at,
            last_rotated: r.last_rotated,
        }
    }
}

/// Head pointer: which version of a key ID is current.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct KeyHead {
    id: String,
    current_version: u32,
}

/// Outcome of a scheduled-rotation batch. Individual failures never abort
/// the batch; they are reported here.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RotationReport {
    pub checked: usize,
    pub rotated: Vec<String>,
    pub failures: Vec<(String, String)>,
}

pub struct KeyVault {
    versions: Repository<KeyRecord>,
    heads: Repository<KeyHead>,
    master: RwLock<Option<MasterKey>>,
}

impl KeyVault {
    pub fn new(store: Arc<dyn KvStore>, master: MasterKey) -> Self {
        Self {
            versions: Repository::new(store.clone(), KEY_PREFIX),
            heads: Repository::new(store, KEY_PREFIX),
            master: RwLock::new(Some(master)),
        }
    }

    /// A vault with no master key: every material operation fails with a
    /// state error. Used to surface misconfigured boots loudly.
    pub fn without_master(store: Arc<dyn KvStore>) -> Self {
        Self {
            versions: Repository::new(store.clone(), KEY_PREFIX),
            heads: Repository::new(store, KEY_PREFIX),
            master: RwLock::new(None),
        }
    }

    fn version_id(id: &str, version: u32) -> String {
        format!("{}.v{}", id, version)
    }

    fn head_id(id: &str) -> String {
        format!("{}.head", id)
    }

    fn wrap(&self, data_key: &[u8; 32]) -> AegisResult<String> {
        let master = self.master.read();
        let master = master
            .as_ref()
            .ok_or_else(|| AegisError::State("master key is not configured".into()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master.bytes));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), data_key.as_slice())
            .map_err(|_| AegisError::Integrity("key wrap failed".into()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ct);
        Ok(B64.encode(blob))
    }

    fn unwrap(&self, wrapped: &str) -> AegisResult<[u8; 32]> {
        let master = self.master.read();
        let master = master
            .as_ref()
            .ok_or_else(|| AegisError::State("master key is not configured".into()))?;
        let blob = B64
            .decode(wrapped)
            .map_err(|_| AegisError::Integrity("wrapped key is not valid base64".into()))?;
        if blob.len() < NONCE_LEN {
            return Err(AegisError::Integrity("wrapped key blob too short".into()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master.bytes));
        let mut pt = cipher
            .decrypt(Nonce::from_slice(&blob[..NONCE_LEN]), &blob[NONCE_LEN..])
            .map_err(|_| AegisError::Integrity("key unwrap failed".into()))?;
        let bytes: [u8; 32] = pt
            .as_slice()
            .try_into()
            .map_err(|_| AegisError::Integrity("unwrapped key has wrong length".into()))?;
        pt.zeroize();
        Ok(bytes)
    }

    /// Generate a new key: version 1, active. Fails if the ID is taken or
    /// the master key is missing.
    pub fn create_key(
        &self,
        id: &str,
        key_type: &str,
        rotation_interval_secs: i64,
    ) -> AegisResult<KeyMetadata> {
        if id.is_empty() {
            return Err(AegisError::Validation("key id must not be empty".into()));
        }
        if key_type != KEY_TYPE_AES_256_GCM {
            return Err(AegisError::Validation(format!(
                "unsupported key type '{}': only {} keys are generated",
                key_type, KEY_TYPE_AES_256_GCM
            )));
        }
        if rotation_interval_secs <= 0 {
            return Err(AegisError::Validation(
                "rotation interval must be positive".into(),
            ));
        }
        if self.heads.get(&Self::head_id(id))?.is_some() {
            return Err(AegisError::Validation(format!("key '{}' already exists", id)));
        }

        let mut data_key = [0u8; 32];
        OsRng.fill_bytes(&mut data_key);
        let wrapped = self.wrap(&data_key)?;
        data_key.zeroize();

        let now = chrono::Utc::now().timestamp();
        let record = KeyRecord {
            id: id.into(),
            key_type: key_type.into(),
            version: 1,
            status: KeyStatus::Active,
            rotation_interval_secs,
            created_at: now,
            last_rotated: now,
            wrapped_key: wrapped,
        };
        self.versions.put(&Self::version_id(id, 1), &record)?;
        self.heads.put(&Self::head_id(id), &KeyHead { id: id.into(), current_version: 1 })?;
        info!(key = %id, "Key created (v1, active)");
        Ok(KeyMetadata::from(&record))
    }

    /// Archive the current version and activate version+1 with fresh
    /// material. Prior versions stay decryptable.
    pub fn rotate_key(&self, id: &str) -> AegisResult<KeyMetadata> {
        let head = self
            .heads
            .get(&Self::head_id(id))?
            .ok_or_else(|| AegisError::not_found("key", id))?;
        let mut current = self
            .versions
            .get(&Self::version_id(id, head.current_version))?
            .ok_or_else(|| AegisError::not_found("key version", Self::version_id(id, head.current_version)))?;

        current.status = KeyStatus::Archived;
        self.versions.put(&Self::version_id(id, current.version), &current)?;

        let mut data_key = [0u8; 32];
        OsRng.fill_bytes(&mut data_key);
        let wrapped = self.wrap(&data_key)?;
        data_key.zeroize();

        let now = chrono::Utc::now().timestamp();
        let next = KeyRecord {
            id: id.into(),
            key_type: current.key_type.clone(),
            version: current.version + 1,
            status: KeyStatus::Active,
            rotation_interval_secs: current.rotation_interval_secs,
            created_at: current.created_at,
            last_rotated: now,
            wrapped_key: wrapped,
        };
        self.versions.put(&Self::version_id(id, next.version), &next)?;
        self.heads
            .put(&Self::head_id(id), &KeyHead { id: id.into(), current_version: next.version })?;
        info!(key = %id, version = next.version, "Key rotated");
        Ok(KeyMetadata::from(&next))
    }

    /// Mark every version of a key revoked. Revoked material is refused for
    /// both encrypt and decrypt.
    pub fn revoke_key(&self, id: &str) -> AegisResult<()> {
        let head = self
            .heads
            .get(&Self::head_id(id))?
            .ok_or_else(|| AegisError::not_found("key", id))?;
        for v in 1..=head.current_version {
            if let Some(mut rec) = self.versions.get(&Self::version_id(id, v))? {
                rec.status = KeyStatus::Revoked;
                self.versions.put(&Self::version_id(id, v), &rec)?;
            }
        }
        warn!(key = %id, "Key revoked (all versions)");
        Ok(())
    }

    /// Metadata of the current version.
    pub fn metadata(&self, id: &str) -> AegisResult<KeyMetadata> {
        let head = self
            .heads
            .get(&Self::head_id(id))?
            .ok_or_else(|| AegisError::not_found("key", id))?;
        let rec = self
            .versions
            .get(&Self::version_id(id, head.current_version))?
            .ok_or_else(|| AegisError::not_found("key version", Self::version_id(id, head.current_version)))?;
        Ok(KeyMetadata::from(&rec))
    }

    /// Unwrapped key material for `version` (current version when `None`).
    /// Archived versions resolve; revoked versions do not.
    pub fn key_material(&self, id: &str, version: Option<u32>) -> AegisResult<[u8; 32]> {
        let version = match version {
            Some(v) => v,
            None => {
                self.heads
                    .get(&Self::head_id(id))?
                    .ok_or_else(|| AegisError::not_found("key", id))?
                    .current_version
            }
        };
        let rec = self
            .versions
            .get(&Self::version_id(id, version))?
            .ok_or_else(|| AegisError::not_found("key", format!("{} v{}", id, version)))?;
        if rec.status == KeyStatus::Revoked {
            return Err(AegisError::State(format!("key '{}' v{} is revoked", id, version)));
        }
        self.unwrap(&rec.wrapped_key)
    }

    /// Current version number for envelope stamping.
    pub fn current_version(&self, id: &str) -> AegisResult<u32> {
        Ok(self
            .heads
            .get(&Self::head_id(id))?
            .ok_or_else(|| AegisError::not_found("key", id))?
            .current_version)
    }

    /// All key IDs with a head record.
    pub fn list_key_ids(&self) -> AegisResult<Vec<String>> {
        Ok(self
            .heads
            .ids()?
            .into_iter()
            .filter_map(|id| id.strip_suffix(".head").map(|s| s.to_string()))
            .collect())
    }

    /// Rotate every active key whose interval has elapsed. A failure on one
    /// key is logged and reported; the batch always runs to completion.
    pub fn perform_scheduled_rotations(&self) -> AegisResult<RotationReport> {
        let now = chrono::Utc::now().timestamp();
        let mut report = RotationReport::default();
        for id in self.list_key_ids()? {
            report.checked += 1;
            let meta = match self.metadata(&id) {
                Ok(m) => m,
                Err(e) => {
                    warn!(key = %id, error = %e, "Skipping unreadable key during rotation sweep");
                    report.failures.push((id, e.to_string()));
                    continue;
                }
            };
            if meta.status != KeyStatus::Active {
                continue;
            }
            if now <= meta.last_rotated + meta.rotation_interval_secs {
                continue;
            }
            match self.rotate_key(&id) {
                Ok(_) => report.rotated.push(id),
                Err(e) => {
                    warn!(key = %id, error = %e, "Scheduled rotation failed");
                    report.failures.push((id, e.to_string()));
                }
            }
        }
        if !report.rotated.is_empty() {
            info!(count = report.rotated.len(), "Scheduled rotations complete");
        }
        Ok(report)
    }
}
