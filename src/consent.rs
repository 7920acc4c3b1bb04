//! Consent tracking: one record per (user, consent type), upserted in place.
//! Consent is valid only while granted and unexpired.

use crate::error::AegisResult;
use crate::event_bus::EventBus;
use crate::store::{KvStore, Repository};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

const CONSENT_PREFIX: &str = "consent_";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsentRecord {
    pub user_id: String,
    pub consent_type: String,
    pub granted: bool,
    pub timestamp: i64,
    pub expires_at: Option<i64>,
}

impl ConsentRecord {
    pub fn granted(user_id: &str, consent_type: &str) -> Self {
        Self {
            user_id: user_id.into(),
            consent_type: consent_type.into(),
            granted: true,
            timestamp: chrono::Utc::now().timestamp(),
            expires_at: None,
        }
    }

    pub fn is_valid(&self, now: i64) -> bool {
        self.granted && self.expires_at.map_or(true, |e| now <= e)
    }
}

pub struct ConsentManager {
    records: RwLock<HashMap<(String, String), ConsentRecord>>,
    repo: Repository<ConsentRecord>,
    bus: Arc<EventBus>,
    total_recorded: AtomicU64,
}

impl ConsentManager {
    pub fn new(store: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            repo: Repository::new(store, CONSENT_PREFIX),
            bus,
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Reload persisted consents into the in-memory map (boot path).
    pub fn load(&self) -> AegisResult<usize> {
        let all = self.repo.all()?;
        let mut records = self.records.write();
        for rec in all {
            records.insert((rec.user_id.clone(), rec.consent_type.clone()), rec);
        }
        Ok(records.len())
    }

    fn record_id(user_id: &str, consent_type: &str) -> String {
        format!("{}.{}", user_id, consent_type)
    }

    /// Upsert by (user, type); broadcasts the update.
    pub fn record_consent(&self, record: ConsentRecord) -> AegisResult<()> {
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
        self.repo
            .put(&Self::record_id(&record.user_id, &record.consent_type), &record)?;
        self.records
            .write()
            .insert((record.user_id.clone(), record.consent_type.clone()), record.clone());
        info!(user = %record.user_id, kind = %record.consent_type, granted = record.granted, "Consent recorded");
        self.bus.consent_updates.publish(record);
        Ok(())
    }

    /// False when missing, not granted, or expired.
    pub fn has_valid_consent(&self, user_id: &str, consent_type: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.records
            .read()
            .get(&(user_id.to_string(), consent_type.to_string()))
            .map_or(false, |r| r.is_valid(now))
    }

    /// GDPR right to withdraw: flips the record to not-granted.
    pub fn revoke_consent(&self, user_id: &str, consent_type: &str) -> AegisResult<()> {
        let existing = self
            .records
            .read()
            .get(&(user_id.to_string(), consent_type.to_string()))
            .cloned();
        if let Some(mut rec) = existing {
            rec.granted = false;
            rec.timestamp = chrono::Utc::now().timestamp();
            self.record_consent(rec)?;
        }
        Ok(())
    }

    /// All consent records for one user (export path).
    pub fn consents_for(&self, user_id: &str) -> Vec<ConsentRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Remove a user's consent records entirely (erasure path). Returns the
    /// number removed.
    pub fn erase_user(&self, user_id: &str) -> AegisResult<u64> {
        let keys: Vec<(String, String)> = self
            .records
            .read()
            .keys()
            .filter(|(u, _)| u == user_id)
            .cloned()
            .collect();
        let mut removed = 0;
        for (user, kind) in keys {
            self.repo.delete(&Self::record_id(&user, &kind))?;
            self.records.write().remove(&(user, kind));
            removed += 1;
        }
        Ok(removed)
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn manager() -> ConsentManager {
        ConsentManager::new(Arc::new(MemoryKvStore::new()), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_missing_consent_is_invalid() {
        let m = manager();
        assert!(!m.has_valid_consent("u1", "marketing"));
    }

    #[test]
    fn test_grant_and_upsert() {
        let m = manager();
        m.record_consent(ConsentRecord::granted("u1", "marketing")).unwrap();
        assert!(m.has_valid_consent("u1", "marketing"));

        // Upsert by (user, type): a denial replaces the grant.
        let mut denied = ConsentRecord::granted("u1", "marketing");
        denied.granted = false;
        m.record_consent(denied).unwrap();
        assert!(!m.has_valid_consent("u1", "marketing"));
        assert_eq!(m.record_count(), 1);
    }

    #[test]
    fn test_expired_consent_is_invalid() {
        let m = manager();
        let mut rec = ConsentRecord::granted("u1", "profiling");
        rec.expires_at = Some(chrono::Utc::now().timestamp() - 10);
        m.record_consent(rec).unwrap();
        assert!(!m.has_valid_consent("u1", "profiling"));
    }

    #[test]
    fn test_revoke() {
        let m = manager();
        m.record_consent(ConsentRecord::granted("u1", "marketing")).unwrap();
        m.revoke_consent("u1", "marketing").unwrap();
        assert!(!m.has_valid_consent("u1", "marketing"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let bus = Arc::new(EventBus::new());
        {
            let m = ConsentManager::new(store.clone(), bus.clone());
            m.record_consent(ConsentRecord::granted("u1", "marketing")).unwrap();
        }
        let m2 = ConsentManager::new(store, bus);
        assert_eq!(m2.load().unwrap(), 1);
        assert!(m2.has_valid_consent("u1", "marketing"));
    }
}
