//! # Audit Trail
//!
//! Append-only record of security-relevant actions. Entries get monotonic
//! ids, land durably in the store, and stay queryable from a bounded
//! in-memory ring. Exports carry a SHA-256 checksum so tampering with an
//! exported bundle is detectable.

use crate::error::AegisResult;
use crate::store::{KvStore, Repository};
use crate::types::{AuditEvent, Severity};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const AUDIT_PREFIX: &str = "audit_log_";
const MAX_ENTRIES: usize = 10_000;

/// Optional filters applied on top of an export time range.
#[derive(Debug, Clone, Default)]
pub struct ExportFilters {
    pub actor: Option<String>,
    pub category: Option<String>,
    pub min_severity: Option<Severity>,
}

impl ExportFilters {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_deref().map_or(true, |a| event.actor == a)
            && self.category.as_deref().map_or(true, |c| event.category == c)
            && self.min_severity.map_or(true, |s| event.severity >= s)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditExport {
    pub generated_at: i64,
    pub from: i64,
    pub to: i64,
    pub entries: Vec<AuditEvent>,
    /// SHA-256 over the serialized entries, in order.
    pub checksum: String,
}

pub struct AuditTrail {
    entries: RwLock<Vec<AuditEvent>>,
    repo: Repository<AuditEvent>,
    next_id: AtomicU64,
    total_appended: AtomicU64,
    dropped: AtomicU64,
    low_count: AtomicU64,
    medium_count: AtomicU64,
    high_count: AtomicU64,
    critical_count: AtomicU64,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            repo: Repository::new(store, AUDIT_PREFIX),
            next_id: AtomicU64::new(1),
            total_appended: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            low_count: AtomicU64::new(0),
            medium_count: AtomicU64::new(0),
            high_count: AtomicU64::new(0),
            critical_count: AtomicU64::new(0),
        }
    }

    /// Reload persisted entries into the ring and resume id assignment past
    /// the highest persisted id (boot path).
    pub fn load(&self) -> AegisResult<usize> {
        let mut all = self.repo.all()?;
        all.sort_by_key(|e| e.id);
        let max_id = all.last().map_or(0, |e| e.id);
        if all.len() > MAX_ENTRIES {
            all.drain(0..all.len() - MAX_ENTRIES);
        }
        for event in &all {
            self.bump_severity(event.severity);
        }
        let count = all.len();
        *self.entries.write() = all;
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(count)
    }

    fn bump_severity(&self, severity: Severity) {
        let counter = match severity {
            Severity::Low => &self.low_count,
            Severity::Medium => &self.medium_count,
            Severity::High => &self.high_count,
            Severity::Critical => &self.critical_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Assigns the entry id, persists the entry, and appends it to the
    /// ring. The durable write is zero-padded so lexicographic key order
    /// matches id order.
    pub fn append(&self, mut event: AuditEvent) -> AegisResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        if event.timestamp == 0 {
            event.timestamp = chrono::Utc::now().timestamp();
        }
        self.repo.put(&format!("{:010}", id), &event)?;

        self.total_appended.fetch_add(1, Ordering::Relaxed);
        self.bump_severity(event.severity);

        let mut entries = self.entries.write();
        if entries.len() >= MAX_ENTRIES {
            let drop = MAX_ENTRIES / 10;
            entries.drain(0..drop);
            self.dropped.fetch_add(drop as u64, Ordering::Relaxed);
            warn!(dropped = drop, "Audit ring full, oldest entries evicted from memory");
        }
        entries.push(event);
        debug!(audit_id = id, "Audit entry appended");
        Ok(id)
    }

    pub fn recent(&self, count: usize) -> Vec<AuditEvent> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    pub fn entries_in_range(&self, from: i64, to: i64) -> Vec<AuditEvent> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    /// Export with tamper-evidence: the checksum covers every entry in
    /// order, so any mutation, insertion, or reorder is detectable.
    pub fn export(&self, from: i64, to: i64, filters: &ExportFilters) -> AegisResult<AuditExport> {
        let entries: Vec<AuditEvent> = self
            .entries_in_range(from, to)
            .into_iter()
            .filter(|e| filters.matches(e))
            .collect();
        let checksum = Self::checksum_of(&entries)?;
        Ok(AuditExport {
            generated_at: chrono::Utc::now().timestamp(),
            from,
            to,
            entries,
            checksum,
        })
    }

    pub fn verify_export(export: &AuditExport) -> AegisResult<bool> {
        Ok(Self::checksum_of(&export.entries)? == export.checksum)
    }

    fn checksum_of(entries: &[AuditEvent]) -> AegisResult<String> {
        let mut hasher = Sha256::new();
        for entry in entries {
            hasher.update(serde_json::to_string(entry)?.as_bytes());
            hasher.update([0x0a]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended.load(Ordering::Relaxed)
    }

    pub fn severity_counts(&self) -> (u64, u64, u64, u64) {
        (
            self.low_count.load(Ordering::Relaxed),
            self.medium_count.load(Ordering::Relaxed),
            self.high_count.load(Ordering::Relaxed),
            self.critical_count.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn trail() -> AuditTrail {
        AuditTrail::new(Arc::new(MemoryKvStore::new()))
    }

    fn event(actor: &str, severity: Severity) -> AuditEvent {
        AuditEvent::new(actor, "login", "session", severity, "authentication")
    }

    #[test]
    fn test_ids_are_monotonic() {
        let t = trail();
        let a = t.append(event("u1", Severity::Low)).unwrap();
        let b = t.append(event("u2", Severity::Low)).unwrap();
        let c = t.append(event("u3", Severity::Low)).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_severity_counters() {
        let t = trail();
        t.append(event("u1", Severity::Low)).unwrap();
        t.append(event("u1", Severity::Critical)).unwrap();
        t.append(event("u1", Severity::Critical)).unwrap();
        assert_eq!(t.severity_counts(), (1, 0, 0, 2));
    }

    #[test]
    fn test_load_resumes_id_sequence() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let last = {
            let t = AuditTrail::new(store.clone());
            t.append(event("u1", Severity::Low)).unwrap();
            t.append(event("u1", Severity::Medium)).unwrap()
        };
        let t2 = AuditTrail::new(store);
        assert_eq!(t2.load().unwrap(), 2);
        let next = t2.append(event("u2", Severity::Low)).unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn test_export_filters_and_checksum() {
        let t = trail();
        t.append(event("alice", Severity::Low)).unwrap();
        t.append(event("bob", Severity::High)).unwrap();
        t.append(event("alice", Severity::Critical)).unwrap();

        let now = chrono::Utc::now().timestamp();
        let filters = ExportFilters {
            actor: Some("alice".into()),
            min_severity: Some(Severity::Medium),
            ..ExportFilters::default()
        };
        let export = t.export(now - 60, now + 60, &filters).unwrap();
        assert_eq!(export.entries.len(), 1);
        assert_eq!(export.entries[0].actor, "alice");
        assert!(AuditTrail::verify_export(&export).unwrap());
    }

    #[test]
    fn test_tampered_export_fails_verification() {
        let t = trail();
        t.append(event("alice", Severity::Low)).unwrap();
        let now = chrono::Utc::now().timestamp();
        let mut export = t.export(now - 60, now + 60, &ExportFilters::default()).unwrap();
        export.entries[0].actor = "mallory".into();
        assert!(!AuditTrail::verify_export(&export).unwrap());
    }

    #[test]
    fn test_ring_eviction_keeps_durable_copies() {
        let t = trail();
        for _ in 0..MAX_ENTRIES {
            t.append(event("u1", Severity::Low)).unwrap();
        }
        assert_eq!(t.entry_count(), MAX_ENTRIES);
        t.append(event("u1", Severity::Low)).unwrap();
        // 10% evicted from memory, newest retained.
        assert_eq!(t.entry_count(), MAX_ENTRIES - MAX_ENTRIES / 10 + 1);
        assert_eq!(t.total_appended(), MAX_ENTRIES as u64 + 1);
    }
}
