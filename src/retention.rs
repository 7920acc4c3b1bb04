//! Retention policies keyed by data category, plus the legal-hold
//! collaborator that gates erasure. The authoritative source of legal holds
//! is external; the engine only asks.

use crate::error::AegisResult;
use crate::store::{KvStore, Repository};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const RETENTION_PREFIX: &str = "retention_";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetentionPolicy {
    pub data_category: String,
    pub retention_days: u32,
    pub legal_basis: String,
    pub auto_delete: bool,
}

pub struct RetentionPolicyStore {
    policies: RwLock<HashMap<String, RetentionPolicy>>,
    repo: Repository<RetentionPolicy>,
}

impl RetentionPolicyStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            repo: Repository::new(store, RETENTION_PREFIX),
        }
    }

    pub fn load(&self) -> AegisResult<usize> {
        let all = self.repo.all()?;
        let mut policies = self.policies.write();
        for p in all {
            policies.insert(p.data_category.clone(), p);
        }
        Ok(policies.len())
    }

    pub fn set_policy(&self, policy: RetentionPolicy) -> AegisResult<()> {
        self.repo.put(&policy.data_category, &policy)?;
        self.policies.write().insert(policy.data_category.clone(), policy);
        Ok(())
    }

    pub fn policy(&self, data_category: &str) -> Option<RetentionPolicy> {
        self.policies.read().get(data_category).cloned()
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().len()
    }
}

/// Result of asking the external legal-hold source about one user.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LegalHoldStatus {
    pub has_obligations: bool,
    pub reason: Option<String>,
    pub retain_until: Option<i64>,
}

/// External source of truth for legal holds. Erasure consults this before
/// touching any data.
pub trait LegalHoldCheck: Send + Sync {
    fn check_obligations(&self, user_id: &str) -> AegisResult<LegalHoldStatus>;
}

/// Default collaborator for deployments without a legal-hold system: no
/// user ever has obligations.
pub struct NoObligations;

impl LegalHoldCheck for NoObligations {
    fn check_obligations(&self, _user_id: &str) -> AegisResult<LegalHoldStatus> {
        Ok(LegalHoldStatus::default())
    }
}
