//! # Privacy Compliance — GDPR data-subject request workflows
//!
//! Portability, erasure, and rectification run against pluggable
//! per-category data providers. Erasure is gated by the external legal-hold
//! collaborator: an active hold rejects the request before anything is
//! touched. Partial provider failures are reported, never fatal.

use crate::anonymizer::DataCategory;
use crate::consent::ConsentManager;
use crate::encryption::EncryptionGateway;
use crate::error::{AegisError, AegisResult};
use crate::event_bus::EventBus;
use crate::retention::{LegalHoldCheck, RetentionPolicyStore};
use crate::store::{KvStore, Repository};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const REQUEST_PREFIX: &str = "request_";
const SETTINGS_PREFIX: &str = "privacy_settings_";

/// GDPR answer deadline for data-subject requests.
pub const DSAR_DEADLINE_DAYS: i64 = 30;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum RequestType {
    Portability,
    Deletion,
    Rectification,
    Access,
    Restriction,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Rejected | RequestStatus::Failed)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataRequest {
    pub id: String,
    pub user_id: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl DataRequest {
    /// Unanswered past the statutory deadline.
    pub fn is_overdue(&self, now: i64) -> bool {
        !self.status.is_terminal() && now - self.created_at > DSAR_DEADLINE_DAYS * 86_400
    }
}

/// Per-category export preferences for one user. Categories not listed
/// default to included, not anonymized.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PrivacySettings {
    pub user_id: String,
    pub categories: HashMap<String, CategorySetting>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CategorySetting {
    pub include_in_export: bool,
    pub anonymize: bool,
}

impl PrivacySettings {
    fn include(&self, category: &str) -> bool {
        self.categories.get(category).map_or(true, |c| c.include_in_export)
    }

    fn anonymize(&self, category: &str) -> bool {
        self.categories.get(category).map_or(false, |c| c.anonymize)
    }
}

/// Source of one category of user data (profile store, booking history,
/// telemetry, ...). The engine orchestrates; providers own the data.
pub trait UserDataProvider: Send + Sync {
    fn category(&self) -> &str;
    fn collect(&self, user_id: &str) -> AegisResult<serde_json::Value>;
    /// Delete the user's data in this category; returns records removed.
    fn delete(&self, user_id: &str) -> AegisResult<u64>;
    fn rectify(&self, user_id: &str, field: &str, value: &str) -> AegisResult<()>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportPackage {
    pub user_id: String,
    pub generated_at: i64,
    pub format: String,
    pub categories: Vec<String>,
    pub data: HashMap<String, serde_json::Value>,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ErasureSummary {
    pub success: bool,
    pub deleted_categories: Vec<String>,
    pub total_deleted: u64,
    pub errors: Vec<(String, String)>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RectificationOutcome {
    pub results: HashMap<String, bool>,
    pub errors: HashMap<String, String>,
}

pub struct PrivacyComplianceManager {
    providers: RwLock<Vec<Arc<dyn UserDataProvider>>>,
    consent: Arc<ConsentManager>,
    retention: Arc<RetentionPolicyStore>,
    holds: Arc<dyn LegalHoldCheck>,
    gateway: Arc<EncryptionGateway>,
    requests: RwLock<HashMap<String, DataRequest>>,
    request_repo: Repository<DataRequest>,
    settings_repo: Repository<PrivacySettings>,
    bus: Arc<EventBus>,
}

impl PrivacyComplianceManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        consent: Arc<ConsentManager>,
        retention: Arc<RetentionPolicyStore>,
        holds: Arc<dyn LegalHoldCheck>,
        gateway: Arc<EncryptionGateway>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            consent,
            retention,
            holds,
            gateway,
            requests: RwLock::new(HashMap::new()),
            request_repo: Repository::new(store.clone(), REQUEST_PREFIX),
            settings_repo: Repository::new(store, SETTINGS_PREFIX),
            bus,
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn UserDataProvider>) {
        info!(category = provider.category(), "Data provider registered");
        self.providers.write().push(provider);
    }

    pub fn set_privacy_settings(&self, settings: PrivacySettings) -> AegisResult<()> {
        self.settings_repo.put(&settings.user_id, &settings)
    }

    fn settings_for(&self, user_id: &str) -> AegisResult<PrivacySettings> {
        Ok(self.settings_repo.get(user_id)?.unwrap_or_default())
    }

    fn open_request(&self, user_id: &str, request_type: RequestType) -> AegisResult<DataRequest> {
        let request = DataRequest {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            request_type,
            status: RequestStatus::Processing,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        };
        self.request_repo.put(&request.id, &request)?;
        self.requests.write().insert(request.id.clone(), request.clone());
        self.bus.data_requests.publish(request.clone());
        Ok(request)
    }

    /// Move a request to its single terminal status. A second terminal
    /// transition is a state error, never silently overwritten.
    fn finish_request(&self, request_id: &str, status: RequestStatus) -> AegisResult<()> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| AegisError::not_found("data request", request_id))?;
        if request.status.is_terminal() {
            return Err(AegisError::State(format!(
                "request {} already terminal ({:?})",
                request_id, request.status
            )));
        }
        request.status = status;
        request.completed_at = Some(chrono::Utc::now().timestamp());
        let snapshot = request.clone();
        drop(requests);

        self.request_repo.put(&snapshot.id, &snapshot)?;
        self.bus.data_requests.publish(snapshot);
        Ok(())
    }

    /// GDPR Art. 20: assemble the user's data across categories, honoring
    /// their per-category export settings.
    pub fn handle_portability_request(&self, user_id: &str) -> AegisResult<ExportPackage> {
        if user_id.is_empty() {
            return Err(AegisError::Validation("user id must not be empty".into()));
        }
        let request = self.open_request(user_id, RequestType::Portability)?;
        let settings = self.settings_for(user_id)?;
        let providers: Vec<Arc<dyn UserDataProvider>> = self.providers.read().clone();

        let mut data = HashMap::new();
        for provider in providers {
            let category = provider.category().to_string();
            if !settings.include(&category) {
                info!(user = %user_id, category = %category, "Category excluded from export by settings");
                continue;
            }
            let collected = match provider.collect(user_id) {
                Ok(v) => v,
                Err(e) => {
                    warn!(user = %user_id, category = %category, error = %e, "Export collection failed");
                    self.finish_request(&request.id, RequestStatus::Failed)?;
                    return Err(e);
                }
            };
            let value = if settings.anonymize(&category) {
                self.anonymize_value(collected)
            } else {
                collected
            };
            data.insert(category, value);
        }

        // Consent records ride along in every export.
        let consents = self.consent.consents_for(user_id);
        if !consents.is_empty() {
            data.insert("consents".into(), serde_json::to_value(&consents)?);
        }

        let size_bytes = serde_json::to_string(&data)?.len();
        let mut categories: Vec<String> = data.keys().cloned().collect();
        categories.sort();
        self.finish_request(&request.id, RequestStatus::Completed)?;
        info!(user = %user_id, categories = categories.len(), "Portability export assembled");

        Ok(ExportPackage {
            user_id: user_id.into(),
            generated_at: chrono::Utc::now().timestamp(),
            format: "json".into(),
            categories,
            data,
            size_bytes,
        })
    }

    /// GDPR Art. 17: delete the user's data unless a legal hold forbids it.
    /// Per-category failures are collected and reported; the sweep always
    /// finishes.
    pub fn handle_erasure_request(&self, user_id: &str, reason: &str) -> AegisResult<ErasureSummary> {
        let request = self.open_request(user_id, RequestType::Deletion)?;

        let hold = self.holds.check_obligations(user_id)?;
        if hold.has_obligations {
            let why = hold
                .reason
                .unwrap_or_else(|| "legal obligations require retention".into());
            warn!(user = %user_id, reason = %why, "Erasure rejected by legal hold");
            self.finish_request(&request.id, RequestStatus::Rejected)?;
            return Ok(ErasureSummary {
                success: false,
                rejection_reason: Some(why),
                ..ErasureSummary::default()
            });
        }

        let providers: Vec<Arc<dyn UserDataProvider>> = self.providers.read().clone();
        let mut summary = ErasureSummary { success: true, ..ErasureSummary::default() };
        for provider in providers {
            let category = provider.category().to_string();
            match provider.delete(user_id) {
                Ok(count) => {
                    summary.deleted_categories.push(category);
                    summary.total_deleted += count;
                }
                Err(e) => {
                    warn!(user = %user_id, category = %category, error = %e, "Category deletion failed");
                    summary.errors.push((category, e.to_string()));
                }
            }
        }

        match self.consent.erase_user(user_id) {
            Ok(count) if count > 0 => {
                summary.deleted_categories.push("consents".into());
                summary.total_deleted += count;
            }
            Ok(_) => {}
            Err(e) => summary.errors.push(("consents".into(), e.to_string())),
        }

        info!(
            user = %user_id,
            reason = %reason,
            deleted = summary.total_deleted,
            errors = summary.errors.len(),
            "Erasure complete"
        );
        self.finish_request(&request.id, RequestStatus::Completed)?;
        Ok(summary)
    }

    /// GDPR Art. 16: apply each correction independently. The request
    /// completes even when some fields fail; the outcome says which.
    pub fn handle_rectification_request(
        &self,
        user_id: &str,
        corrections: &HashMap<String, String>,
    ) -> AegisResult<RectificationOutcome> {
        let request = self.open_request(user_id, RequestType::Rectification)?;
        let providers: Vec<Arc<dyn UserDataProvider>> = self.providers.read().clone();
        let mut outcome = RectificationOutcome::default();

        for (field, value) in corrections {
            // Fields address a provider as "category.field".
            let applied = (|| -> Result<(), String> {
                if value.trim().is_empty() {
                    return Err("replacement value must not be empty".into());
                }
                let (category, field_name) = field
                    .split_once('.')
                    .ok_or_else(|| "field must be 'category.field'".to_string())?;
                let provider = providers
                    .iter()
                    .find(|p| p.category() == category)
                    .ok_or_else(|| format!("no provider for category '{}'", category))?;
                provider
                    .rectify(user_id, field_name, value)
                    .map_err(|e| e.to_string())
            })();

            match applied {
                Ok(()) => {
                    outcome.results.insert(field.clone(), true);
                }
                Err(e) => {
                    warn!(user = %user_id, field = %field, error = %e, "Rectification failed");
                    outcome.results.insert(field.clone(), false);
                    outcome.errors.insert(field.clone(), e);
                }
            }
        }

        self.finish_request(&request.id, RequestStatus::Completed)?;
        Ok(outcome)
    }

    /// Recursively mask string leaves whose field names look like PII.
    fn anonymize_value(&self, value: serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let masked = map
                    .into_iter()
                    .map(|(k, v)| {
                        let v = match (&v, category_for_field(&k)) {
                            (serde_json::Value::String(s), Some(cat)) => {
                                serde_json::Value::String(self.gateway.anonymize(s, cat))
                            }
                            _ => self.anonymize_value(v),
                        };
                        (k, v)
                    })
                    .collect();
                serde_json::Value::Object(masked)
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.into_iter().map(|v| self.anonymize_value(v)).collect(),
            ),
            other => other,
        }
    }

    pub fn request(&self, request_id: &str) -> Option<DataRequest> {
        self.requests.read().get(request_id).cloned()
    }

    /// Requests still open past the statutory deadline (compliance
    /// reporting).
    pub fn overdue_requests(&self) -> Vec<DataRequest> {
        let now = chrono::Utc::now().timestamp();
        self.requests
            .read()
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect()
    }

    pub fn requests_for(&self, user_id: &str) -> Vec<DataRequest> {
        self.requests
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn retention(&self) -> &Arc<RetentionPolicyStore> {
        &self.retention
    }
}

/// Field-name heuristic driving export anonymization.
fn category_for_field(name: &str) -> Option<DataCategory> {
    let n = name.to_ascii_lowercase();
    if n.contains("email") {
        Some(DataCategory::Email)
    } else if n.contains("phone") {
        Some(DataCategory::Phone)
    } else if n.contains("name") {
        Some(DataCategory::Name)
    } else if n.contains("address") {
        Some(DataCategory::Address)
    } else if n.contains("birth") || n.contains("date") || n.ends_with("_at") {
        Some(DataCategory::Date)
    } else if n.contains("age") {
        Some(DataCategory::Numeric)
    } else if n.ends_with("id") || n.contains("ssn") || n.contains("passport") {
        Some(DataCategory::Identifier)
    } else {
        None
    }
}
