//! # Aegis Engine
//!
//! Security and privacy compliance engine: envelope encryption with a
//! rotating key vault, behavioral threat detection and fraud scoring, an
//! incident-response state machine, GDPR data-subject workflows (consent,
//! portability, erasure, rectification), and a tamper-evident audit trail.
//! Subsystems coordinate over an in-process event bus; the
//! [`ComplianceEngine`] facade owns construction, wiring, and the
//! background timers.
//!
//! ```no_run
//! use aegis_engine::{ComplianceEngine, EngineConfig, KEY_TYPE_AES_256_GCM};
//!
//! # fn main() -> aegis_engine::AegisResult<()> {
//! let engine = ComplianceEngine::new(EngineConfig::default())?;
//! engine.initialize()?;
//! engine.create_key("pii", KEY_TYPE_AES_256_GCM, 86_400)?;
//! let envelope = engine.encrypt(b"sensitive", "pii")?;
//! let plaintext = engine.decrypt(&envelope)?;
//! # Ok(())
//! # }
//! ```

pub mod anonymizer;
pub mod audit;
pub mod config;
pub mod consent;
pub mod coordinator;
pub mod encryption;
pub mod error;
pub mod event_bus;
pub mod incident_response;
pub mod key_vault;
pub mod privacy;
pub mod retention;
pub mod security_monitor;
pub mod store;
pub mod threat_detection;
pub mod types;

pub use anonymizer::DataCategory;
pub use audit::{AuditTrail, ExportFilters};
pub use config::EngineConfig;
pub use consent::{ConsentManager, ConsentRecord};
pub use coordinator::{ComplianceEngine, Dashboard, EngineStatus};
pub use encryption::{EncryptionGateway, Envelope};
pub use error::{AegisError, AegisResult};
pub use event_bus::{AlertSink, EventBus, Topic};
pub use incident_response::{
    IncidentResponseOrchestrator, IncidentStatus, ResponseAction, ResponseExecutor,
    SecurityIncident,
};
pub use key_vault::{KeyStatus, KeyVault, MasterKey, KEY_TYPE_AES_256_GCM};
pub use privacy::{
    DataRequest, PrivacyComplianceManager, PrivacySettings, RequestStatus, RequestType,
    UserDataProvider,
};
pub use retention::{LegalHoldCheck, LegalHoldStatus, RetentionPolicy};
pub use security_monitor::{
    AlertRule, RuleCondition, SecurityMonitor, VulnerabilityCheck, VulnerabilityFinding,
};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
pub use threat_detection::{FraudAssessment, LoginAttempt, ThreatDetectionEngine};
pub use types::{
    AuditEvent, RiskLevel, SecurityAlert, SecurityEvent, SecurityMetrics, Severity, ThreatAlert,
};
