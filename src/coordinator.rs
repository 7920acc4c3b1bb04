//! # Engine Coordinator
//!
//! Builds the subsystems in dependency order, wires the event-bus fan-out,
//! and exposes the unified facade callers use. Background timers (threat
//! sweep, vulnerability scan, metrics snapshot, key-rotation check) run as
//! tokio tasks owned by the coordinator and are aborted on `stop`.

use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::consent::{ConsentManager, ConsentRecord};
use crate::encryption::{Envelope, EncryptionGateway};
use crate::error::{AegisError, AegisResult};
use crate::event_bus::{AlertSink, BusAlertSink, EventBus};
use crate::incident_response::{
    IncidentResponseOrchestrator, IncidentStatus, LoggingExecutor, ResponseExecutor,
    SecurityIncident,
};
use crate::key_vault::{KeyMetadata, KeyVault, MasterKey, RotationReport};
use crate::privacy::{
    ErasureSummary, ExportPackage, PrivacyComplianceManager, PrivacySettings,
    RectificationOutcome, UserDataProvider,
};
use crate::retention::{LegalHoldCheck, NoObligations, RetentionPolicy, RetentionPolicyStore};
use crate::security_monitor::{
    AlertRule, BruteForceCheck, ComplianceReport, SecurityMonitor, SecurityScan, StaleKeyCheck,
    VulnerabilityCheck,
};
use crate::store::{FileKvStore, KvStore, MemoryKvStore};
use crate::threat_detection::{FraudAssessment, LoginAttempt, ThreatDetectionEngine};
use crate::types::{AuditEvent, SecurityEvent, SecurityMetrics, Severity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Status plus the recent activity an operator console renders.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Dashboard {
    pub status: EngineStatus,
    pub recent_alerts: Vec<crate::types::SecurityAlert>,
    pub open_incidents: Vec<SecurityIncident>,
    pub last_scan: Option<SecurityScan>,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub running: bool,
    pub total_events: u64,
    pub total_threat_alerts: u64,
    pub open_incidents: usize,
    pub audit_entries: usize,
    pub consent_records: usize,
    pub security_score: f64,
    pub last_scan_score: Option<f64>,
}

pub struct ComplianceEngine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    vault: Arc<KeyVault>,
    gateway: Arc<EncryptionGateway>,
    threat: Arc<ThreatDetectionEngine>,
    incidents: Arc<IncidentResponseOrchestrator>,
    consent: Arc<ConsentManager>,
    retention: Arc<RetentionPolicyStore>,
    privacy: Arc<PrivacyComplianceManager>,
    monitor: Arc<SecurityMonitor>,
    initialized: AtomicBool,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComplianceEngine {
    pub fn new(config: EngineConfig) -> AegisResult<Self> {
        Self::with_collaborators(config, Arc::new(LoggingExecutor), Arc::new(NoObligations))
    }

    /// Construct with a custom response executor and legal-hold source.
    pub fn with_collaborators(
        config: EngineConfig,
        executor: Arc<dyn ResponseExecutor>,
        holds: Arc<dyn LegalHoldCheck>,
    ) -> AegisResult<Self> {
        let store: Arc<dyn KvStore> = match &config.storage_dir {
            Some(dir) => Arc::new(FileKvStore::open(dir)?),
            None => Arc::new(MemoryKvStore::new()),
        };
        let master = match &config.storage_dir {
            Some(dir) => MasterKey::load_or_create(&dir.join("master.key"))?,
            None => MasterKey::generate(),
        };

        let bus = Arc::new(EventBus::new());
        let sink: Arc<dyn AlertSink> = Arc::new(BusAlertSink::new(bus.clone()));
        let vault = Arc::new(KeyVault::new(store.clone(), master));
        let gateway = Arc::new(EncryptionGateway::new(vault.clone(), store.clone(), bus.clone()));
        let threat = Arc::new(ThreatDetectionEngine::new(bus.clone(), config.anomaly_multiplier));
        let incidents =
            Arc::new(IncidentResponseOrchestrator::new(store.clone(), executor, sink.clone()));
        let consent = Arc::new(ConsentManager::new(store.clone(), bus.clone()));
        let retention = Arc::new(RetentionPolicyStore::new(store.clone()));
        let privacy = Arc::new(PrivacyComplianceManager::new(
            store.clone(),
            consent.clone(),
            retention.clone(),
            holds,
            gateway.clone(),
            bus.clone(),
        ));
        let trail = Arc::new(AuditTrail::new(store));
        let monitor = Arc::new(SecurityMonitor::new(
            trail,
            sink,
            bus.clone(),
            consent.clone(),
            retention.clone(),
        ));

        Ok(Self {
            config,
            bus,
            vault,
            gateway,
            threat,
            incidents,
            consent,
            retention,
            privacy,
            monitor,
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load persisted state and wire the event fan-out. Must run before
    /// any facade operation.
    pub fn initialize(&self) -> AegisResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(AegisError::State("engine already initialized".into()));
        }

        let consents = self.consent.load()?;
        let policies = self.retention.load()?;
        let audit_entries = self.monitor.trail().load()?;
        let incidents = self.incidents.load()?;
        info!(consents, policies, audit_entries, incidents, "Persisted state loaded");

        // Raw events feed behavioral analysis and the audit trail.
        let threat = self.threat.clone();
        self.bus.security_events.subscribe(
            "threat_detection",
            Arc::new(move |event: &SecurityEvent| threat.ingest(event)),
        );
        let monitor = self.monitor.clone();
        self.bus.security_events.subscribe(
            "audit_trail",
            Arc::new(move |event: &SecurityEvent| {
                if let Err(e) = monitor.log_audit_event(audit_from_event(event)) {
                    error!(error = %e, "Audit append failed for security event");
                }
            }),
        );

        // Threat alerts open incidents and run the response policy.
        let incidents = self.incidents.clone();
        self.bus.threat_alerts.subscribe(
            "incident_response",
            Arc::new(move |alert| {
                if let Err(e) = incidents.handle_threat_alert(alert) {
                    error!(error = %e, "Incident handling failed");
                }
            }),
        );

        self.monitor
            .register_check(Arc::new(BruteForceCheck::new(self.monitor.trail().clone())));
        self.monitor.register_check(Arc::new(StaleKeyCheck::new(self.vault.clone())));

        info!("Compliance engine initialized");
        Ok(())
    }

    fn ensure_initialized(&self) -> AegisResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AegisError::State("engine not initialized".into()));
        }
        Ok(())
    }

    /// Spawn the background timers on the ambient tokio runtime.
    /// Idempotent while running; errors when no runtime is present.
    pub fn start(&self) -> AegisResult<()> {
        self.ensure_initialized()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| AegisError::State("start requires a tokio runtime".into()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock();

        let threat = self.threat.clone();
        let sweep_every = self.config.sweep_interval;
        tasks.push(handle.spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.tick().await; // first tick fires immediately
            loop {
                sweep.tick().await;
                let alerts = threat.sweep_recent();
                if !alerts.is_empty() {
                    warn!(count = alerts.len(), "Sweep produced threat alerts");
                }
            }
        }));

        let monitor = self.monitor.clone();
        let scan_every = self.config.scan_interval;
        tasks.push(handle.spawn(async move {
            let mut scan = tokio::time::interval(scan_every);
            scan.tick().await;
            loop {
                scan.tick().await;
                monitor.perform_security_scan();
            }
        }));

        let vault = self.vault.clone();
        let rotation_every = self.config.rotation_check_interval;
        tasks.push(handle.spawn(async move {
            let mut rotation = tokio::time::interval(rotation_every);
            rotation.tick().await;
            loop {
                rotation.tick().await;
                match vault.perform_scheduled_rotations() {
                    Ok(report) if !report.rotated.is_empty() => {
                        info!(rotated = report.rotated.len(), "Scheduled key rotations applied")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Scheduled rotation pass failed"),
                }
            }
        }));

        let threat = self.threat.clone();
        let incidents = self.incidents.clone();
        let monitor = self.monitor.clone();
        let bus = self.bus.clone();
        let metrics_every = self.config.metrics_interval;
        tasks.push(handle.spawn(async move {
            let mut metrics = tokio::time::interval(metrics_every);
            metrics.tick().await;
            loop {
                metrics.tick().await;
                bus.metrics.publish(SecurityMetrics {
                    timestamp: chrono::Utc::now().timestamp(),
                    total_events: threat.total_events(),
                    total_threat_alerts: threat.total_alerts(),
                    total_anomalies: threat.total_anomalies(),
                    open_incidents: incidents.open_incidents().len(),
                    audit_entries: monitor.trail().entry_count(),
                    security_score: monitor.overall_security_score(),
                });
            }
        }));

        info!("Background timers started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Background timers stopped");
    }

    /// Entry point for raw events: broadcast once, every interested
    /// subsystem reacts.
    pub fn record_event(&self, event: SecurityEvent) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.bus.security_events.publish(event);
        Ok(())
    }

    // --- key lifecycle ---

    pub fn create_key(
        &self,
        id: &str,
        key_type: &str,
        rotation_interval_secs: i64,
    ) -> AegisResult<KeyMetadata> {
        self.ensure_initialized()?;
        self.vault.create_key(id, key_type, rotation_interval_secs)
    }

    pub fn rotate_key(&self, id: &str) -> AegisResult<KeyMetadata> {
        self.ensure_initialized()?;
        self.vault.rotate_key(id)
    }

    pub fn revoke_key(&self, id: &str) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.vault.revoke_key(id)
    }

    pub fn rotate_due_keys(&self) -> AegisResult<RotationReport> {
        self.ensure_initialized()?;
        self.vault.perform_scheduled_rotations()
    }

    // --- data protection ---

    pub fn encrypt(&self, plaintext: &[u8], key_id: &str) -> AegisResult<Envelope> {
        self.ensure_initialized()?;
        self.gateway.encrypt(plaintext, key_id)
    }

    pub fn decrypt(&self, envelope: &Envelope) -> AegisResult<Vec<u8>> {
        self.ensure_initialized()?;
        self.gateway.decrypt(envelope)
    }

    pub fn anonymize(
        &self,
        value: &str,
        category: crate::anonymizer::DataCategory,
    ) -> AegisResult<String> {
        self.ensure_initialized()?;
        Ok(self.gateway.anonymize(value, category))
    }

    pub fn pseudonymize(&self, value: &str, context: &str) -> AegisResult<String> {
        self.ensure_initialized()?;
        self.gateway.pseudonymize(value, context)
    }

    // --- threat & fraud ---

    pub fn analyze_fraud_risk(&self, attempt: &LoginAttempt) -> AegisResult<FraudAssessment> {
        self.ensure_initialized()?;
        Ok(self.threat.analyze_fraud_risk(attempt))
    }

    pub fn transition_incident(&self, incident_id: &str, next: IncidentStatus) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.incidents.transition(incident_id, next)
    }

    pub fn open_incidents(&self) -> AegisResult<Vec<SecurityIncident>> {
        self.ensure_initialized()?;
        Ok(self.incidents.open_incidents())
    }

    // --- consent, retention, privacy ---

    pub fn record_consent(&self, record: ConsentRecord) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.consent.record_consent(record)
    }

    pub fn has_valid_consent(&self, user_id: &str, consent_type: &str) -> AegisResult<bool> {
        self.ensure_initialized()?;
        Ok(self.consent.has_valid_consent(user_id, consent_type))
    }

    pub fn revoke_consent(&self, user_id: &str, consent_type: &str) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.consent.revoke_consent(user_id, consent_type)
    }

    pub fn set_retention_policy(&self, policy: RetentionPolicy) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.retention.set_policy(policy)
    }

    pub fn register_data_provider(&self, provider: Arc<dyn UserDataProvider>) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.privacy.register_provider(provider);
        Ok(())
    }

    pub fn set_privacy_settings(&self, settings: PrivacySettings) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.privacy.set_privacy_settings(settings)
    }

    pub fn handle_portability_request(&self, user_id: &str) -> AegisResult<ExportPackage> {
        self.ensure_initialized()?;
        self.privacy.handle_portability_request(user_id)
    }

    pub fn handle_erasure_request(&self, user_id: &str, reason: &str) -> AegisResult<ErasureSummary> {
        self.ensure_initialized()?;
        self.privacy.handle_erasure_request(user_id, reason)
    }

    pub fn handle_rectification_request(
        &self,
        user_id: &str,
        corrections: &HashMap<String, String>,
    ) -> AegisResult<RectificationOutcome> {
        self.ensure_initialized()?;
        self.privacy.handle_rectification_request(user_id, corrections)
    }

    // --- monitoring ---

    pub fn log_audit_event(&self, event: AuditEvent) -> AegisResult<u64> {
        self.ensure_initialized()?;
        self.monitor.log_audit_event(event)
    }

    pub fn add_alert_rule(&self, rule: AlertRule) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.monitor.add_rule(rule);
        Ok(())
    }

    pub fn register_vulnerability_check(
        &self,
        check: Arc<dyn VulnerabilityCheck>,
    ) -> AegisResult<()> {
        self.ensure_initialized()?;
        self.monitor.register_check(check);
        Ok(())
    }

    pub fn perform_security_scan(&self) -> AegisResult<SecurityScan> {
        self.ensure_initialized()?;
        Ok(self.monitor.perform_security_scan())
    }

    pub fn generate_compliance_report(
        &self,
        period_start: i64,
        period_end: i64,
    ) -> AegisResult<ComplianceReport> {
        self.ensure_initialized()?;
        Ok(self.monitor.generate_compliance_report(
            period_start,
            period_end,
            self.privacy.overdue_requests().len(),
        ))
    }

    pub fn status(&self) -> AegisResult<EngineStatus> {
        self.ensure_initialized()?;
        Ok(EngineStatus {
            initialized: true,
            running: self.running.load(Ordering::SeqCst),
            total_events: self.threat.total_events(),
            total_threat_alerts: self.threat.total_alerts(),
            open_incidents: self.incidents.open_incidents().len(),
            audit_entries: self.monitor.trail().entry_count(),
            consent_records: self.consent.record_count(),
            security_score: self.monitor.overall_security_score(),
            last_scan_score: self.monitor.last_scan().map(|s| s.score),
        })
    }

    pub fn dashboard(&self) -> AegisResult<Dashboard> {
        Ok(Dashboard {
            status: self.status()?,
            recent_alerts: self.bus.security_alerts.recent(10),
            open_incidents: self.incidents.open_incidents(),
            last_scan: self.monitor.last_scan(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }
}

impl Drop for ComplianceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Audit rendering of a raw security event.
fn audit_from_event(event: &SecurityEvent) -> AuditEvent {
    let category = if event.event_type.contains("login") || event.event_type.contains("auth") {
        "authentication"
    } else {
        "general"
    };
    let severity = if event.event_type.contains("fail") {
        Severity::Medium
    } else {
        Severity::Low
    };
    let mut audit = AuditEvent::new(
        event.user_id.as_deref().unwrap_or("system"),
        &event.event_type,
        "security_event",
        severity,
        category,
    );
    audit.timestamp = event.timestamp;
    audit.metadata = event.metadata.clone();
    if let Some(ip) = &event.ip {
        audit.metadata.insert("ip".into(), ip.clone());
    }
    audit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::KEY_TYPE_AES_256_GCM;
    use crate::types::ThreatAlert;

    fn engine() -> ComplianceEngine {
        let engine = ComplianceEngine::new(EngineConfig::default()).unwrap();
        engine.initialize().unwrap();
        engine
    }

    #[test]
    fn test_operations_require_initialization() {
        let engine = ComplianceEngine::new(EngineConfig::default()).unwrap();
        assert!(matches!(
            engine.record_event(SecurityEvent::new("login", Some("u1"))),
            Err(AegisError::State(_))
        ));
        assert!(matches!(engine.start(), Err(AegisError::State(_))));
    }

    #[test]
    fn test_queries_require_initialization() {
        let engine = ComplianceEngine::new(EngineConfig::default()).unwrap();
        assert!(matches!(
            engine.has_valid_consent("u1", "marketing"),
            Err(AegisError::State(_))
        ));
        assert!(matches!(engine.open_incidents(), Err(AegisError::State(_))));
        assert!(matches!(engine.status(), Err(AegisError::State(_))));
        assert!(matches!(engine.dashboard(), Err(AegisError::State(_))));
        assert!(matches!(
            engine.anonymize("a@example.com", crate::anonymizer::DataCategory::Email),
            Err(AegisError::State(_))
        ));
        assert!(matches!(
            engine.add_alert_rule(AlertRule::new(
                "critical activity",
                crate::security_monitor::RuleCondition::SeverityAtLeast(Severity::Critical),
                Severity::Critical,
            )),
            Err(AegisError::State(_))
        ));
    }

    #[test]
    fn test_start_outside_runtime_errors() {
        let engine = engine();
        // No tokio runtime in a plain test thread.
        assert!(matches!(engine.start(), Err(AegisError::State(_))));
        assert!(!engine.status().unwrap().running);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let engine = engine();
        assert!(matches!(engine.initialize(), Err(AegisError::State(_))));
    }

    #[test]
    fn test_event_fans_out_to_threat_and_audit() {
        let engine = engine();
        engine
            .record_event(
                SecurityEvent::new("login", Some("u1")).with_location("Berlin").with_device("d1"),
            )
            .unwrap();

        let status = engine.status().unwrap();
        assert_eq!(status.total_events, 1);
        assert_eq!(status.audit_entries, 1);
        assert!(engine.threat_profile_exists("u1"));
    }

    #[test]
    fn test_threat_alert_opens_incident() {
        let engine = engine();
        engine.bus().threat_alerts.publish(ThreatAlert::new(
            "credential_stuffing",
            Severity::Critical,
            Some("u1"),
            "many users from one address",
        ));
        assert_eq!(engine.open_incidents().unwrap().len(), 1);

        let dashboard = engine.dashboard().unwrap();
        assert_eq!(dashboard.open_incidents.len(), 1);
        // Critical policy escalated to admin and sent an alert.
        assert_eq!(dashboard.recent_alerts.len(), 2);
    }

    #[test]
    fn test_encrypt_decrypt_via_facade() {
        let engine = engine();
        engine.create_key("pii", KEY_TYPE_AES_256_GCM, 86_400).unwrap();
        let envelope = engine.encrypt(b"card=4111", "pii").unwrap();
        assert_eq!(engine.decrypt(&envelope).unwrap(), b"card=4111");
    }

    #[tokio::test]
    async fn test_start_stop_timers() {
        let mut config = EngineConfig::default();
        config.metrics_interval = std::time::Duration::from_millis(10);
        let engine = ComplianceEngine::new(config).unwrap();
        engine.initialize().unwrap();
        engine.start().unwrap();
        assert!(engine.status().unwrap().running);
        // second start is a no-op
        engine.start().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(engine.bus().metrics.total_published() >= 1);

        engine.stop();
        assert!(!engine.status().unwrap().running);
    }

    impl ComplianceEngine {
        fn threat_profile_exists(&self, user_id: &str) -> bool {
            self.threat.profile(user_id).is_some()
        }
    }
}
