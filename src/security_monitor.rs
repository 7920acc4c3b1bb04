//! # Security Monitor
//!
//! Front door for audit logging: every entry is appended to the trail,
//! evaluated against the alert rules, and rebroadcast on the bus. Also
//! hosts the pluggable vulnerability checks and the compliance report.

use crate::audit::AuditTrail;
use crate::consent::ConsentManager;
use crate::error::AegisResult;
use crate::event_bus::{AlertSink, EventBus};
use crate::key_vault::KeyVault;
use crate::retention::RetentionPolicyStore;
use crate::types::{AuditEvent, SecurityAlert, Severity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Composable predicate over audit events.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RuleCondition {
    SeverityAtLeast(Severity),
    CategoryIs(String),
    ActorIs(String),
    ActionContains(String),
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
}

impl RuleCondition {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        match self {
            RuleCondition::SeverityAtLeast(s) => event.severity >= *s,
            RuleCondition::CategoryIs(c) => &event.category == c,
            RuleCondition::ActorIs(a) => &event.actor == a,
            RuleCondition::ActionContains(needle) => event.action.contains(needle.as_str()),
            RuleCondition::All(conds) => conds.iter().all(|c| c.matches(event)),
            RuleCondition::Any(conds) => conds.iter().any(|c| c.matches(event)),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: RuleCondition,
    pub severity: Severity,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(name: &str, condition: RuleCondition, severity: Severity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            condition,
            severity,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VulnerabilityFinding {
    pub check: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
}

/// A scan probe. Implementations carry their own handles to whatever they
/// inspect.
pub trait VulnerabilityCheck: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self) -> Vec<VulnerabilityFinding>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityScan {
    pub id: String,
    pub timestamp: i64,
    pub findings: Vec<VulnerabilityFinding>,
    pub score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComplianceReport {
    pub generated_at: i64,
    pub period_start: i64,
    pub period_end: i64,
    pub audit_entries_in_period: usize,
    pub scans_in_period: usize,
    pub average_scan_score: Option<f64>,
    pub consent_records: usize,
    pub retention_policies: usize,
    pub critical_audit_events: usize,
    /// Data-subject requests still open past the 30-day deadline.
    pub overdue_data_requests: usize,
    pub security_score: f64,
    /// Consent tracking and retention policies are both in place.
    pub compliant: bool,
}

pub struct SecurityMonitor {
    trail: Arc<AuditTrail>,
    rules: RwLock<Vec<AlertRule>>,
    checks: RwLock<Vec<Arc<dyn VulnerabilityCheck>>>,
    sink: Arc<dyn AlertSink>,
    bus: Arc<EventBus>,
    consent: Arc<ConsentManager>,
    retention: Arc<RetentionPolicyStore>,
    alerts_raised: AtomicU64,
    scans_run: AtomicU64,
    scan_history: RwLock<Vec<SecurityScan>>,
}

/// Scan results retained for compliance reporting.
const SCAN_HISTORY_BOUND: usize = 100;

impl SecurityMonitor {
    pub fn new(
        trail: Arc<AuditTrail>,
        sink: Arc<dyn AlertSink>,
        bus: Arc<EventBus>,
        consent: Arc<ConsentManager>,
        retention: Arc<RetentionPolicyStore>,
    ) -> Self {
        Self {
            trail,
            rules: RwLock::new(Vec::new()),
            checks: RwLock::new(Vec::new()),
            sink,
            bus,
            consent,
            retention,
            alerts_raised: AtomicU64::new(0),
            scans_run: AtomicU64::new(0),
            scan_history: RwLock::new(Vec::new()),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        info!(rule = %rule.name, "Alert rule added");
        self.rules.write().push(rule);
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn register_check(&self, check: Arc<dyn VulnerabilityCheck>) {
        info!(check = check.name(), "Vulnerability check registered");
        self.checks.write().push(check);
    }

    /// Append to the trail, evaluate rules, rebroadcast. Returns the
    /// assigned audit id.
    pub fn log_audit_event(&self, event: AuditEvent) -> AegisResult<u64> {
        let id = self.trail.append(event.clone())?;
        let mut stamped = event;
        stamped.id = id;

        let matched: Vec<AlertRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.condition.matches(&stamped))
            .cloned()
            .collect();
        for rule in matched {
            self.alerts_raised.fetch_add(1, Ordering::Relaxed);
            warn!(rule = %rule.name, actor = %stamped.actor, action = %stamped.action, "Alert rule matched");
            let alert = SecurityAlert::new(
                &rule.name,
                rule.severity,
                "security_monitor",
                &format!(
                    "audit #{}: {} performed '{}' on {}",
                    stamped.id, stamped.actor, stamped.action, stamped.resource
                ),
            );
            self.sink.submit(&alert);
        }

        self.bus.audit_events.publish(stamped);
        Ok(id)
    }

    /// Weighted health score over everything audited so far. An empty trail
    /// scores a clean 100.
    pub fn overall_security_score(&self) -> f64 {
        let (low, medium, high, critical) = self.trail.severity_counts();
        let total = low + medium + high + critical;
        if total == 0 {
            return 100.0;
        }
        let weighted = 4.0 * critical as f64 + 2.0 * high as f64 + medium as f64;
        (100.0 - 10.0 * weighted / total as f64).max(0.0)
    }

    /// Run every registered check and grade the result. Findings deduct
    /// from 100 by severity; recommendations are deduplicated by category.
    pub fn perform_security_scan(&self) -> SecurityScan {
        self.scans_run.fetch_add(1, Ordering::Relaxed);
        let checks: Vec<Arc<dyn VulnerabilityCheck>> = self.checks.read().clone();
        let mut findings = Vec::new();
        for check in checks {
            let mut found = check.run();
            if !found.is_empty() {
                warn!(check = check.name(), findings = found.len(), "Scan check produced findings");
            }
            findings.append(&mut found);
        }

        let deducted: f64 = findings
            .iter()
            .map(|f| match f.severity {
                Severity::Critical => 20.0,
                Severity::High => 10.0,
                Severity::Medium => 5.0,
                Severity::Low => 1.0,
            })
            .sum();
        let score = (100.0 - deducted).max(0.0);

        let mut recommendations = Vec::new();
        for finding in &findings {
            let rec = recommendation_for(&finding.category);
            if !recommendations.contains(&rec) {
                recommendations.push(rec);
            }
        }

        let scan = SecurityScan {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            findings,
            score,
            recommendations,
        };
        info!(score = scan.score, findings = scan.findings.len(), "Security scan complete");
        let mut history = self.scan_history.write();
        if history.len() >= SCAN_HISTORY_BOUND {
            history.remove(0);
        }
        history.push(scan.clone());
        scan
    }

    pub fn last_scan(&self) -> Option<SecurityScan> {
        self.scan_history.read().last().cloned()
    }

    /// The caller supplies the overdue-DSAR count; request records live
    /// with the privacy manager, not here.
    pub fn generate_compliance_report(
        &self,
        period_start: i64,
        period_end: i64,
        overdue_data_requests: usize,
    ) -> ComplianceReport {
        let in_period = self.trail.entries_in_range(period_start, period_end);
        let critical = in_period
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count();

        let history = self.scan_history.read();
        let scan_scores: Vec<f64> = history
            .iter()
            .filter(|s| s.timestamp >= period_start && s.timestamp <= period_end)
            .map(|s| s.score)
            .collect();
        drop(history);
        let average_scan_score = if scan_scores.is_empty() {
            None
        } else {
            Some(scan_scores.iter().sum::<f64>() / scan_scores.len() as f64)
        };

        let consent_records = self.consent.record_count();
        let retention_policies = self.retention.policy_count();
        ComplianceReport {
            generated_at: chrono::Utc::now().timestamp(),
            period_start,
            period_end,
            audit_entries_in_period: in_period.len(),
            scans_in_period: scan_scores.len(),
            average_scan_score,
            consent_records,
            retention_policies,
            critical_audit_events: critical,
            overdue_data_requests,
            security_score: self.overall_security_score(),
            compliant: consent_records > 0 && retention_policies > 0,
        }
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(Ordering::Relaxed)
    }

    pub fn trail(&self) -> &Arc<AuditTrail> {
        &self.trail
    }
}

fn recommendation_for(category: &str) -> String {
    match category {
        "authentication" => "Enforce MFA and tighten lockout thresholds".into(),
        "key_management" => "Rotate overdue keys and review rotation intervals".into(),
        "access_control" => "Review role assignments and least-privilege policies".into(),
        other => format!("Review recent '{}' activity", other),
    }
}

/// Flags actors with bursts of failed authentication in the recent trail.
pub struct BruteForceCheck {
    trail: Arc<AuditTrail>,
    window_secs: i64,
    threshold: usize,
}

impl BruteForceCheck {
    pub fn new(trail: Arc<AuditTrail>) -> Self {
        Self { trail, window_secs: 900, threshold: 10 }
    }
}

impl VulnerabilityCheck for BruteForceCheck {
    fn name(&self) -> &str {
        "brute_force"
    }

    fn run(&self) -> Vec<VulnerabilityFinding> {
        let now = chrono::Utc::now().timestamp();
        let mut failures: HashMap<String, usize> = HashMap::new();
        for event in self.trail.entries_in_range(now - self.window_secs, now) {
            if event.category == "authentication" && event.action.contains("fail") {
                *failures.entry(event.actor).or_insert(0) += 1;
            }
        }
        failures
            .into_iter()
            .filter(|(_, count)| *count >= self.threshold)
            .map(|(actor, count)| VulnerabilityFinding {
                check: "brute_force".into(),
                severity: Severity::High,
                category: "authentication".into(),
                description: format!("{} failed authentications for '{}' in 15 minutes", count, actor),
            })
            .collect()
    }
}

/// Flags active keys whose scheduled rotation is overdue.
pub struct StaleKeyCheck {
    vault: Arc<KeyVault>,
}

impl StaleKeyCheck {
    pub fn new(vault: Arc<KeyVault>) -> Self {
        Self { vault }
    }
}

impl VulnerabilityCheck for StaleKeyCheck {
    fn name(&self) -> &str {
        "stale_keys"
    }

    fn run(&self) -> Vec<VulnerabilityFinding> {
        let now = chrono::Utc::now().timestamp();
        let ids = match self.vault.list_key_ids() {
            Ok(ids) => ids,
            Err(_) => return Vec::new(),
        };
        let mut findings = Vec::new();
        for id in ids {
            if let Ok(meta) = self.vault.metadata(&id) {
                if meta.rotation_interval_secs > 0
                    && now > meta.last_rotated + meta.rotation_interval_secs
                {
                    findings.push(VulnerabilityFinding {
                        check: "stale_keys".into(),
                        severity: Severity::Medium,
                        category: "key_management".into(),
                        description: format!(
                            "key '{}' is past its rotation interval (last rotated {}s ago)",
                            id,
                            now - meta.last_rotated
                        ),
                    });
                }
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::BusAlertSink;
    use crate::store::{KvStore, MemoryKvStore};

    fn monitor() -> (SecurityMonitor, Arc<EventBus>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let bus = Arc::new(EventBus::new());
        let trail = Arc::new(AuditTrail::new(store.clone()));
        let consent = Arc::new(ConsentManager::new(store.clone(), bus.clone()));
        let retention = Arc::new(RetentionPolicyStore::new(store));
        let sink = Arc::new(BusAlertSink::new(bus.clone()));
        (SecurityMonitor::new(trail, sink, bus.clone(), consent, retention), bus)
    }

    fn audit(actor: &str, action: &str, severity: Severity, category: &str) -> AuditEvent {
        AuditEvent::new(actor, action, "resource", severity, category)
    }

    #[test]
    fn test_rule_condition_combinators() {
        let event = audit("alice", "login_failed", Severity::High, "authentication");
        let cond = RuleCondition::All(vec![
            RuleCondition::SeverityAtLeast(Severity::Medium),
            RuleCondition::Any(vec![
                RuleCondition::ActionContains("fail".into()),
                RuleCondition::CategoryIs("key_management".into()),
            ]),
        ]);
        assert!(cond.matches(&event));
        assert!(!RuleCondition::ActorIs("bob".into()).matches(&event));
    }

    #[test]
    fn test_matching_rule_raises_alert() {
        let (monitor, bus) = monitor();
        monitor.add_rule(AlertRule::new(
            "critical audit activity",
            RuleCondition::SeverityAtLeast(Severity::Critical),
            Severity::Critical,
        ));
        monitor
            .log_audit_event(audit("mallory", "delete_all", Severity::Critical, "access_control"))
            .unwrap();
        monitor
            .log_audit_event(audit("alice", "login", Severity::Low, "authentication"))
            .unwrap();

        assert_eq!(monitor.alerts_raised(), 1);
        assert_eq!(bus.security_alerts.recent(10).len(), 1);
        assert_eq!(bus.audit_events.recent(10).len(), 2);
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let (monitor, _) = monitor();
        let rule = AlertRule::new(
            "everything",
            RuleCondition::SeverityAtLeast(Severity::Low),
            Severity::Low,
        );
        let rule_id = rule.id.clone();
        monitor.add_rule(rule);
        assert!(monitor.set_rule_enabled(&rule_id, false));
        monitor
            .log_audit_event(audit("alice", "login", Severity::Low, "authentication"))
            .unwrap();
        assert_eq!(monitor.alerts_raised(), 0);
    }

    #[test]
    fn test_security_score_empty_trail_is_clean() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.overall_security_score(), 100.0);
    }

    #[test]
    fn test_security_score_weights_severities() {
        let (monitor, _) = monitor();
        for _ in 0..3 {
            monitor
                .log_audit_event(audit("u", "op", Severity::Low, "general"))
                .unwrap();
        }
        monitor
            .log_audit_event(audit("u", "op", Severity::Critical, "general"))
            .unwrap();
        // 4 entries, weighted 4 => 100 - 10*4/4 = 90
        assert_eq!(monitor.overall_security_score(), 90.0);
    }

    #[test]
    fn test_brute_force_check_flags_burst() {
        let (monitor, _) = monitor();
        for _ in 0..12 {
            monitor
                .log_audit_event(audit("mallory", "login_failed", Severity::Medium, "authentication"))
                .unwrap();
        }
        monitor.register_check(Arc::new(BruteForceCheck::new(monitor.trail().clone())));

        let scan = monitor.perform_security_scan();
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].severity, Severity::High);
        assert_eq!(scan.score, 90.0);
        assert!(scan.recommendations[0].contains("MFA"));
    }

    #[test]
    fn test_clean_scan_scores_100() {
        let (monitor, _) = monitor();
        monitor.register_check(Arc::new(BruteForceCheck::new(monitor.trail().clone())));
        let scan = monitor.perform_security_scan();
        assert!(scan.findings.is_empty());
        assert_eq!(scan.score, 100.0);
        assert!(monitor.last_scan().is_some());
    }

    #[test]
    fn test_compliance_report_counts() {
        let (monitor, _) = monitor();
        monitor
            .log_audit_event(audit("u", "op", Severity::Critical, "general"))
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        let report = monitor.generate_compliance_report(now - 3600, now + 3600, 2);
        assert_eq!(report.audit_entries_in_period, 1);
        assert_eq!(report.critical_audit_events, 1);
        assert_eq!(report.retention_policies, 0);
        assert_eq!(report.overdue_data_requests, 2);
        assert!(!report.compliant);
        assert_eq!(report.average_scan_score, None);

        monitor.perform_security_scan();
        let report = monitor.generate_compliance_report(now - 3600, now + 3600, 0);
        assert_eq!(report.scans_in_period, 1);
        assert_eq!(report.average_scan_score, Some(100.0));
    }
}
