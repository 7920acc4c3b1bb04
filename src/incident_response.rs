//! # Incident Response — severity-driven automated response
//!
//! Every threat alert opens an incident. A severity-keyed policy decides
//! which response actions run; actions execute sequentially within one
//! incident so the action log is causally ordered, and each action is
//! recorded whether it succeeded or not. `Resolved` is terminal. Incidents
//! are persisted and never deleted.

use crate::error::{AegisError, AegisResult};
use crate::event_bus::AlertSink;
use crate::store::{KvStore, Repository};
use crate::types::{SecurityAlert, Severity, ThreatAlert};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const INCIDENT_PREFIX: &str = "incident_";
/// Fixed block duration applied by the critical-severity policy.
const BLOCK_DURATION_SECS: u64 = 3_600;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum IncidentStatus {
    Open,
    Investigating,
    Contained,
    Escalated,
    Resolved,
}

impl IncidentStatus {
    /// Allowed transitions. `Resolved` is unreachable-from.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        match self {
            Open => matches!(next, Investigating | Contained | Escalated),
            Investigating | Contained => matches!(next, Resolved),
            Escalated => matches!(next, Investigating | Contained | Resolved),
            Resolved => false,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ResponseAction {
    BlockUser,
    RequireMfa,
    QuarantineSession,
    SendAlert,
    LogEvent,
    EscalateToAdmin,
    RevokeTokens,
    LockAccount,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::BlockUser => "block_user",
            ResponseAction::RequireMfa => "require_mfa",
            ResponseAction::QuarantineSession => "quarantine_session",
            ResponseAction::SendAlert => "send_alert",
            ResponseAction::LogEvent => "log_event",
            ResponseAction::EscalateToAdmin => "escalate_to_admin",
            ResponseAction::RevokeTokens => "revoke_tokens",
            ResponseAction::LockAccount => "lock_account",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseActionRecord {
    pub action: ResponseAction,
    pub target: String,
    pub executed_at: i64,
    pub success: bool,
    pub details: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityIncident {
    pub id: String,
    pub alert_id: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub created_at: i64,
    pub last_updated: i64,
    pub actions: Vec<ResponseActionRecord>,
    pub affected_users: BTreeSet<String>,
}

/// Enacts a single response action against the outside world (session
/// manager, token service, ...). The engine records outcomes; collaborators
/// do the enforcement.
pub trait ResponseExecutor: Send + Sync {
    fn execute(
        &self,
        action: ResponseAction,
        target: &str,
        incident: &SecurityIncident,
    ) -> Result<String, String>;
}

/// Default executor: records intent via the log. Real enforcement lives in
/// the collaborators wired by the embedding application.
pub struct LoggingExecutor;

impl ResponseExecutor for LoggingExecutor {
    fn execute(
        &self,
        action: ResponseAction,
        target: &str,
        incident: &SecurityIncident,
    ) -> Result<String, String> {
        info!(
            incident = %incident.id,
            action = action.as_str(),
            target = %target,
            "Response action executed"
        );
        match action {
            ResponseAction::BlockUser => {
                Ok(format!("blocked '{}' for {}s", target, BLOCK_DURATION_SECS))
            }
            _ => Ok(format!("{} applied to '{}'", action.as_str(), target)),
        }
    }
}

/// Severity-keyed response policy (1:1 with the alert's severity).
fn policy_for(severity: Severity) -> Vec<ResponseAction> {
    match severity {
        Severity::Critical => vec![
            ResponseAction::BlockUser,
            ResponseAction::RevokeTokens,
            ResponseAction::EscalateToAdmin,
            ResponseAction::SendAlert,
        ],
        Severity::High => vec![
            ResponseAction::RequireMfa,
            ResponseAction::QuarantineSession,
            ResponseAction::SendAlert,
        ],
        Severity::Medium => vec![ResponseAction::RequireMfa, ResponseAction::LogEvent],
        Severity::Low => vec![ResponseAction::LogEvent],
    }
}

pub struct IncidentResponseOrchestrator {
    incidents: RwLock<Vec<SecurityIncident>>,
    repo: Repository<SecurityIncident>,
    executor: Arc<dyn ResponseExecutor>,
    sink: Arc<dyn AlertSink>,
    total_incidents: AtomicU64,
    total_actions: AtomicU64,
    failed_actions: AtomicU64,
}

impl IncidentResponseOrchestrator {
    pub fn new(
        store: Arc<dyn KvStore>,
        executor: Arc<dyn ResponseExecutor>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            incidents: RwLock::new(Vec::new()),
            repo: Repository::new(store, INCIDENT_PREFIX),
            executor,
            sink,
            total_incidents: AtomicU64::new(0),
            total_actions: AtomicU64::new(0),
            failed_actions: AtomicU64::new(0),
        }
    }

    /// Rehydrate persisted incidents into the in-memory list (boot path).
    pub fn load(&self) -> AegisResult<usize> {
        let mut persisted = self.repo.all()?;
        persisted.sort_by_key(|i| i.created_at);
        let mut incidents = self.incidents.write();
        *incidents = persisted;
        Ok(incidents.len())
    }

    /// Open an incident for the alert and run its severity policy.
    /// Action failures are recorded and logged; they never stop the
    /// remaining actions.
    pub fn handle_threat_alert(&self, alert: &ThreatAlert) -> AegisResult<SecurityIncident> {
        let now = chrono::Utc::now().timestamp();
        let mut incident = SecurityIncident {
            id: uuid::Uuid::new_v4().to_string(),
            alert_id: alert.id.clone(),
            severity: alert.severity,
            status: IncidentStatus::Open,
            created_at: now,
            last_updated: now,
            actions: Vec::new(),
            affected_users: alert.user_id.iter().cloned().collect(),
        };
        self.total_incidents.fetch_add(1, Ordering::Relaxed);
        info!(incident = %incident.id, severity = ?incident.severity, "Incident opened");

        let target = alert.user_id.clone().unwrap_or_else(|| "system".into());
        for action in policy_for(alert.severity) {
            self.run_action(&mut incident, action, &target, alert);
        }

        self.repo.put(&incident.id, &incident)?;
        let mut incidents = self.incidents.write();
        incidents.push(incident.clone());
        Ok(incident)
    }

    fn run_action(
        &self,
        incident: &mut SecurityIncident,
        action: ResponseAction,
        target: &str,
        alert: &ThreatAlert,
    ) {
        self.total_actions.fetch_add(1, Ordering::Relaxed);

        if action == ResponseAction::EscalateToAdmin || action == ResponseAction::SendAlert {
            let title = if action == ResponseAction::EscalateToAdmin {
                format!("Incident {} escalated", incident.id)
            } else {
                format!("Incident {} opened", incident.id)
            };
            self.sink.submit(&SecurityAlert::new(
                &title,
                alert.severity,
                "incident_response",
                &alert.details,
            ));
        }

        let (success, details) = match self.executor.execute(action, target, incident) {
            Ok(d) => (true, d),
            Err(e) => {
                self.failed_actions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    incident = %incident.id,
                    action = action.as_str(),
                    error = %e,
                    "Response action failed"
                );
                (false, e)
            }
        };
        if action == ResponseAction::EscalateToAdmin {
            incident.status = IncidentStatus::Escalated;
        }
        incident.actions.push(ResponseActionRecord {
            action,
            target: target.into(),
            executed_at: chrono::Utc::now().timestamp(),
            success,
            details,
        });
        incident.last_updated = chrono::Utc::now().timestamp();
    }

    /// Move an incident through its state machine. Escalation always
    /// produces an administrator-facing alert.
    pub fn transition(&self, incident_id: &str, next: IncidentStatus) -> AegisResult<()> {
        let mut incidents = self.incidents.write();
        let incident = incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or_else(|| AegisError::not_found("incident", incident_id))?;

        if !incident.status.can_transition_to(next) {
            return Err(AegisError::State(format!(
                "incident {} cannot move {:?} -> {:?}",
                incident_id, incident.status, next
            )));
        }
        incident.status = next;
        incident.last_updated = chrono::Utc::now().timestamp();
        let snapshot = incident.clone();
        drop(incidents);

        if next == IncidentStatus::Escalated {
            self.sink.submit(&SecurityAlert::new(
                &format!("Incident {} escalated", incident_id),
                snapshot.severity,
                "incident_response",
                "manual escalation",
            ));
        }
        self.repo.put(&snapshot.id, &snapshot)?;
        Ok(())
    }

    pub fn incident(&self, incident_id: &str) -> Option<SecurityIncident> {
        self.incidents.read().iter().find(|i| i.id == incident_id).cloned()
    }

    pub fn open_incidents(&self) -> Vec<SecurityIncident> {
        self.incidents
            .read()
            .iter()
            .filter(|i| i.status != IncidentStatus::Resolved)
            .cloned()
            .collect()
    }

    pub fn total_incidents(&self) -> u64 {
        self.total_incidents.load(Ordering::Relaxed)
    }
    pub fn total_actions(&self) -> u64 {
        self.total_actions.load(Ordering::Relaxed)
    }
    pub fn failed_actions(&self) -> u64 {
        self.failed_actions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{BusAlertSink, EventBus};
    use crate::store::MemoryKvStore;

    struct FlakyExecutor;

    impl ResponseExecutor for FlakyExecutor {
        fn execute(
            &self,
            action: ResponseAction,
            _target: &str,
            _incident: &SecurityIncident,
        ) -> Result<String, String> {
            if action == ResponseAction::RevokeTokens {
                Err("token service unavailable".into())
            } else {
                Ok("ok".into())
            }
        }
    }

    fn orchestrator_with(
        executor: Arc<dyn ResponseExecutor>,
    ) -> (IncidentResponseOrchestrator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(BusAlertSink::new(bus.clone()));
        (
            IncidentResponseOrchestrator::new(Arc::new(MemoryKvStore::new()), executor, sink),
            bus,
        )
    }

    fn alert(severity: Severity) -> ThreatAlert {
        ThreatAlert::new("brute_force", severity, Some("u1"), "test alert")
    }

    #[test]
    fn test_critical_policy_runs_all_actions() {
        let (orch, bus) = orchestrator_with(Arc::new(LoggingExecutor));
        let incident = orch.handle_threat_alert(&alert(Severity::Critical)).unwrap();

        let actions: Vec<ResponseAction> = incident.actions.iter().map(|a| a.action).collect();
        assert_eq!(
            actions,
            vec![
                ResponseAction::BlockUser,
                ResponseAction::RevokeTokens,
                ResponseAction::EscalateToAdmin,
                ResponseAction::SendAlert,
            ]
        );
        assert!(incident.actions.iter().all(|a| a.success));
        assert_eq!(incident.status, IncidentStatus::Escalated);
        // Escalation and send_alert both reached the sink.
        assert_eq!(bus.security_alerts.total_published(), 2);
    }

    #[test]
    fn test_low_policy_logs_only() {
        let (orch, _) = orchestrator_with(Arc::new(LoggingExecutor));
        let incident = orch.handle_threat_alert(&alert(Severity::Low)).unwrap();
        assert_eq!(incident.actions.len(), 1);
        assert_eq!(incident.actions[0].action, ResponseAction::LogEvent);
        assert_eq!(incident.status, IncidentStatus::Open);
    }

    #[test]
    fn test_action_failure_does_not_block_remaining_actions() {
        let (orch, _) = orchestrator_with(Arc::new(FlakyExecutor));
        let incident = orch.handle_threat_alert(&alert(Severity::Critical)).unwrap();

        assert_eq!(incident.actions.len(), 4);
        let revoke = incident
            .actions
            .iter()
            .find(|a| a.action == ResponseAction::RevokeTokens)
            .unwrap();
        assert!(!revoke.success);
        // Later actions still ran.
        assert!(incident
            .actions
            .iter()
            .any(|a| a.action == ResponseAction::SendAlert && a.success));
        assert_eq!(orch.failed_actions(), 1);
    }

    #[test]
    fn test_resolved_is_terminal() {
        let (orch, _) = orchestrator_with(Arc::new(LoggingExecutor));
        let incident = orch.handle_threat_alert(&alert(Severity::Low)).unwrap();

        orch.transition(&incident.id, IncidentStatus::Investigating).unwrap();
        orch.transition(&incident.id, IncidentStatus::Resolved).unwrap();
        for next in [
            IncidentStatus::Open,
            IncidentStatus::Investigating,
            IncidentStatus::Contained,
            IncidentStatus::Escalated,
        ] {
            assert!(matches!(
                orch.transition(&incident.id, next),
                Err(AegisError::State(_))
            ));
        }
    }

    #[test]
    fn test_incidents_reload_from_store() {
        let store = Arc::new(MemoryKvStore::new());
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(BusAlertSink::new(bus.clone()));
        let first = IncidentResponseOrchestrator::new(
            store.clone(),
            Arc::new(LoggingExecutor),
            sink.clone(),
        );
        let incident = first.handle_threat_alert(&alert(Severity::Low)).unwrap();

        // A fresh orchestrator over the same store sees nothing until load.
        let second =
            IncidentResponseOrchestrator::new(store, Arc::new(LoggingExecutor), sink);
        assert!(second.open_incidents().is_empty());
        assert_eq!(second.load().unwrap(), 1);

        let reloaded = second.incident(&incident.id).unwrap();
        assert_eq!(reloaded.status, IncidentStatus::Open);
        assert_eq!(reloaded.actions.len(), 1);
        second.transition(&incident.id, IncidentStatus::Investigating).unwrap();
        assert_eq!(second.open_incidents().len(), 1);
    }

    #[test]
    fn test_escalated_can_deescalate_and_alerts_admin() {
        let (orch, bus) = orchestrator_with(Arc::new(LoggingExecutor));
        let incident = orch.handle_threat_alert(&alert(Severity::Low)).unwrap();

        let before = bus.security_alerts.total_published();
        orch.transition(&incident.id, IncidentStatus::Escalated).unwrap();
        assert_eq!(bus.security_alerts.total_published(), before + 1);
        orch.transition(&incident.id, IncidentStatus::Contained).unwrap();
        orch.transition(&incident.id, IncidentStatus::Resolved).unwrap();
    }
}
