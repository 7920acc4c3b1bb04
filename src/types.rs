//! Shared domain types flowing between subsystems.

use std::collections::HashMap;

/// Severity scale shared by audit events, alerts, and incidents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A raw security event entering the engine. Immutable once created.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub user_id: Option<String>,
    pub event_type: String,
    pub timestamp: i64,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SecurityEvent {
    pub fn new(event_type: &str, user_id: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.map(|u| u.to_string()),
            event_type: event_type.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            location: None,
            device_id: None,
            ip: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// One detection, one record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ThreatAlert {
    pub id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub timestamp: i64,
    pub details: String,
    pub recommended_actions: Vec<String>,
}

impl ThreatAlert {
    pub fn new(alert_type: &str, severity: Severity, user_id: Option<&str>, details: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type: alert_type.into(),
            severity,
            user_id: user_id.map(|u| u.to_string()),
            timestamp: chrono::Utc::now().timestamp(),
            details: details.into(),
            recommended_actions: Vec::new(),
        }
    }
}

/// A deviation from a user's behavioral baseline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnomalyDetection {
    pub id: String,
    pub anomaly_type: String,
    pub confidence: f64,
    pub user_id: Option<String>,
    pub timestamp: i64,
    pub details: String,
}

/// Operator-facing alert produced by rule evaluation or incident response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityAlert {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub source: String,
    pub timestamp: i64,
    pub details: String,
}

impl SecurityAlert {
    pub fn new(title: &str, severity: Severity, source: &str, details: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            severity,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: details.into(),
        }
    }
}

/// Immutable audit record. Appended to the bounded ring plus the durable log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub severity: Severity,
    pub category: String,
    pub timestamp: i64,
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    pub fn new(actor: &str, action: &str, resource: &str, severity: Severity, category: &str) -> Self {
        Self {
            id: 0, // assigned by the audit trail
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            severity,
            category: category.into(),
            timestamp: chrono::Utc::now().timestamp(),
            metadata: HashMap::new(),
        }
    }
}

/// Periodic metrics snapshot broadcast to subscribers.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SecurityMetrics {
    pub timestamp: i64,
    pub total_events: u64,
    pub total_threat_alerts: u64,
    pub total_anomalies: u64,
    pub open_incidents: usize,
    pub audit_entries: usize,
    pub security_score: f64,
}

/// Fraud risk classification. Ordering matters: levels escalate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Score-to-level mapping: <0.4 low, <0.6 medium, <0.8 high, else critical.
    pub fn from_score(score: f64) -> Self {
        if score < 0.4 {
            RiskLevel::Low
        } else if score < 0.6 {
            RiskLevel::Medium
        } else if score < 0.8 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Allow with logging",
            RiskLevel::Medium => "Monitor closely",
            RiskLevel::High => "Require additional authentication",
            RiskLevel::Critical => "Block access immediately",
        }
    }
}
