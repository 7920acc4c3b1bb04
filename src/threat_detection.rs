//! # Threat Detection — behavior profiling, fraud scoring, anomaly detection
//!
//! Profiles are bounded rolling windows updated incrementally per event.
//! Fraud risk is a weighted sum of independent factors; adding a factor can
//! only raise the score. The periodic sweep looks for brute-force,
//! credential-stuffing, API-abuse, and bot patterns over a short sliding
//! window of recent events.

use crate::event_bus::EventBus;
use crate::types::{AnomalyDetection, RiskLevel, SecurityEvent, Severity, ThreatAlert};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rolling-list bound per profile field.
const PROFILE_BOUND: usize = 100;
/// Recent-event ring capacity.
const MAX_RECENT_EVENTS: usize = 10_000;
/// Sweep window.
const SWEEP_WINDOW_SECS: i64 = 15 * 60;

// Sweep thresholds.
const BRUTE_FORCE_FAILURES: usize = 10;
const STUFFING_DISTINCT_USERS: usize = 5;
const API_ABUSE_CALLS: usize = 120;
const BOT_MIN_EVENTS: usize = 30;
const BOT_MAX_MEAN_GAP_SECS: f64 = 2.0;

// Fraud factor weights.
const W_LOCATION: f64 = 0.25;
const W_DEVICE: f64 = 0.20;
const W_TIMING: f64 = 0.15;
const W_VELOCITY: f64 = 0.25;
const W_BEHAVIORAL: f64 = 0.15;

/// Bounded rolling behavioral baseline for one user.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserBehaviorProfile {
    pub user_id: String,
    pub login_hours: Vec<u8>,
    pub locations: Vec<String>,
    pub devices: Vec<String>,
    pub session_durations: Vec<i64>,
    pub feature_usage: HashMap<String, u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserBehaviorProfile {
    fn new(user_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            user_id: user_id.into(),
            login_hours: Vec::new(),
            locations: Vec::new(),
            devices: Vec::new(),
            session_durations: Vec::new(),
            feature_usage: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn knows_location(&self, location: &str) -> bool {
        self.locations.iter().any(|l| l == location)
    }

    fn knows_device(&self, device: &str) -> bool {
        self.devices.iter().any(|d| d == device)
    }

    /// How often the user has logged in at `hour`.
    fn logins_at_hour(&self, hour: u8) -> usize {
        self.login_hours.iter().filter(|h| **h == hour).count()
    }
}

fn push_bounded<T>(list: &mut Vec<T>, value: T) {
    if list.len() >= PROFILE_BOUND {
        list.remove(0);
    }
    list.push(value);
}

/// A login attempt under fraud assessment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoginAttempt {
    pub user_id: String,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub timestamp: i64,
    /// Attempts observed inside `attempt_window_secs`, this one included.
    pub attempts: u32,
    pub attempt_window_secs: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: f64,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FraudAssessment {
    pub user_id: String,
    pub score: f64,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
    pub recommended_action: String,
}

pub struct ThreatDetectionEngine {
    profiles: RwLock<HashMap<String, UserBehaviorProfile>>,
    recent_events: RwLock<Vec<SecurityEvent>>,
    bus: Arc<EventBus>,
    anomaly_multiplier: f64,
    total_events: AtomicU64,
    total_alerts: AtomicU64,
    total_anomalies: AtomicU64,
}

impl ThreatDetectionEngine {
    pub fn new(bus: Arc<EventBus>, anomaly_multiplier: f64) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            recent_events: RwLock::new(Vec::with_capacity(1024)),
            bus,
            anomaly_multiplier,
            total_events: AtomicU64::new(0),
            total_alerts: AtomicU64::new(0),
            total_anomalies: AtomicU64::new(0),
        }
    }

    /// Feed one event: update the user's profile, then run local rule
    /// checks. A bad event never halts ingestion.
    pub fn ingest(&self, event: &SecurityEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        if let Some(user_id) = event.user_id.clone() {
            // Profile updates for one user are serialized under the map
            // lock; concurrent ingest for different users interleaves at
            // event granularity, never mid-update.
            let mut profiles = self.profiles.write();
            let profile = profiles
                .entry(user_id.clone())
                .or_insert_with(|| UserBehaviorProfile::new(&user_id));

            let mut unfamiliar_location = None;
            let mut unfamiliar_device = None;

            match event.event_type.as_str() {
                "login" | "failed_login" => {
                    let hour = ((event.timestamp.rem_euclid(86_400)) / 3_600) as u8;
                    push_bounded(&mut profile.login_hours, hour);
                    if let Some(loc) = &event.location {
                        if !profile.knows_location(loc) && !profile.locations.is_empty() {
                            unfamiliar_location = Some(loc.clone());
                        }
                        push_bounded(&mut profile.locations, loc.clone());
                    }
                    if let Some(dev) = &event.device_id {
                        if !profile.knows_device(dev) && !profile.devices.is_empty() {
                            unfamiliar_device = Some(dev.clone());
                        }
                        push_bounded(&mut profile.devices, dev.clone());
                    }
                }
                "session_end" => {
                    if let Some(dur) = event
                        .metadata
                        .get("duration_secs")
                        .and_then(|d| d.parse::<i64>().ok())
                    {
                        push_bounded(&mut profile.session_durations, dur);
                    }
                }
                other => {
                    *profile.feature_usage.entry(other.to_string()).or_insert(0) += 1;
                }
            }
            profile.updated_at = chrono::Utc::now().timestamp();
            drop(profiles);

            if let Some(loc) = unfamiliar_location {
                self.emit_alert(ThreatAlert::new(
                    "unfamiliar_location",
                    Severity::Medium,
                    Some(&user_id),
                    &format!("Login from previously unseen location '{}'", loc),
                ));
            }
            if let Some(dev) = unfamiliar_device {
                self.emit_alert(ThreatAlert::new(
                    "unfamiliar_device",
                    Severity::Medium,
                    Some(&user_id),
                    &format!("Login from previously unseen device '{}'", dev),
                ));
            }
            if event.event_type == "failed_login" {
                self.check_failed_login_burst(&user_id, event.timestamp);
            }
        }

        let mut ring = self.recent_events.write();
        if ring.len() >= MAX_RECENT_EVENTS {
            let drain = MAX_RECENT_EVENTS / 10;
            ring.drain(..drain);
        }
        ring.push(event.clone());
    }

    fn check_failed_login_burst(&self, user_id: &str, now: i64) {
        let ring = self.recent_events.read();
        let failures = ring
            .iter()
            .filter(|e| {
                e.event_type == "failed_login"
                    && e.user_id.as_deref() == Some(user_id)
                    && now - e.timestamp <= 600
            })
            .count();
        drop(ring);
        // The current event is not yet in the ring.
        if failures + 1 >= 5 {
            self.emit_alert(ThreatAlert::new(
                "repeated_failed_logins",
                Severity::High,
                Some(user_id),
                &format!("{} failed logins within 10 minutes", failures + 1),
            ));
        }
    }

    fn emit_alert(&self, mut alert: ThreatAlert) {
        self.total_alerts.fetch_add(1, Ordering::Relaxed);
        if alert.recommended_actions.is_empty() {
            alert.recommended_actions.push("Review recent account activity".into());
        }
        debug!(kind = %alert.alert_type, severity = ?alert.severity, "Threat alert");
        self.bus.threat_alerts.publish(alert);
    }

    /// Weighted fraud-risk assessment for a login attempt. Monotonic:
    /// every triggered factor adds a non-negative weight.
    pub fn analyze_fraud_risk(&self, attempt: &LoginAttempt) -> FraudAssessment {
        let profiles = self.profiles.read();
        let profile = profiles.get(&attempt.user_id);
        let mut factors = Vec::new();

        match (&attempt.location, profile) {
            (Some(loc), Some(p)) if !p.knows_location(loc) => factors.push(RiskFactor {
                name: "location".into(),
                weight: W_LOCATION,
                reason: format!("location '{}' not in baseline", loc),
            }),
            (Some(loc), None) => factors.push(RiskFactor {
                name: "location".into(),
                weight: W_LOCATION,
                reason: format!("no baseline to vouch for location '{}'", loc),
            }),
            _ => {}
        }

        match (&attempt.device_id, profile) {
            (Some(dev), Some(p)) if !p.knows_device(dev) => factors.push(RiskFactor {
                name: "device".into(),
                weight: W_DEVICE,
                reason: format!("device '{}' not in baseline", dev),
            }),
            (Some(dev), None) => factors.push(RiskFactor {
                name: "device".into(),
                weight: W_DEVICE,
                reason: format!("no baseline to vouch for device '{}'", dev),
            }),
            _ => {}
        }

        let hour = ((attempt.timestamp.rem_euclid(86_400)) / 3_600) as u8;
        let usual = profile.map_or(0, |p| p.logins_at_hour(hour));
        if (0..=5).contains(&hour) && usual < 3 {
            factors.push(RiskFactor {
                name: "timing".into(),
                weight: W_TIMING,
                reason: format!("login at {:02}:00 outside usual hours", hour),
            });
        }

        if attempt.attempts >= 5 && attempt.attempt_window_secs <= 60 {
            factors.push(RiskFactor {
                name: "velocity".into(),
                weight: W_VELOCITY,
                reason: format!(
                    "{} attempts in {}s",
                    attempt.attempts, attempt.attempt_window_secs
                ),
            });
        } else if attempt.attempts >= 3 {
            factors.push(RiskFactor {
                name: "velocity".into(),
                weight: W_VELOCITY * 0.4,
                reason: format!("{} recent attempts", attempt.attempts),
            });
        }

        if profile.map_or(true, |p| p.login_hours.is_empty()) {
            factors.push(RiskFactor {
                name: "behavioral".into(),
                weight: W_BEHAVIORAL,
                reason: "no behavioral history for user".into(),
            });
        }
        drop(profiles);

        let score = factors.iter().map(|f| f.weight).sum::<f64>().min(1.0);
        let level = RiskLevel::from_score(score);
        FraudAssessment {
            user_id: attempt.user_id.clone(),
            score,
            level,
            factors,
            recommended_action: level.recommended_action().to_string(),
        }
    }

    /// Compare the user's last-24h activity against their 7-day daily
    /// average; flag when the ratio exceeds the configured multiplier.
    pub fn detect_behavioral_anomalies(&self, user_id: &str) -> Option<AnomalyDetection> {
        let now = chrono::Utc::now().timestamp();
        let ring = self.recent_events.read();
        let day_count = ring
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id) && now - e.timestamp <= 86_400)
            .count();
        let week_count = ring
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id) && now - e.timestamp <= 7 * 86_400)
            .count();
        drop(ring);

        let baseline = week_count as f64 / 7.0;
        if baseline <= 0.0 || day_count == 0 {
            return None;
        }
        let ratio = day_count as f64 / baseline;
        if ratio <= self.anomaly_multiplier {
            return None;
        }

        self.total_anomalies.fetch_add(1, Ordering::Relaxed);
        let anomaly = AnomalyDetection {
            id: uuid::Uuid::new_v4().to_string(),
            anomaly_type: "activity_spike".into(),
            confidence: (ratio / (self.anomaly_multiplier * 2.0)).min(1.0),
            user_id: Some(user_id.into()),
            timestamp: now,
            details: format!(
                "{} events in 24h vs {:.1}/day baseline ({:.1}x)",
                day_count, baseline, ratio
            ),
        };
        warn!(user = %user_id, ratio = ratio, "Behavioral anomaly");
        self.bus.anomalies.publish(anomaly.clone());
        Some(anomaly)
    }

    /// Sliding-window pattern sweep over the last 15 minutes. Invoked by
    /// the coordinator's 5-minute timer.
    pub fn sweep_recent(&self) -> Vec<ThreatAlert> {
        let now = chrono::Utc::now().timestamp();
        let mut failures_by_user: HashMap<String, usize> = HashMap::new();
        let mut failed_users_by_ip: HashMap<String, Vec<String>> = HashMap::new();
        let mut api_calls_by_user: HashMap<String, usize> = HashMap::new();
        let mut timestamps_by_user: HashMap<String, Vec<i64>> = HashMap::new();

        // Aggregate into owned keys so the ring lock is released before any
        // alert fan-out runs.
        {
            let ring = self.recent_events.read();
            for e in ring.iter().filter(|e| now - e.timestamp <= SWEEP_WINDOW_SECS) {
                let user = e.user_id.as_deref().unwrap_or("<anonymous>");
                match e.event_type.as_str() {
                    "failed_login" => {
                        *failures_by_user.entry(user.to_owned()).or_insert(0) += 1;
                        if let Some(ip) = e.ip.as_deref() {
                            failed_users_by_ip
                                .entry(ip.to_owned())
                                .or_default()
                                .push(user.to_owned());
                        }
                    }
                    "api_call" => {
                        *api_calls_by_user.entry(user.to_owned()).or_insert(0) += 1;
                    }
                    _ => {}
                }
                timestamps_by_user.entry(user.to_owned()).or_default().push(e.timestamp);
            }
        }

        let mut alerts = Vec::new();

        for (user, count) in failures_by_user {
            if count >= BRUTE_FORCE_FAILURES {
                alerts.push(ThreatAlert::new(
                    "brute_force",
                    Severity::High,
                    Some(user.as_str()),
                    &format!("{} failed logins in the last 15 minutes", count),
                ));
            }
        }

        for (ip, mut users) in failed_users_by_ip {
            users.sort_unstable();
            users.dedup();
            if users.len() >= STUFFING_DISTINCT_USERS {
                alerts.push(ThreatAlert::new(
                    "credential_stuffing",
                    Severity::Critical,
                    None,
                    &format!("failed logins for {} distinct users from {}", users.len(), ip),
                ));
            }
        }

        for (user, count) in api_calls_by_user {
            if count >= API_ABUSE_CALLS {
                alerts.push(ThreatAlert::new(
                    "api_abuse",
                    Severity::Medium,
                    Some(user.as_str()),
                    &format!("{} API calls in the last 15 minutes", count),
                ));
            }
        }

        for (user, mut stamps) in timestamps_by_user {
            if stamps.len() < BOT_MIN_EVENTS {
                continue;
            }
            stamps.sort_unstable();
            let gaps: Vec<f64> = stamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
            let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
            let variance =
                gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
            if mean <= BOT_MAX_MEAN_GAP_SECS && variance <= 1.0 {
                alerts.push(ThreatAlert::new(
                    "bot_behavior",
                    Severity::Medium,
                    Some(user.as_str()),
                    &format!(
                        "{} events with machine-regular spacing (mean {:.2}s)",
                        stamps.len(),
                        mean
                    ),
                ));
            }
        }

        for alert in &alerts {
            self.emit_alert(alert.clone());
        }
        alerts
    }

    pub fn profile(&self, user_id: &str) -> Option<UserBehaviorProfile> {
        self.profiles.read().get(user_id).cloned()
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }
    pub fn total_alerts(&self) -> u64 {
        self.total_alerts.load(Ordering::Relaxed)
    }
    pub fn total_anomalies(&self) -> u64 {
        self.total_anomalies.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (ThreatDetectionEngine, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (ThreatDetectionEngine::new(bus.clone(), 3.0), bus)
    }

    fn login(user: &str, location: &str, device: &str, ts: i64) -> SecurityEvent {
        let mut e = SecurityEvent::new("login", Some(user))
            .with_location(location)
            .with_device(device);
        e.timestamp = ts;
        e
    }

    #[test]
    fn test_profile_updates_and_bound() {
        let (engine, _) = engine();
        let now = chrono::Utc::now().timestamp();
        for i in 0..150 {
            engine.ingest(&login("u1", &format!("loc{}", i), "d1", now));
        }
        let profile = engine.profile("u1").unwrap();
        assert_eq!(profile.locations.len(), PROFILE_BOUND);
        assert_eq!(profile.login_hours.len(), PROFILE_BOUND);
        // Oldest entries were dropped.
        assert!(!profile.locations.contains(&"loc0".to_string()));
        assert!(profile.locations.contains(&"loc149".to_string()));
    }

    #[test]
    fn test_unfamiliar_location_alert() {
        let (engine, bus) = engine();
        let now = chrono::Utc::now().timestamp();
        engine.ingest(&login("u1", "Paris", "d1", now));
        assert_eq!(bus.threat_alerts.total_published(), 0);
        engine.ingest(&login("u1", "Sydney", "d1", now));
        let alerts = bus.threat_alerts.recent(10);
        assert!(alerts.iter().any(|a| a.alert_type == "unfamiliar_location"));
    }

    #[test]
    fn test_critical_fraud_scenario() {
        // Unfamiliar device and location at 03:00 with 5 attempts in 10s.
        let (engine, _) = engine();
        let now = chrono::Utc::now().timestamp();
        // Build a baseline so the unfamiliarity is meaningful.
        engine.ingest(&login("u1", "Paris", "laptop", now - 86_400));

        let three_am = (now / 86_400) * 86_400 + 3 * 3_600;
        let assessment = engine.analyze_fraud_risk(&LoginAttempt {
            user_id: "u1".into(),
            location: Some("Lagos".into()),
            device_id: Some("burner".into()),
            ip: Some("203.0.113.9".into()),
            timestamp: three_am,
            attempts: 5,
            attempt_window_secs: 10,
        });

        assert!(assessment.score >= 0.8, "score was {}", assessment.score);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(assessment.recommended_action, "Block access immediately");
    }

    #[test]
    fn test_fraud_score_monotonic_in_factors() {
        let (engine, _) = engine();
        let now = chrono::Utc::now().timestamp();
        engine.ingest(&login("u1", "Paris", "laptop", now));

        let base = LoginAttempt {
            user_id: "u1".into(),
            location: None,
            device_id: None,
            ip: None,
            timestamp: now,
            attempts: 1,
            attempt_window_secs: 60,
        };
        let with_location = LoginAttempt { location: Some("Lagos".into()), ..base.clone() };
        let with_both = LoginAttempt {
            device_id: Some("burner".into()),
            ..with_location.clone()
        };

        let s0 = engine.analyze_fraud_risk(&base).score;
        let s1 = engine.analyze_fraud_risk(&with_location).score;
        let s2 = engine.analyze_fraud_risk(&with_both).score;
        assert!(s1 >= s0);
        assert!(s2 >= s1);
    }

    #[test]
    fn test_behavioral_anomaly_spike() {
        let (engine, bus) = engine();
        let now = chrono::Utc::now().timestamp();
        // Sparse baseline over the prior week, then a burst today.
        for day in 2..7 {
            let mut e = SecurityEvent::new("api_call", Some("u1"));
            e.timestamp = now - day * 86_400;
            engine.ingest(&e);
        }
        for i in 0..40 {
            let mut e = SecurityEvent::new("api_call", Some("u1"));
            e.timestamp = now - i;
            engine.ingest(&e);
        }

        let anomaly = engine.detect_behavioral_anomalies("u1").unwrap();
        assert_eq!(anomaly.anomaly_type, "activity_spike");
        assert_eq!(bus.anomalies.total_published(), 1);
    }

    #[test]
    fn test_sweep_detects_brute_force_and_stuffing() {
        let (engine, _) = engine();
        let now = chrono::Utc::now().timestamp();

        for i in 0..12 {
            let mut e = SecurityEvent::new("failed_login", Some("victim"));
            e.timestamp = now - i;
            engine.ingest(&e);
        }
        for i in 0..6 {
            let mut e =
                SecurityEvent::new("failed_login", Some(&format!("user{}", i))).with_ip("198.51.100.7");
            e.timestamp = now - i;
            engine.ingest(&e);
        }

        let alerts = engine.sweep_recent();
        assert!(alerts.iter().any(|a| a.alert_type == "brute_force"));
        assert!(alerts.iter().any(|a| a.alert_type == "credential_stuffing"));
    }
}
