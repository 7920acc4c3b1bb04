//! # Event Bus — broadcast streams between subsystems
//!
//! Each stream is a [`Topic`]: subscribers register callbacks and receive
//! every value published while they are subscribed (at-least-once, no replay
//! for late subscribers). A bounded retained log keeps recent values for
//! dashboard queries; when full, the oldest entries are dropped and counted.

use crate::consent::ConsentRecord;
use crate::privacy::DataRequest;
use crate::types::{
    AnomalyDetection, AuditEvent, SecurityAlert, SecurityEvent, SecurityMetrics, ThreatAlert,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Retained values per topic before the oldest are dropped.
const MAX_RETAINED: usize = 10_000;
/// Maximum subscribers per topic.
const MAX_SUBSCRIBERS: usize = 256;

pub type SubscriberFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscription<T> {
    id: u64,
    name: String,
    callback: SubscriberFn<T>,
}

/// A single broadcast stream carrying values of type `T`.
pub struct Topic<T: Clone + Send + Sync + 'static> {
    name: &'static str,
    subscriptions: RwLock<Vec<Subscription<T>>>,
    retained: RwLock<Vec<T>>,
    next_sub_id: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    total_dropped: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscriptions: RwLock::new(Vec::new()),
            retained: RwLock::new(Vec::with_capacity(256)),
            next_sub_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Publish a value to all active subscribers.
    pub fn publish(&self, value: T) {
        self.total_published.fetch_add(1, Ordering::Relaxed);

        let subs = self.subscriptions.read();
        for sub in subs.iter() {
            (sub.callback)(&value);
            self.total_delivered.fetch_add(1, Ordering::Relaxed);
        }
        drop(subs);

        let mut log = self.retained.write();
        if log.len() >= MAX_RETAINED {
            let drain = MAX_RETAINED / 10;
            log.drain(..drain);
            self.total_dropped.fetch_add(drain as u64, Ordering::Relaxed);
        }
        log.push(value);
    }

    /// Subscribe with a named callback. Returns an ID for unsubscribe.
    pub fn subscribe(&self, name: &str, callback: SubscriberFn<T>) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscriptions.write();
        if subs.len() >= MAX_SUBSCRIBERS {
            warn!(topic = self.name, name = %name, "Max subscribers reached, dropping oldest");
            subs.remove(0);
        }
        debug!(topic = self.name, name = %name, id, "Subscriber registered");
        subs.push(Subscription { id, name: name.into(), callback });
        id
    }

    /// Remove a subscription by ID. Returns true if it existed.
    pub fn unsubscribe(&self, sub_id: u64) -> bool {
        let mut subs = self.subscriptions.write();
        match subs.iter().position(|s| s.id == sub_id) {
            Some(pos) => {
                let sub = subs.remove(pos);
                debug!(topic = self.name, name = %sub.name, id = sub_id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Most recent retained values, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let log = self.retained.read();
        log.iter().rev().take(limit).cloned().collect()
    }

    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }
    pub fn total_delivered(&self) -> u64 {
        self.total_delivered.load(Ordering::Relaxed)
    }
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

/// The eight broadcast streams the engine exposes.
pub struct EventBus {
    pub security_events: Topic<SecurityEvent>,
    pub threat_alerts: Topic<ThreatAlert>,
    pub anomalies: Topic<AnomalyDetection>,
    pub data_requests: Topic<DataRequest>,
    pub consent_updates: Topic<ConsentRecord>,
    pub audit_events: Topic<AuditEvent>,
    pub security_alerts: Topic<SecurityAlert>,
    pub metrics: Topic<SecurityMetrics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            security_events: Topic::new("security_events"),
            threat_alerts: Topic::new("threat_alerts"),
            anomalies: Topic::new("anomalies"),
            data_requests: Topic::new("data_requests"),
            consent_updates: Topic::new("consent_updates"),
            audit_events: Topic::new("audit_events"),
            security_alerts: Topic::new("security_alerts"),
            metrics: Topic::new("metrics"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire-and-forget alert consumer (notification/UI layers).
pub trait AlertSink: Send + Sync {
    fn submit(&self, alert: &SecurityAlert);
}

/// Default sink: republishes onto the `security_alerts` stream.
pub struct BusAlertSink {
    bus: Arc<EventBus>,
}

impl BusAlertSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl AlertSink for BusAlertSink {
    fn submit(&self, alert: &SecurityAlert) {
        self.bus.security_alerts.publish(alert.clone());
    }
}
