//! Security events, observer registration, and the bounded audit trail.
//!
//! Components never talk to an observer directly. They hold an
//! [`Auditor`], which appends every event to its own [`AuditTrail`] ring
//! buffer and fans it out through the shared [`EventBus`] to registered
//! [`EventSink`]s and channel subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum events retained per audit trail.
pub const AUDIT_TRAIL_CAPACITY: usize = 1_000;

/// Maximum characters of offending input kept on an event.
const SNIPPET_CHARS: usize = 100;

/// What happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Request rejected while the key is temporarily blocked.
    Blocked,
    /// Request rejected by the quota algorithm.
    RateLimitExceeded,
    /// Key moved to the blacklist.
    Blacklisted,
    /// Log content carried control sequences or template syntax.
    InjectionAttempt,
    /// Input was altered to make it safe.
    Sanitization,
    PathTraversal,
    ConfigInjection,
    ScriptInjection,
    PrototypePollution,
    ShellInjection,
    EnvVarViolation,
    /// Log stream looks abnormal (error burst, repeated message).
    Anomaly,
    /// Hash chain did not replay.
    IntegrityFailure,
    /// An application error passed through the error handler.
    ErrorHandled,
    ModeChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Blocked => "blocked",
            EventKind::RateLimitExceeded => "rate_limit_exceeded",
            EventKind::Blacklisted => "blacklisted",
            EventKind::InjectionAttempt => "injection_attempt",
            EventKind::Sanitization => "sanitization",
            EventKind::PathTraversal => "path_traversal",
            EventKind::ConfigInjection => "config_injection",
            EventKind::ScriptInjection => "script_injection",
            EventKind::PrototypePollution => "prototype_pollution",
            EventKind::ShellInjection => "shell_injection",
            EventKind::EnvVarViolation => "env_var_violation",
            EventKind::Anomaly => "anomaly",
            EventKind::IntegrityFailure => "integrity_failure",
            EventKind::ErrorHandled => "error_handled",
            EventKind::ModeChanged => "mode_changed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub kind: EventKind,
    /// Component or caller that raised the event (`validator`, `rate_limiter:config_load`, ...).
    pub source: String,
    /// Escaped, truncated excerpt of the offending input.
    pub input_snippet: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SecurityEvent {
    pub fn new(kind: EventKind, severity: Severity, source: impl Into<String>, input: &str) -> Self {
        Self {
            kind,
            source: source.into(),
            input_snippet: snippet(input),
            timestamp: Utc::now(),
            severity,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Escape control characters and cap the length so a snippet can never
/// carry the payload it describes into a downstream log line.
pub fn snippet(input: &str) -> String {
    let escaped: String = input.escape_debug().collect();
    if escaped.chars().count() <= SNIPPET_CHARS {
        escaped
    } else {
        let mut cut: String = escaped.chars().take(SNIPPET_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

/// Observer callback for security events.
///
/// Implementations must not block for long; persistent sinks should
/// append and return.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SecurityEvent);
}

/// Fan-out point for events.
///
/// Delivery is at-least-once within one process: every registered sink
/// sees every event, and every live subscriber channel receives a copy.
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SecurityEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SecurityEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: &SecurityEvent) {
        if event.severity >= Severity::High {
            warn!(
                kind = event.kind.as_str(),
                source = %event.source,
                severity = ?event.severity,
                "Security event"
            );
        } else {
            debug!(
                kind = event.kind.as_str(),
                source = %event.source,
                severity = ?event.severity,
                "Security event"
            );
        }

        for sink in self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            sink.record(event);
        }

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Append-only ring buffer of the most recent events.
pub struct AuditTrail {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn push(&self, event: SecurityEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(AUDIT_TRAIL_CAPACITY)
    }
}

/// Registering a trail on a bus collects events from every component.
impl EventSink for AuditTrail {
    fn record(&self, event: &SecurityEvent) {
        self.push(event.clone());
    }
}

/// A component's handle for raising events: local trail plus shared bus.
pub struct Auditor {
    trail: AuditTrail,
    bus: Arc<EventBus>,
}

impl Auditor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            trail: AuditTrail::default(),
            bus,
        }
    }

    pub fn record(&self, event: SecurityEvent) {
        self.bus.emit(&event);
        self.trail.push(event);
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}
