//! Sliding-window anomaly detection over the log stream.

use std::collections::{HashMap, HashSet, VecDeque};

use super::entry::{LogLevel, SecureLogEntry};

pub const ANOMALY_WINDOW: usize = 100;
/// Samples required before the error rate is judged.
pub const MIN_SAMPLES: usize = 10;
pub const ERROR_RATE_THRESHOLD: f64 = 0.30;
pub const REPEAT_PREFIX_CHARS: usize = 50;
pub const REPEAT_THRESHOLD: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    ErrorRate { rate: f64, samples: usize },
    RepeatedMessage { prefix: String, count: usize },
}

impl Anomaly {
    pub fn describe(&self) -> String {
        match self {
            Anomaly::ErrorRate { rate, samples } => format!(
                "error rate {:.0}% over last {} entries",
                rate * 100.0,
                samples
            ),
            Anomaly::RepeatedMessage { prefix, count } => {
                format!("message repeated {} times: {}", count, prefix)
            }
        }
    }
}

struct Sample {
    severe: bool,
    prefix: Option<String>,
}

/// Raises each anomaly once per threshold crossing; it re-arms when the
/// condition clears.
#[derive(Default)]
pub struct AnomalyDetector {
    window: VecDeque<Sample>,
    errors: usize,
    prefixes: HashMap<String, usize>,
    error_alert: bool,
    repeat_alerts: HashSet<String>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, entry: &SecureLogEntry) -> Vec<Anomaly> {
        let prefix = entry
            .encrypted_ref
            .is_none()
            .then(|| entry.message.chars().take(REPEAT_PREFIX_CHARS).collect::<String>());
        let sample = Sample {
            severe: entry.level >= LogLevel::Error,
            prefix,
        };

        if self.window.len() >= ANOMALY_WINDOW
            && let Some(old) = self.window.pop_front()
        {
            self.forget(old);
        }
        if sample.severe {
            self.errors += 1;
        }
        let current_prefix = sample.prefix.clone();
        if let Some(p) = &sample.prefix {
            *self.prefixes.entry(p.clone()).or_insert(0) += 1;
        }
        self.window.push_back(sample);

        let mut found = Vec::new();

        let samples = self.window.len();
        let rate = self.errors as f64 / samples as f64;
        if samples >= MIN_SAMPLES && rate > ERROR_RATE_THRESHOLD {
            if !self.error_alert {
                self.error_alert = true;
                found.push(Anomaly::ErrorRate { rate, samples });
            }
        } else {
            self.error_alert = false;
        }

        if let Some(prefix) = current_prefix {
            let count = self.prefixes.get(&prefix).copied().unwrap_or(0);
            if count > REPEAT_THRESHOLD && self.repeat_alerts.insert(prefix.clone()) {
                found.push(Anomaly::RepeatedMessage { prefix, count });
            }
        }

        found
    }

    fn forget(&mut self, old: Sample) {
        if old.severe {
            self.errors -= 1;
        }
        if let Some(p) = old.prefix
            && let Some(count) = self.prefixes.get_mut(&p)
        {
            *count -= 1;
            if *count <= REPEAT_THRESHOLD {
                self.repeat_alerts.remove(&p);
            }
            if *count == 0 {
                self.prefixes.remove(&p);
            }
        }
    }
}
