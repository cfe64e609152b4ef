//! Security modes and the feature set each one enables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named policy preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Development: full validation and redaction, no persistence guarantees.
    Basic,
    /// Throughput: caching and buffered writes, minimal overhead.
    Optimized,
    /// Production default: everything except the performance shortcuts.
    #[default]
    Secure,
    /// Secure plus caching and buffering.
    Enterprise,
}

/// Toggles consumed by the validator, rate limiter, logger and façades.
///
/// Input validation has no toggle; every mode validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub caching: bool,
    pub buffered_io: bool,
    pub keep_stack_traces: bool,
    pub sanitize_messages: bool,
    pub encrypt_sensitive: bool,
    pub audit: bool,
    pub rate_limiting: bool,
    pub pii_filtering: bool,
    pub injection_prevention: bool,
    pub integrity: bool,
    pub anomaly_detection: bool,
}

impl SecurityMode {
    pub const ALL: [SecurityMode; 4] = [
        SecurityMode::Basic,
        SecurityMode::Optimized,
        SecurityMode::Secure,
        SecurityMode::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Basic => "basic",
            SecurityMode::Optimized => "optimized",
            SecurityMode::Secure => "secure",
            SecurityMode::Enterprise => "enterprise",
        }
    }

    /// Feature set for this mode. Pure; the same mode always yields the same flags.
    pub fn features(self) -> FeatureFlags {
        match self {
            SecurityMode::Basic => FeatureFlags {
                caching: false,
                buffered_io: false,
                keep_stack_traces: true,
                sanitize_messages: true,
                encrypt_sensitive: false,
                audit: false,
                rate_limiting: true,
                pii_filtering: true,
                injection_prevention: true,
                integrity: false,
                anomaly_detection: false,
            },
            SecurityMode::Optimized => FeatureFlags {
                caching: true,
                buffered_io: true,
                keep_stack_traces: false,
                sanitize_messages: true,
                encrypt_sensitive: false,
                audit: false,
                rate_limiting: true,
                pii_filtering: false,
                injection_prevention: true,
                integrity: false,
                anomaly_detection: false,
            },
            SecurityMode::Secure => FeatureFlags {
                caching: false,
                buffered_io: false,
                keep_stack_traces: false,
                sanitize_messages: true,
                encrypt_sensitive: true,
                audit: true,
                rate_limiting: true,
                pii_filtering: true,
                injection_prevention: true,
                integrity: true,
                anomaly_detection: true,
            },
            SecurityMode::Enterprise => FeatureFlags {
                caching: true,
                buffered_io: true,
                ..SecurityMode::Secure.features()
            },
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(SecurityMode::Basic),
            "optimized" => Ok(SecurityMode::Optimized),
            "secure" => Ok(SecurityMode::Secure),
            "enterprise" => Ok(SecurityMode::Enterprise),
            other => Err(format!(
                "Unknown security mode '{}'. Expected one of: basic, optimized, secure, enterprise",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_are_pure() {
        for mode in SecurityMode::ALL {
            assert_eq!(mode.features(), mode.features());
        }
    }

    #[test]
    fn secure_modes_chain_and_audit() {
        for mode in [SecurityMode::Secure, SecurityMode::Enterprise] {
            let f = mode.features();
            assert!(f.integrity && f.audit && f.encrypt_sensitive && f.anomaly_detection);
            assert!(!f.keep_stack_traces);
        }
        assert!(!SecurityMode::Basic.features().integrity);
        assert!(SecurityMode::Basic.features().keep_stack_traces);
    }

    #[test]
    fn performance_shortcuts_only_where_expected() {
        assert!(SecurityMode::Optimized.features().caching);
        assert!(SecurityMode::Enterprise.features().buffered_io);
        assert!(!SecurityMode::Secure.features().caching);
        assert!(!SecurityMode::Basic.features().buffered_io);
    }

    #[test]
    fn every_mode_rate_limits() {
        for mode in SecurityMode::ALL {
            assert!(mode.features().rate_limiting);
        }
    }

    #[test]
    fn parse_and_display_agree() {
        for mode in SecurityMode::ALL {
            assert_eq!(mode.to_string().parse::<SecurityMode>().unwrap(), mode);
        }
        assert_eq!("ENTERPRISE".parse::<SecurityMode>().unwrap(), SecurityMode::Enterprise);
        assert!("paranoid".parse::<SecurityMode>().is_err());
    }
}
