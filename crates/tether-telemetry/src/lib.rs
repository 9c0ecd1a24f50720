//! Tracing-subscriber initialisation for binaries and tests that embed the
//! session library. The library itself only emits `tracing` events; wiring
//! them somewhere is the host's call.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_session" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_output: false,
        }
    }
}

impl TelemetryConfig {
    /// The env-filter directive string this config describes.
    fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Handle returned by [`init_telemetry`]; keeps the configured module levels
/// inspectable at runtime.
pub struct TelemetryGuard {
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    pub fn set_module_level(&self, module: &str, level: Level) {
        let mut levels = self.module_levels.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
    }
}

/// Initialize the global subscriber. Call once at startup; a second call
/// (e.g. from parallel tests) leaves the existing subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let already_set = if config.json_output {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .is_err()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_err()
    };
    if already_set {
        tracing::debug!("telemetry already initialized; keeping existing subscriber");
    }

    TelemetryGuard {
        module_levels: Arc::new(RwLock::new(config.module_levels)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.module_levels.is_empty());
        assert!(!config.json_output);
    }

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("tether_session".into(), Level::DEBUG),
                ("tether_core".into(), Level::TRACE),
            ],
            json_output: false,
        };
        assert_eq!(
            config.filter_directives(),
            "warn,tether_session=debug,tether_core=trace"
        );
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            module_levels: Arc::new(RwLock::new(vec![("a".into(), Level::INFO)])),
        };
        guard.set_module_level("a", Level::DEBUG);
        guard.set_module_level("b", Level::WARN);
        assert_eq!(
            guard.module_levels(),
            vec![("a".into(), Level::DEBUG), ("b".into(), Level::WARN)]
        );
    }

    #[test]
    fn init_is_idempotent() {
        let _first = init_telemetry(TelemetryConfig::default());
        let _second = init_telemetry(TelemetryConfig::default());
    }
}
