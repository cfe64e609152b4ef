use serde_json::{Map, Value};
use std::sync::Arc;

use crate::security::{LogLevel, Result, SecurityService};

/// Level-named entry points onto the secure log.
///
/// Every method ends in the single [`SecurityService::log`] call, so the
/// whole pipeline (quota, redaction, chaining) applies uniformly.
#[derive(Clone)]
pub struct Logger {
    service: Arc<SecurityService>,
    component: Option<String>,
}

impl Logger {
    pub fn new(service: Arc<SecurityService>) -> Self {
        Self {
            service,
            component: None,
        }
    }

    /// Tag every entry from this handle with a `component` context field.
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            service: self.service.clone(),
            component: Some(component.into()),
        }
    }

    pub async fn debug(&self, message: &str, context: Option<Value>) -> Result<()> {
        self.log(LogLevel::Debug, message, context).await
    }

    pub async fn info(&self, message: &str, context: Option<Value>) -> Result<()> {
        self.log(LogLevel::Info, message, context).await
    }

    pub async fn warn(&self, message: &str, context: Option<Value>) -> Result<()> {
        self.log(LogLevel::Warn, message, context).await
    }

    pub async fn error(&self, message: &str, context: Option<Value>) -> Result<()> {
        self.log(LogLevel::Error, message, context).await
    }

    pub async fn critical(&self, message: &str, context: Option<Value>) -> Result<()> {
        self.log(LogLevel::Critical, message, context).await
    }

    pub async fn log(&self, level: LogLevel, message: &str, context: Option<Value>) -> Result<()> {
        let context = match &self.component {
            Some(component) => Some(with_component(context, component)),
            None => context,
        };
        self.service.log(level, message, context).await
    }
}

fn with_component(context: Option<Value>, component: &str) -> Value {
    match context {
        Some(Value::Object(mut fields)) => {
            fields
                .entry("component")
                .or_insert_with(|| Value::String(component.to_string()));
            Value::Object(fields)
        }
        Some(other) => {
            let mut fields = Map::new();
            fields.insert("component".into(), Value::String(component.to_string()));
            fields.insert("value".into(), other);
            Value::Object(fields)
        }
        None => {
            let mut fields = Map::new();
            fields.insert("component".into(), Value::String(component.to_string()));
            Value::Object(fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityConfig, SecurityMode, TimeRange};
    use serde_json::json;

    fn logger() -> Logger {
        let service = SecurityService::new(SecurityConfig {
            mode: SecurityMode::Basic,
            ..SecurityConfig::default()
        })
        .unwrap();
        Logger::new(Arc::new(service))
    }

    #[tokio::test]
    async fn level_methods_map_to_levels() {
        let log = logger();
        log.info("i", None).await.unwrap();
        log.warn("w", None).await.unwrap();
        log.error("e", None).await.unwrap();
        log.critical("c", None).await.unwrap();
        log.debug("d", None).await.unwrap();

        let levels: Vec<LogLevel> = log
            .service
            .logger()
            .entries(TimeRange::all())
            .iter()
            .map(|e| e.level)
            .collect();
        // Debug is below the default level.
        assert_eq!(
            levels,
            vec![LogLevel::Info, LogLevel::Warn, LogLevel::Error, LogLevel::Critical]
        );
    }

    #[tokio::test]
    async fn component_tag_merges_into_context() {
        let log = logger().for_component("renderer");
        log.info("page", Some(json!({"n": 2}))).await.unwrap();
        log.info("bare", None).await.unwrap();

        let entries = log.service.logger().entries(TimeRange::all());
        assert_eq!(entries[0].context, Some(json!({"n": 2, "component": "renderer"})));
        assert_eq!(entries[1].context, Some(json!({"component": "renderer"})));
    }

    #[test]
    fn scalar_context_is_wrapped() {
        assert_eq!(
            with_component(Some(json!(5)), "x"),
            json!({"component": "x", "value": 5})
        );
    }
}
