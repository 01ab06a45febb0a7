//! Listener configuration
//!
//! Subject naming, intake sizing, the in-flight bound for request setup and
//! log output.
//! Every field has a default, so partial JSON/TOML files and environment
//! overrides only need to name what they change.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ListenerError, ListenerResult};
use crate::logging::{parse_log_level, LoggingConfig};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "ARI_LISTENER_";

/// Subject naming scheme shared with the ARI proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    /// Prefix of the application-start subject (`ari.app.<application>`)
    pub app_prefix: String,
    /// Suffix appended to the application name to form the queue group
    pub queue_group_suffix: String,
    /// Prefix of the per-dialog event subject (`events.dialog.<dialog id>`)
    pub dialog_event_prefix: String,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            app_prefix: "ari.app.".to_string(),
            queue_group_suffix: "_app_listener".to_string(),
            dialog_event_prefix: "events.dialog.".to_string(),
        }
    }
}

impl SubjectConfig {
    /// Subject carrying application-start notifications
    pub fn app_subject(&self, application: &str) -> String {
        format!("{}{}", self.app_prefix, application)
    }

    /// Queue group shared by every listener of one application
    pub fn queue_group(&self, application: &str) -> String {
        format!("{}{}", application, self.queue_group_suffix)
    }

    /// Subject carrying protocol events for one dialog
    pub fn dialog_subject(&self, dialog_id: &str) -> String {
        format!("{}{}", self.dialog_event_prefix, dialog_id)
    }
}

/// What the listener does when `max_in_flight` requests are already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Stop pulling from the intake buffer until a slot frees up
    #[default]
    Wait,
    /// Answer the requester with an error and move on
    Reject,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(ListenerError::config(format!("unknown overflow policy: {}", other))),
        }
    }
}

/// Main listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Subject naming scheme
    pub subjects: SubjectConfig,
    /// Capacity of the application-start intake buffer
    pub intake_capacity: usize,
    /// Maximum notifications in setup (ack, session, event subscription) at once;
    /// running handlers do not count (0 = unbounded)
    pub max_in_flight: usize,
    /// Behaviour once `max_in_flight` is reached
    pub overflow: OverflowPolicy,
    /// Capacity of each per-dialog subscription buffer
    pub session_intake_capacity: usize,
    /// Capacity of each session's event bus
    pub session_event_capacity: usize,
    /// Log output installed by [`setup_logging`](crate::setup_logging)
    pub logging: LoggingConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            subjects: SubjectConfig::default(),
            intake_capacity: 2,
            max_in_flight: 64,
            overflow: OverflowPolicy::Wait,
            session_intake_capacity: 16,
            session_event_capacity: 64,
            logging: LoggingConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Set the in-flight bound
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the overflow policy
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the intake buffer capacity
    pub fn with_intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = capacity;
        self
    }

    /// Replace the subject naming scheme
    pub fn with_subjects(mut self, subjects: SubjectConfig) -> Self {
        self.subjects = subjects;
        self
    }

    /// Load configuration from a JSON or TOML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> ListenerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ListenerError::config(format!("{}: {}", path.display(), e)))?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| ListenerError::config(format!("{}: {}", path.display(), e)))?,
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| ListenerError::config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(ListenerError::config(format!(
                    "unsupported configuration format: {}",
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults with `ARI_LISTENER_*` environment overrides applied
    pub fn from_env() -> ListenerResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up by unprefixed key (e.g. `MAX_IN_FLIGHT`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ListenerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP_PREFIX") {
            self.subjects.app_prefix = v;
        }
        if let Some(v) = lookup("QUEUE_GROUP_SUFFIX") {
            self.subjects.queue_group_suffix = v;
        }
        if let Some(v) = lookup("DIALOG_EVENT_PREFIX") {
            self.subjects.dialog_event_prefix = v;
        }
        if let Some(v) = lookup("INTAKE_CAPACITY") {
            self.intake_capacity = parse_usize("INTAKE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("MAX_IN_FLIGHT") {
            self.max_in_flight = parse_usize("MAX_IN_FLIGHT", &v)?;
        }
        if let Some(v) = lookup("OVERFLOW") {
            self.overflow = v.parse()?;
        }
        if let Some(v) = lookup("SESSION_INTAKE_CAPACITY") {
            self.session_intake_capacity = parse_usize("SESSION_INTAKE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SESSION_EVENT_CAPACITY") {
            self.session_event_capacity = parse_usize("SESSION_EVENT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_JSON") {
            self.logging.json = parse_bool("LOG_JSON", &v)?;
        }
        Ok(())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> ListenerResult<()> {
        if self.intake_capacity == 0 {
            return Err(ListenerError::config("intake_capacity must be greater than zero"));
        }
        if self.session_intake_capacity == 0 {
            return Err(ListenerError::config(
                "session_intake_capacity must be greater than zero",
            ));
        }
        if self.session_event_capacity == 0 {
            return Err(ListenerError::config(
                "session_event_capacity must be greater than zero",
            ));
        }
        if self.subjects.app_prefix.is_empty() || self.subjects.dialog_event_prefix.is_empty() {
            return Err(ListenerError::config("subject prefixes must not be empty"));
        }
        parse_log_level(&self.logging.level)?;
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> ListenerResult<usize> {
    value.trim().parse().map_err(|_| {
        ListenerError::config(format!("{}{} is not a number: {}", ENV_PREFIX, key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> ListenerResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ListenerError::config(format!(
            "{}{} is not a boolean: {}",
            ENV_PREFIX, key, value
        ))),
    }
}

/// Check that an application name can be embedded in a subject
pub fn validate_application(name: &str) -> ListenerResult<()> {
    if name.is_empty() {
        return Err(ListenerError::invalid_application(name, "must not be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(ListenerError::invalid_application(
            name,
            format!("contains reserved character {:?}", c),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_default_subjects() {
        let subjects = SubjectConfig::default();
        assert_eq!(subjects.app_subject("app1"), "ari.app.app1");
        assert_eq!(subjects.queue_group("app1"), "app1_app_listener");
        assert_eq!(subjects.dialog_subject("d1"), "events.dialog.d1");
    }

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.intake_capacity, 2);
        assert_eq!(config.overflow, OverflowPolicy::Wait);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ListenerConfig =
            serde_json::from_str(r#"{"max_in_flight": 4, "overflow": "reject"}"#).unwrap();

        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(config.subjects, SubjectConfig::default());
    }

    #[test]
    fn test_toml_subjects() {
        let config: ListenerConfig = toml::from_str(
            r#"
            intake_capacity = 8

            [subjects]
            app_prefix = "pbx.app."
            "#,
        )
        .unwrap();

        assert_eq!(config.intake_capacity, 8);
        assert_eq!(config.subjects.app_subject("ivr"), "pbx.app.ivr");
        assert_eq!(config.subjects.dialog_subject("x"), "events.dialog.x");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MAX_IN_FLIGHT", "0"),
            ("OVERFLOW", "Reject"),
            ("DIALOG_EVENT_PREFIX", "evt.dlg."),
        ]);

        let mut config = ListenerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_in_flight, 0);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(config.subjects.dialog_subject("d"), "evt.dlg.d");
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = ListenerConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "INTAKE_CAPACITY").then(|| "two".to_string())
        });
        assert!(matches!(result, Err(ListenerError::Configuration { .. })));
    }

    #[test]
    fn test_logging_section_and_overrides() {
        let mut config: ListenerConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
            directives = ["async_nats=warn"]
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);

        let vars: HashMap<&str, &str> = HashMap::from([("LOG_LEVEL", "trace"), ("LOG_JSON", "on")]);
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(
            config.logging.default_filter().unwrap(),
            "ari_listener=trace,async_nats=warn"
        );
        assert!(config.logging.json);
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = ListenerConfig::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(ListenerError::Configuration { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_intake() {
        let config = ListenerConfig::default().with_intake_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let path = std::env::temp_dir().join(format!("ari-listener-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"session_event_capacity": 5}"#).unwrap();

        let config = ListenerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.session_event_capacity, 5);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let result = ListenerConfig::from_file("listener.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_application() {
        assert!(validate_application("app1").is_ok());
        assert!(validate_application("").is_err());
        assert!(validate_application("my.app").is_err());
        assert!(validate_application("app *").is_err());
    }
}
