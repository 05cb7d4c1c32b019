//! Shard endpoint identity and connection template.
//!
//! Grounded on `backend/pool/address.rs` (`Address`): an immutable, cheaply
//! cloned value type identifying one backend, whose string form doubles as
//! a log/display label.

use std::fmt;

use crate::error::{ConfigError, Error};

/// Compile-time constant appended to every derived connection as an
/// application-name tag (§9, "Global/process state: none" — this is the
/// only thing resembling shared state, and it is a literal, not a registry).
pub const APPLICATION_NAME_SUFFIX: &str = "xshard";

/// Immutable identifier of one backend shard (§3).
///
/// Equality is value equality. The [`Display`](fmt::Display) form is used
/// both as the shard label in events/errors and as the value written into
/// the synthetic shard-name column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardEndpoint {
    data_source: String,
    database: String,
    protocol: Option<String>,
    port: Option<u16>,
}

impl ShardEndpoint {
    pub fn new(data_source: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            database: database.into(),
            protocol: None,
            port: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The string form used as the shard label (§3) and as the value of the
    /// synthetic shard-name column (§6, `$ShardName`).
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.protocol, self.port) {
            (Some(protocol), Some(port)) => {
                write!(f, "{protocol}://{}:{port}/{}", self.data_source, self.database)
            }
            (Some(protocol), None) => write!(f, "{protocol}://{}/{}", self.data_source, self.database),
            (None, Some(port)) => write!(f, "{}:{port}/{}", self.data_source, self.database),
            (None, None) => write!(f, "{}/{}", self.data_source, self.database),
        }
    }
}

/// A connection template shared by all shards: everything about the
/// connection except the data-source and database, which are derived per
/// shard at dispatch time (§3 "Per-shard connection" lifecycle).
///
/// Constructing a [`crate::MultiShardConnection`] rejects a template that
/// already sets `data_source` or `database` (§6).
#[derive(Debug, Clone, Default)]
pub struct ConnectionTemplate {
    options: Vec<(String, String)>,
}

impl ConnectionTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    fn has_key(&self, key: &str) -> bool {
        self.options.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Validate the template doesn't pre-set `data_source`/`database`, then
    /// derive the per-shard option list with those two keys substituted and
    /// the application-name suffix appended (§6).
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.has_key("data_source") {
            return Err(Error::Configuration(ConfigError::TemplatePreset {
                field: "data_source",
            }));
        }
        if self.has_key("database") {
            return Err(Error::Configuration(ConfigError::TemplatePreset {
                field: "database",
            }));
        }
        Ok(())
    }

    pub(crate) fn for_shard(&self, shard: &ShardEndpoint) -> Vec<(String, String)> {
        let mut options = self.options.clone();
        options.push(("data_source".into(), shard.data_source().to_string()));
        options.push(("database".into(), shard.database().to_string()));
        let application_name = match options.iter_mut().find(|(k, _)| k == "application_name") {
            Some((_, v)) => {
                v.push('-');
                v.push_str(APPLICATION_NAME_SUFFIX);
                return options;
            }
            None => APPLICATION_NAME_SUFFIX.to_string(),
        };
        options.push(("application_name".into(), application_name));
        options
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn label_round_trips_through_display() {
        let endpoint = ShardEndpoint::new("host1", "shard_0");
        assert_eq!(endpoint.label(), "host1/shard_0");
    }

    #[test]
    fn rejects_preset_data_source() {
        let template = ConnectionTemplate::new().with_option("data_source", "host1");
        assert!(matches!(
            template.validate(),
            Err(Error::Configuration(ConfigError::TemplatePreset { field: "data_source" }))
        ));
    }

    #[test]
    fn derives_per_shard_options_with_application_name() {
        let template = ConnectionTemplate::new().with_option("timeout", "5");
        let shard = ShardEndpoint::new("host1", "shard_0");
        let options = template.for_shard(&shard);
        assert!(options.contains(&("data_source".to_string(), "host1".to_string())));
        assert!(options.contains(&("database".to_string(), "shard_0".to_string())));
        assert!(options
            .iter()
            .any(|(k, v)| k == "application_name" && v == APPLICATION_NAME_SUFFIX));
    }
}
