//! Command template and parameter model (§3).
//!
//! Grounded on `backend/server_options.rs`: an owned, `Clone`-per-connection
//! options struct that is cheap to duplicate for every shard.

use std::time::Duration;

use crate::error::{ConfigError, Error};
use crate::value::Value;

/// How the shard client should interpret the command text (§3 "a command
/// type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    #[default]
    Text,
    StoredProcedure,
}

/// Parameter passing direction. Only [`ParameterDirection::Input`] is
/// accepted by [`CommandTemplate::add_parameter`] — output parameters are an
/// explicit Non-goal (§1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    fn name(self) -> &'static str {
        match self {
            ParameterDirection::Input => "input",
            ParameterDirection::Output => "output",
            ParameterDirection::InputOutput => "input-output",
            ParameterDirection::ReturnValue => "return-value",
        }
    }
}

/// One bound parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: Option<String>,
    pub value: Value,
    pub direction: ParameterDirection,
}

impl Parameter {
    pub fn input(value: Value) -> Self {
        Self {
            name: None,
            value,
            direction: ParameterDirection::Input,
        }
    }

    pub fn named_input(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: Some(name.into()),
            value,
            direction: ParameterDirection::Input,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.direction != ParameterDirection::Input {
            return Err(Error::Configuration(ConfigError::UnsupportedParameterDirection {
                direction: self.direction.name(),
            }));
        }
        if matches!(self.value, Value::Bytes(ref b) if b.len() > STREAMING_THRESHOLD) {
            return Err(Error::Configuration(ConfigError::UnsupportedParameterValueKind {
                kind: "large-object stream",
            }));
        }
        Ok(())
    }
}

/// Above this size a byte parameter is treated as a large-object stream,
/// which result streaming of parameters to shards explicitly excludes (§1
/// Non-goals).
const STREAMING_THRESHOLD: usize = 64 * 1024 * 1024;

/// Default per-shard command timeout (§4.8).
pub const DEFAULT_SHARD_TIMEOUT: Duration = Duration::from_secs(30);

/// User-supplied SQL text, a per-shard timeout, a parameter list and a
/// command type (§3). Cloned once per shard by the dispatcher; each clone
/// carries independent parameter values (§5 "cloning copies parameter
/// values") but the same text/timeout/type.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    sql: String,
    command_type: CommandType,
    shard_timeout: Duration,
    parameters: Vec<Parameter>,
}

impl CommandTemplate {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            command_type: CommandType::Text,
            shard_timeout: DEFAULT_SHARD_TIMEOUT,
            parameters: Vec::new(),
        }
    }

    pub fn with_command_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    pub fn with_shard_timeout(mut self, timeout: Duration) -> Self {
        self.shard_timeout = timeout;
        self
    }

    /// Bind a parameter. Rejects non-input directions and streamed
    /// large-object values up front (§6 "Unsupported operations").
    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<(), Error> {
        parameter.validate()?;
        self.parameters.push(parameter);
        Ok(())
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn shard_timeout(&self) -> Duration {
        self.shard_timeout
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Produce the per-shard clone dispatched to one shard. Parameter
    /// values are copied by value (§5); the clone otherwise carries the
    /// same text, type and timeout.
    pub(crate) fn clone_for_dispatch(&self) -> CommandTemplate {
        self.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_output_parameter() {
        let mut template = CommandTemplate::new("SELECT 1");
        let err = template
            .add_parameter(Parameter {
                name: None,
                value: Value::Integer(1),
                direction: ParameterDirection::Output,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::UnsupportedParameterDirection { .. })
        ));
    }

    #[test]
    fn accepts_input_parameter() {
        let mut template = CommandTemplate::new("SELECT $1");
        template
            .add_parameter(Parameter::input(Value::Integer(42)))
            .unwrap();
        assert_eq!(template.parameters().len(), 1);
    }

    #[test]
    fn clone_for_dispatch_preserves_text_and_timeout() {
        let template = CommandTemplate::new("SELECT 1").with_shard_timeout(Duration::from_secs(5));
        let clone = template.clone_for_dispatch();
        assert_eq!(clone.sql(), "SELECT 1");
        assert_eq!(clone.shard_timeout(), Duration::from_secs(5));
    }
}
