//! Shard client abstraction (§4.1).
//!
//! The core treats the underlying database client library abstractly,
//! matching §1's "out of scope" boundary: connection, parameterized
//! command, async row reader and schema-table introspection are all behind
//! this trait. Grounded in shape (stage an open-then-execute-then-read
//! lifecycle, report schema up front, cancel/close best-effort) on
//! `backend/server/connection.rs` and `backend/pool/connection/multi_shard`,
//! but the trait itself has no wire-protocol concept — it is a clean-room
//! interface per the spec's external-collaborator boundary.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::CommandTemplate;
use crate::endpoint::ShardEndpoint;
use crate::error::ConfigError;
use crate::schema::SchemaTable;
use crate::value::Value;

/// Command-execution behavior flags mirrored from the client library's
/// surface. Every flag here is one of the "Unsupported command behaviors"
/// (§6) and exists only so [`ReadBehavior::validate`] can reject it by name;
/// the engine's own behavior is always a forward-only, multi-row,
/// keep-connection-open read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadBehavior {
    pub close_connection: bool,
    pub single_row: bool,
    pub single_result: bool,
}

impl ReadBehavior {
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.close_connection {
            return Err(ConfigError::UnsupportedCommandBehavior { name: "close-connection" }.into());
        }
        if self.single_row {
            return Err(ConfigError::UnsupportedCommandBehavior { name: "single-row" }.into());
        }
        if self.single_result {
            return Err(ConfigError::UnsupportedCommandBehavior { name: "single-result" }.into());
        }
        Ok(())
    }
}

/// A forward-only cursor over one shard's rows, returned by
/// [`ShardClient::execute_reader`].
///
/// `E` is the client's error type, shared with [`ShardClient::Error`] so a
/// failed row read can be classified as transient the same way a failed
/// command execution can (§4.2).
#[async_trait]
pub trait RowReader<E>: Send {
    /// Advance to the next row. `Ok(false)` at end of this shard's rows.
    async fn read(&mut self) -> Result<bool, E>;

    /// Read one column of the current row. `None` if the reader is not
    /// positioned on a row or the ordinal is out of range.
    fn get_value(&self, ordinal: usize) -> Option<Value>;

    /// Fill `buf` with as many columns of the current row as fit, returning
    /// how many were written (§4.7 `get_values`).
    fn get_values(&self, buf: &mut [Value]) -> usize {
        let mut written = 0;
        for (ordinal, slot) in buf.iter_mut().enumerate() {
            match self.get_value(ordinal) {
                Some(v) => {
                    *slot = v;
                    written += 1;
                }
                None => break,
            }
        }
        written
    }

    /// Number of columns in the result (§4.7 `field_count`).
    fn field_count(&self) -> usize;

    /// Whether this shard's execution reported at least one row, known as
    /// soon as the reader was opened (§3 "any-reader-has-rows").
    fn has_rows(&self) -> bool;

    /// Whether a further result set follows the current one. The merged
    /// reader always treats `true` here as an error (§4.7 `next_result`,
    /// §1 Non-goals).
    async fn has_next_result(&mut self) -> Result<bool, E>;
}

/// Abstracts one backend endpoint (§4.1). Implementors own the concrete
/// wire protocol / driver; the engine only ever calls these five
/// operations.
#[async_trait]
pub trait ShardClient: Send + Sync + 'static {
    type Connection: Send;
    type Command: Send;
    type RowReader: RowReader<Self::Error> + Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a connection to `endpoint`, honoring cooperative cancellation
    /// via `token`.
    async fn open(
        &self,
        endpoint: &ShardEndpoint,
        options: &[(String, String)],
        token: &CancellationToken,
    ) -> Result<Self::Connection, Self::Error>;

    /// Produce an independent executable command bound to `connection` from
    /// `template`. Called once per retry attempt (§4.4 "state residue"
    /// note) so a fresh clone is always attached to the same connection.
    async fn clone_command(
        &self,
        template: &CommandTemplate,
        connection: &Self::Connection,
    ) -> Result<Self::Command, Self::Error>;

    /// Execute `command` for a forward-only reader plus its schema. A
    /// `None` schema represents the "null schema" case (§4.6).
    async fn execute_reader(
        &self,
        command: &mut Self::Command,
        behavior: ReadBehavior,
        token: &CancellationToken,
    ) -> Result<(Self::RowReader, Option<SchemaTable>), Self::Error>;

    /// Best-effort, non-throwing cancellation of in-flight work on `command`
    /// (§4.1).
    async fn cancel(&self, command: &Self::Command);

    /// Idempotent, non-throwing close of a reader.
    async fn close_reader(&self, reader: Self::RowReader);

    /// Idempotent, non-throwing close of a connection.
    async fn close_connection(&self, connection: Self::Connection);

    /// The driver's own standard transient-error detector (§4.2 "a standard
    /// database-transient detector"): connection-reset, timeout-while-
    /// connecting, serialization/deadlock failure, or whatever else the
    /// concrete client considers safe to retry. Only the driver can know
    /// the shape of `Self::Error`, so this crate cannot supply one itself;
    /// the default recognizes nothing, leaving retries governed entirely by
    /// the caller-supplied predicate composed in via
    /// [`crate::retry::classifier`].
    fn is_transient(&self, _err: &Self::Error) -> bool {
        false
    }
}
