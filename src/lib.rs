//! Cross-shard query execution engine.
//!
//! Fans a single read-only command out to a set of database shards
//! concurrently and presents the combined result as one forward-only
//! reader, as if it had come from a single connection (§1, §2).
//!
//! The database client library itself is out of scope: [`client::ShardClient`]
//! is the seam this crate is built against, and any concrete driver can
//! implement it (§1, §4.1).

pub mod cancellation;
pub mod client;
pub mod command;
pub mod command_handle;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod executor;
pub mod reader;
pub mod retry;
pub mod schema;
pub mod telemetry;
/// In-memory [`client::ShardClient`] double for downstream tests; always
/// compiled in, like the teacher's own test fixtures, rather than gated
/// behind a feature flag.
pub mod testing;
pub mod value;

pub use client::{ReadBehavior, RowReader, ShardClient};
pub use command::{CommandTemplate, CommandType, Parameter, ParameterDirection};
pub use command_handle::{MultiShardCommand, MultiShardConnection, DEFAULT_OVERALL_TIMEOUT};
pub use endpoint::{ConnectionTemplate, ShardEndpoint};
pub use error::Error;
pub use events::{EventBroadcaster, EventHandlerError, EventSink, NoopEventSink, ShardEvent};
pub use reader::{LabeledReader, MergedReader, ReadyReader};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{ColumnDescriptor, DeclaredType, SchemaTable};
pub use value::Value;

/// Whether one shard's failure aborts the whole command or is tolerated
/// (§2, §4.4, §4.5).
///
/// Under [`ExecutionPolicy::Complete`] any shard failure cancels every
/// sibling shard and the whole command fails. Under
/// [`ExecutionPolicy::Partial`] a failing shard is recorded in
/// [`MergedReader::multi_shard_exceptions`] and the surviving shards'
/// rows are still delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    #[default]
    Complete,
    Partial,
}

/// Execution-shape options independent of the completeness policy (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionOptions {
    /// Append the synthetic `$ShardName` column to every row (§3, §6).
    pub include_shard_name: bool,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shard_name(mut self) -> Self {
        self.include_shard_name = true;
        self
    }
}
