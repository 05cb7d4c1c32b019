//! Crate-wide error taxonomy (§7).
//!
//! One `thiserror`-derived enum per concern, following the teacher's
//! convention of a sibling `error.rs` per module
//! (`backend/pool/connection/multi_shard/error.rs`,
//! `frontend/router/parser/error.rs`) with a top-level enum that wraps them.

use std::fmt;

use thiserror::Error;

use crate::endpoint::ShardEndpoint;

/// Boxed source error from the shard client, kept type-erased since the
/// client library itself is an external abstraction (§1, §4.1).
pub type ClientError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("shard list must not be empty")]
    EmptyShardList,

    #[error("connection template must not pre-set `{field}`, it is derived per shard")]
    TemplatePreset { field: &'static str },

    #[error("command behavior `{name}` is not supported by multi-shard execution")]
    UnsupportedCommandBehavior { name: &'static str },

    #[error("only input parameters are supported, got direction `{direction}`")]
    UnsupportedParameterDirection { direction: &'static str },

    #[error("parameter value kind `{kind}` cannot be streamed to shards")]
    UnsupportedParameterValueKind { kind: &'static str },

    #[error("multiple result sets are not supported")]
    MultipleResultSets,
}

#[derive(Debug, Error)]
pub enum InvalidStateKind {
    #[error("a previous execution is still pending on this command")]
    PendingOperation,

    #[error("the merged reader is closed")]
    ReaderClosed,

    #[error("next_result() was already consumed")]
    NextResultAlreadyConsumed,

    #[error("cannot read the synthetic shard-name column as `{requested}`, it is always text")]
    InvalidCast { requested: &'static str },
}

#[derive(Debug, Error)]
pub enum InternalKind {
    #[error("shard {shard} returned a null schema after a non-null schema was already observed")]
    MixedNullSchema { shard: ShardEndpoint },

    #[error("no current reader is positioned at the head of the merged reader")]
    MissingCurrentReader,

    #[error("every shard failed under the complete-results policy; this must have aborted earlier")]
    AllShardsFailedUnderComplete,

    #[error("event handler for shard {shard} failed: {message}")]
    EventHandlerFailed { shard: ShardEndpoint, message: String },
}

#[derive(Debug)]
pub struct SchemaMismatch {
    pub shard: ShardEndpoint,
    pub detail: String,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema mismatch on shard {}: {}", self.shard, self.detail)
    }
}

impl std::error::Error for SchemaMismatch {}

/// Top-level error taxonomy (§7). Every kind from the spec's taxonomy is
/// represented by exactly one variant here.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("shard {shard} failed: {source}")]
    ShardExecution {
        shard: ShardEndpoint,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),

    #[error("row read on shard {shard} failed mid-iteration: {source}")]
    PartialRead {
        shard: ShardEndpoint,
        #[source]
        source: ClientError,
    },

    #[error("{} shard(s) failed", .0.len())]
    Aggregate(Vec<Error>),

    #[error("overall command timeout elapsed")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidState(#[from] InvalidStateKind),

    #[error("internal invariant violation: {0}")]
    Internal(#[from] InternalKind),
}

impl Error {
    pub fn shard_execution(shard: ShardEndpoint, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::ShardExecution {
            shard,
            source: Box::new(source),
        }
    }

    pub fn partial_read(shard: ShardEndpoint, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::PartialRead {
            shard,
            source: Box::new(source),
        }
    }

    /// The shard this error is scoped to, if any (aggregate/global errors
    /// have none).
    pub fn shard(&self) -> Option<&ShardEndpoint> {
        match self {
            Error::ShardExecution { shard, .. } => Some(shard),
            Error::SchemaMismatch(m) => Some(&m.shard),
            Error::PartialRead { shard, .. } => Some(shard),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }
}
