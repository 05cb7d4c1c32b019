//! Labeled readers and the merged forward-only reader (§3, §4.7).
//!
//! Grounded on `backend/pool/connection/multi_shard/mod.rs`: a state
//! machine that owns per-shard resources and reconciles them into one
//! client-visible stream, here generalized from "one PostgreSQL wire
//! connection's messages" to "N labeled readers, concatenated."

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::{RowReader, ShardClient};
use crate::endpoint::ShardEndpoint;
use crate::error::{Error, InternalKind, InvalidStateKind};
use crate::schema::SchemaTable;
use crate::value::Value;
use crate::ExecutionPolicy;

/// The union described in §3: either a successful per-shard reader, owning
/// its connection, command and row reader, or a shard-scoped failure with
/// no reader at all. Reading rows from the failure case is a programmer
/// error the dispatcher must never allow (§3 invariants) — there is no
/// `read()` method on the `Failed` arm to make that statically impossible.
pub enum LabeledReader<C: ShardClient> {
    Ready(ReadyReader<C>),
    Failed { shard: ShardEndpoint, error: Error },
}

impl<C: ShardClient> LabeledReader<C> {
    pub fn shard(&self) -> &ShardEndpoint {
        match self {
            LabeledReader::Ready(r) => &r.shard,
            LabeledReader::Failed { shard, .. } => shard,
        }
    }
}

/// The successful arm of [`LabeledReader`]: a row reader plus the command
/// and connection that produced it, exclusively owned from construction
/// until [`ReadyReader::close`] (§3 "Owns its row reader and command;
/// disposing it closes both. At-most-once disposal.").
pub struct ReadyReader<C: ShardClient> {
    pub shard: ShardEndpoint,
    client: Arc<C>,
    connection: Option<C::Connection>,
    command: Option<C::Command>,
    reader: Option<C::RowReader>,
    schema: Option<SchemaTable>,
    has_rows: bool,
    closed: bool,
}

impl<C: ShardClient> ReadyReader<C> {
    pub fn new(
        shard: ShardEndpoint,
        client: Arc<C>,
        connection: C::Connection,
        command: C::Command,
        reader: C::RowReader,
        schema: Option<SchemaTable>,
    ) -> Self {
        let has_rows = reader.has_rows();
        Self {
            shard,
            client,
            connection: Some(connection),
            command: Some(command),
            reader: Some(reader),
            schema,
            has_rows,
            closed: false,
        }
    }

    pub fn schema(&self) -> Option<&SchemaTable> {
        self.schema.as_ref()
    }

    pub fn has_rows(&self) -> bool {
        self.has_rows
    }

    async fn read(&mut self) -> Result<bool, Error> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Internal(InternalKind::MissingCurrentReader))?;
        reader
            .read()
            .await
            .map_err(|e| Error::partial_read(self.shard.clone(), e))
    }

    fn get_value(&self, ordinal: usize) -> Option<Value> {
        self.reader.as_ref().and_then(|r| r.get_value(ordinal))
    }

    fn get_values(&self, buf: &mut [Value]) -> usize {
        self.reader.as_ref().map(|r| r.get_values(buf)).unwrap_or(0)
    }

    fn field_count(&self) -> usize {
        self.reader.as_ref().map(|r| r.field_count()).unwrap_or(0)
    }

    async fn has_next_result(&mut self) -> Result<bool, Error> {
        match self.reader.as_mut() {
            Some(r) => r
                .has_next_result()
                .await
                .map_err(|e| Error::partial_read(self.shard.clone(), e)),
            None => Ok(false),
        }
    }

    /// Best-effort cancellation of the in-flight command, swallowing any
    /// error (§4.5 "cancel its command then close its reader, swallowing
    /// any exception").
    pub async fn cancel(&self) {
        if let Some(command) = &self.command {
            self.client.cancel(command).await;
        }
    }

    /// Idempotent close: releases the reader and connection exactly once
    /// (§3, §4.7 `close()`).
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.command = None;
        if let Some(reader) = self.reader.take() {
            self.client.close_reader(reader).await;
        }
        if let Some(connection) = self.connection.take() {
            self.client.close_connection(connection).await;
        }
    }
}

/// State internal to [`MergedReader`], guarded by a single async mutex
/// (§5 "the merged reader's queue and counters are guarded by a single
/// internal monitor").
struct MergedReaderInner<C: ShardClient> {
    queue: VecDeque<ReadyReader<C>>,
    added: usize,
    finished: usize,
    exceptions: Vec<(ShardEndpoint, Error)>,
    closed: bool,
    disposed: bool,
}

/// Presents the per-shard readers as a single forward-only cursor (§4.7).
///
/// Schema template and synthetic-column configuration are frozen at
/// construction and never mutate (§3 invariant: "schema template, once
/// set, is immutable for the life of the merged reader"), so they live
/// outside the mutex; everything that changes while iterating — the
/// queue, the counters, the collected exceptions — lives inside it.
pub struct MergedReader<C: ShardClient> {
    inner: Mutex<MergedReaderInner<C>>,
    policy: ExecutionPolicy,
    expected: usize,
    has_rows: bool,
    final_schema: SchemaTable,
    include_shard_name: bool,
}

impl<C: ShardClient> MergedReader<C> {
    /// Constructs the merged reader over the set of labeled readers
    /// produced by the dispatcher (§4.5 "Parent succeeded" branch).
    ///
    /// Runs the schema validator sequentially over the collected readers
    /// (§4.6): under [`ExecutionPolicy::Complete`] a mismatch aborts the
    /// whole construction (after closing every reader already accepted);
    /// under [`ExecutionPolicy::Partial`] the offending reader is
    /// cancelled, closed and folded into `multi_shard_exceptions` instead.
    pub async fn new(
        policy: ExecutionPolicy,
        labeled_readers: Vec<LabeledReader<C>>,
        include_shard_name: bool,
    ) -> Result<Self, Error> {
        let expected = labeled_readers.len();
        let mut validator = crate::schema::SchemaValidator::new();
        let mut queue = VecDeque::new();
        let mut exceptions = Vec::new();
        let mut has_rows = false;

        for labeled in labeled_readers {
            match labeled {
                LabeledReader::Failed { shard, error } => match policy {
                    // The dispatcher never hands `Complete` a failure-case
                    // labeled reader — a shard failure under `Complete`
                    // propagates as `Err` before `MergedReader::new` is ever
                    // called (§4.5). Seeing one here means that invariant
                    // broke, not a normal per-shard failure to tolerate.
                    ExecutionPolicy::Complete => {
                        for mut remaining in queue {
                            remaining.cancel().await;
                            remaining.close().await;
                        }
                        return Err(InternalKind::AllShardsFailedUnderComplete.into());
                    }
                    ExecutionPolicy::Partial => {
                        exceptions.push((shard, error));
                    }
                },
                LabeledReader::Ready(mut ready) => {
                    match validator.validate(&ready.shard, ready.schema()) {
                        Ok(()) => {
                            has_rows |= ready.has_rows();
                            queue.push_back(ready);
                        }
                        Err(err) => match policy {
                            ExecutionPolicy::Complete => {
                                ready.cancel().await;
                                ready.close().await;
                                for mut remaining in queue {
                                    remaining.cancel().await;
                                    remaining.close().await;
                                }
                                return Err(err);
                            }
                            ExecutionPolicy::Partial => {
                                let shard = ready.shard.clone();
                                ready.cancel().await;
                                ready.close().await;
                                exceptions.push((shard, err));
                            }
                        },
                    }
                }
            }
        }

        // Even if every shard failed, `Partial` never fails the whole
        // command on a per-shard error (§2): the result is a merged reader
        // with zero rows and every failure visible via
        // `multi_shard_exceptions`, not a top-level `Err`.
        let added = queue.len() + exceptions.len();
        let ground_truth = validator.ground_truth().cloned().unwrap_or_default();
        let final_schema = if include_shard_name {
            ground_truth.with_synthetic_column()
        } else {
            ground_truth
        };
        let closed = queue.is_empty();

        Ok(Self {
            inner: Mutex::new(MergedReaderInner {
                queue,
                added,
                finished: 0,
                exceptions,
                closed,
                disposed: false,
            }),
            policy,
            expected,
            has_rows,
            final_schema,
            include_shard_name,
        })
    }

    fn synthetic_ordinal(&self) -> usize {
        self.final_schema.len() - 1
    }

    pub fn field_count(&self) -> usize {
        self.final_schema.len()
    }

    pub fn visible_field_count(&self) -> usize {
        self.final_schema.len()
    }

    pub fn has_rows(&self) -> bool {
        self.has_rows
    }

    pub fn schema_table(&self) -> &SchemaTable {
        &self.final_schema
    }

    pub async fn multi_shard_exceptions(&self) -> Vec<(ShardEndpoint, Error)> {
        let inner = self.inner.lock().await;
        inner
            .exceptions
            .iter()
            .map(|(shard, error)| (shard.clone(), clone_error_for_report(shard, error)))
            .collect()
    }

    /// Advances one row (§4.7 `read()`). Never skips rows; pops an
    /// exhausted head and advances to the next, traversing empty heads as
    /// needed. Under [`ExecutionPolicy::Partial`] a mid-iteration row-read
    /// failure is folded into `multi_shard_exceptions` and iteration
    /// continues with the next shard; under [`ExecutionPolicy::Complete`]
    /// it propagates.
    pub async fn read(&self) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::InvalidState(InvalidStateKind::ReaderClosed));
        }
        loop {
            let Some(front) = inner.queue.front_mut() else {
                return Ok(false);
            };
            match front.read().await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    let mut exhausted = inner.queue.pop_front().expect("front just matched");
                    inner.finished += 1;
                    exhausted.close().await;
                }
                Err(err) => match self.policy {
                    ExecutionPolicy::Partial => {
                        let shard = front.shard.clone();
                        let mut failed = inner.queue.pop_front().expect("front just matched");
                        inner.finished += 1;
                        failed.close().await;
                        inner.exceptions.push((shard, err));
                    }
                    ExecutionPolicy::Complete => return Err(err),
                },
            }
        }
    }

    /// Idempotent (§4.7 `close()`): cancels every open reader, then closes
    /// each in queue order. One arbitrary reader — the last remaining —
    /// stays parked at the head, closed, so a later metadata call (e.g. the
    /// synthetic shard-name column) still has a well-defined source instead
    /// of finding an empty queue.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        for reader in inner.queue.iter() {
            reader.cancel().await;
        }
        let last = inner.queue.pop_back();
        while let Some(mut reader) = inner.queue.pop_front() {
            reader.close().await;
        }
        if let Some(mut last) = last {
            last.close().await;
            inner.queue.push_back(last);
        }
    }

    /// Idempotent (§4.7 `dispose()`): implies [`MergedReader::close`].
    pub async fn dispose(&self) {
        self.close().await;
        let mut inner = self.inner.lock().await;
        inner.disposed = true;
    }

    /// §4.7 `get_value`: the synthetic ordinal (when enabled) returns the
    /// current shard's label as text; any other ordinal delegates to the
    /// current reader. Unlike [`MergedReader::read`], this doesn't reject a
    /// closed reader outright — [`MergedReader::close`] leaves one reader
    /// parked at the head precisely so the synthetic column keeps resolving
    /// post-close; a non-synthetic ordinal still errors there since the
    /// closed reader has no row data left to give.
    pub async fn get_value(&self, ordinal: usize) -> Result<Value, Error> {
        let inner = self.inner.lock().await;
        let front = inner
            .queue
            .front()
            .ok_or_else(|| Error::Internal(InternalKind::MissingCurrentReader))?;
        if self.include_shard_name && ordinal == self.synthetic_ordinal() {
            return Ok(Value::Text(front.shard.label()));
        }
        front
            .get_value(ordinal)
            .ok_or_else(|| Error::Internal(InternalKind::MissingCurrentReader))
    }

    /// Typed accessor used for the synthetic column's cast contract: any
    /// request for a non-text value on the synthetic ordinal is an invalid
    /// cast (§4.7 `get_value`).
    pub async fn get_string(&self, ordinal: usize) -> Result<String, Error> {
        match self.get_value(ordinal).await? {
            Value::Text(s) => Ok(s),
            _ => Err(Error::InvalidState(InvalidStateKind::InvalidCast { requested: "string" })),
        }
    }

    pub async fn get_i64(&self, ordinal: usize) -> Result<i64, Error> {
        self.typed_get(ordinal, "i64", Value::as_integer).await
    }

    pub async fn get_f64(&self, ordinal: usize) -> Result<f64, Error> {
        self.typed_get(ordinal, "f64", Value::as_float).await
    }

    pub async fn get_bool(&self, ordinal: usize) -> Result<bool, Error> {
        self.typed_get(ordinal, "bool", Value::as_bool).await
    }

    async fn typed_get<T>(
        &self,
        ordinal: usize,
        requested: &'static str,
        project: impl Fn(&Value) -> Option<T>,
    ) -> Result<T, Error> {
        let value = self.get_value(ordinal).await?;
        project(&value).ok_or(Error::InvalidState(InvalidStateKind::InvalidCast { requested }))
    }

    /// §4.7 `get_values`: fills `buf` from the current reader, then writes
    /// the synthetic column if there's room, incrementing the returned
    /// count. As with [`MergedReader::get_value`], this still works against
    /// the one reader [`MergedReader::close`] leaves parked at the head.
    pub async fn get_values(&self, buf: &mut [Value]) -> Result<usize, Error> {
        let inner = self.inner.lock().await;
        let front = inner
            .queue
            .front()
            .ok_or_else(|| Error::Internal(InternalKind::MissingCurrentReader))?;
        let mut written = front.get_values(buf);
        if self.include_shard_name {
            let synth = self.synthetic_ordinal();
            if synth < buf.len() {
                buf[synth] = Value::Text(front.shard.label());
                written = written.max(synth + 1);
            }
        }
        Ok(written)
    }

    /// §4.7 `next_result()`: always an error if the current reader reports
    /// a further result set (§1 Non-goals, §9 "single-result-set
    /// restriction").
    pub async fn next_result(&self) -> Result<bool, Error> {
        let has_next = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::InvalidState(InvalidStateKind::ReaderClosed));
            }
            match inner.queue.front_mut() {
                Some(front) => front.has_next_result().await?,
                None => false,
            }
        };
        if has_next {
            self.close().await;
            return Err(crate::error::ConfigError::MultipleResultSets.into());
        }
        Ok(false)
    }

    pub fn expected_readers(&self) -> usize {
        self.expected
    }

    pub async fn added_readers(&self) -> usize {
        self.inner.lock().await.added
    }

    pub async fn finished_readers(&self) -> usize {
        self.inner.lock().await.finished
    }
}

/// `Error` doesn't implement `Clone`, so exceptions are reported as a
/// re-rendered copy scoped to the shard they were collected under, rather
/// than the original value.
fn clone_error_for_report(shard: &ShardEndpoint, error: &Error) -> Error {
    Error::shard_execution(shard.clone(), StringError(error.to_string()))
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
struct StringError(String);
