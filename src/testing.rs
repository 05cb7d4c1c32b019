//! In-memory fake shard client for tests (ambient test tooling).
//!
//! Grounded on the teacher's habit of standing up a minimal in-process
//! double rather than a live backend for unit tests (e.g.
//! `backend/pool/connection/multi_shard` tests construct fixtures rather
//! than opening real sockets); this plays back a scripted set of rows and
//! optional scripted failures so `reader`/`executor`/`dispatcher` tests
//! don't need a real [`crate::client::ShardClient`] implementation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{ReadBehavior, RowReader, ShardClient};
use crate::command::CommandTemplate;
use crate::endpoint::ShardEndpoint;
use crate::schema::SchemaTable;
use crate::value::Value;

#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
pub struct FakeError(pub String);

impl FakeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        FakeError(format!("transient: {}", msg.into()))
    }

    pub fn is_transient(&self) -> bool {
        self.0.starts_with("transient:")
    }
}

/// A client whose behavior per call is entirely scripted ahead of time.
#[derive(Default)]
pub struct FakeClient {
    pub open_error: Option<FakeError>,
    pub execute_error: Option<FakeError>,
    open_delay_by_shard: HashMap<String, Duration>,
    rows: Option<Vec<Vec<Value>>>,
    field_count: usize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_error(error: FakeError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_execute_error(error: FakeError) -> Self {
        Self {
            execute_error: Some(error),
            ..Self::default()
        }
    }

    /// Delays `open()` for the named data source only, so a test can make
    /// one shard finish later than another without affecting the rest.
    pub fn with_open_delay_for(mut self, data_source: impl Into<String>, delay: Duration) -> Self {
        self.open_delay_by_shard.insert(data_source.into(), delay);
        self
    }

    /// Every shard dispatched against this client returns these same rows.
    pub fn with_rows(mut self, field_count: usize, rows: Vec<Vec<Value>>) -> Self {
        self.field_count = field_count;
        self.rows = Some(rows);
        self
    }
}

#[async_trait]
impl ShardClient for FakeClient {
    type Connection = ();
    type Command = ();
    type RowReader = FakeRowReader;
    type Error = FakeError;

    async fn open(
        &self,
        endpoint: &ShardEndpoint,
        _options: &[(String, String)],
        _token: &CancellationToken,
    ) -> Result<(), FakeError> {
        if let Some(delay) = self.open_delay_by_shard.get(endpoint.data_source()) {
            tokio::time::sleep(*delay).await;
        }
        match &self.open_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn clone_command(&self, _template: &CommandTemplate, _connection: &()) -> Result<(), FakeError> {
        Ok(())
    }

    async fn execute_reader(
        &self,
        _command: &mut (),
        _behavior: ReadBehavior,
        _token: &CancellationToken,
    ) -> Result<(FakeRowReader, Option<SchemaTable>), FakeError> {
        match &self.execute_error {
            Some(err) => Err(err.clone()),
            None => {
                let reader = match &self.rows {
                    Some(rows) => FakeRowReaderBuilder::new(self.field_count).with_rows(rows.clone()).build(),
                    None => FakeRowReader::default(),
                };
                Ok((reader, None))
            }
        }
    }

    async fn cancel(&self, _command: &()) {}

    async fn close_reader(&self, _reader: FakeRowReader) {}

    async fn close_connection(&self, _connection: ()) {}

    fn is_transient(&self, err: &FakeError) -> bool {
        err.is_transient()
    }
}

/// A row reader that plays back a fixed list of rows, optionally failing
/// once a configured number of rows have been read.
#[derive(Default)]
pub struct FakeRowReader {
    field_count: usize,
    rows: VecDeque<Vec<Value>>,
    fail_after: Option<usize>,
    read_count: usize,
    current: Option<Vec<Value>>,
    has_rows: bool,
}

#[async_trait]
impl RowReader<FakeError> for FakeRowReader {
    async fn read(&mut self) -> Result<bool, FakeError> {
        if let Some(limit) = self.fail_after {
            if self.read_count >= limit {
                return Err(FakeError("simulated mid-iteration read failure".into()));
            }
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.read_count += 1;
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn get_value(&self, ordinal: usize) -> Option<Value> {
        self.current.as_ref().and_then(|row| row.get(ordinal).cloned())
    }

    fn field_count(&self) -> usize {
        self.field_count
    }

    fn has_rows(&self) -> bool {
        self.has_rows
    }

    async fn has_next_result(&mut self) -> Result<bool, FakeError> {
        Ok(false)
    }
}

pub struct FakeRowReaderBuilder {
    field_count: usize,
    rows: Vec<Vec<Value>>,
    fail_after: Option<usize>,
}

impl FakeRowReaderBuilder {
    pub fn new(field_count: usize) -> Self {
        Self {
            field_count,
            rows: Vec::new(),
            fail_after: None,
        }
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        self.rows = rows;
        self
    }

    /// Fails `read()` once `n` rows have already been successfully read.
    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn build(self) -> FakeRowReader {
        let has_rows = !self.rows.is_empty();
        FakeRowReader {
            field_count: self.field_count,
            rows: self.rows.into(),
            fail_after: self.fail_after,
            read_count: 0,
            current: None,
            has_rows,
        }
    }
}
