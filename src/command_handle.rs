//! Public entry point (§4.8).
//!
//! Grounded on `backend/pool/connection/mod.rs`'s top-level handle that owns
//! a pooled connection and exposes a query surface over it; here a
//! [`MultiShardConnection`] owns the shard list and connection template, and
//! each [`MultiShardCommand`] built from it owns one command template plus
//! its own single-in-flight execution guard (§4.8, §5).

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cancellation::CancellationManager;
use crate::client::{ReadBehavior, ShardClient};
use crate::command::CommandTemplate;
use crate::dispatcher;
use crate::endpoint::{ConnectionTemplate, ShardEndpoint};
use crate::error::{ConfigError, Error, InvalidStateKind};
use crate::events::{EventBroadcaster, EventSink};
use crate::executor::ExecutorContext;
use crate::reader::MergedReader;
use crate::retry::{self, RetryConfig, RetryPolicy};
use crate::{ExecutionOptions, ExecutionPolicy};

/// Default overall command timeout across every shard (§4.8), independent
/// of [`crate::command::DEFAULT_SHARD_TIMEOUT`] which bounds one shard.
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Owns the shard topology and the connection-level options shared by every
/// command built against it (§3, §4.1).
pub struct MultiShardConnection<C: ShardClient> {
    client: Arc<C>,
    shards: Vec<ShardEndpoint>,
    connection_template: ConnectionTemplate,
}

impl<C: ShardClient> MultiShardConnection<C> {
    /// Validates the shard list isn't empty and the connection template
    /// doesn't pre-set `data_source`/`database` (§6).
    pub fn new(
        client: Arc<C>,
        shards: Vec<ShardEndpoint>,
        connection_template: ConnectionTemplate,
    ) -> Result<Self, Error> {
        if shards.is_empty() {
            return Err(ConfigError::EmptyShardList.into());
        }
        connection_template.validate()?;
        Ok(Self {
            client,
            shards,
            connection_template,
        })
    }

    pub fn shards(&self) -> &[ShardEndpoint] {
        &self.shards
    }

    /// Creates a fresh, not-yet-executed command bound to this connection's
    /// shard topology (§4.8).
    pub fn create_command(&self, template: CommandTemplate) -> MultiShardCommand<C> {
        MultiShardCommand::new(self.client.clone(), self.shards.clone(), self.connection_template.clone(), template)
    }
}

struct InFlight {
    cancellation: Arc<CancellationManager>,
}

/// One SQL command fanned out across every shard (§4.8). Re-executable
/// after a prior execution has finished or been disposed, but only one
/// execution may be in flight at a time (§5).
pub struct MultiShardCommand<C: ShardClient> {
    client: Arc<C>,
    shards: Vec<ShardEndpoint>,
    connection_template: ConnectionTemplate,
    template: CommandTemplate,
    behavior: ReadBehavior,
    policy: ExecutionPolicy,
    options: ExecutionOptions,
    connect_retry: RetryConfig,
    execute_retry: RetryConfig,
    transient_predicate: Option<Arc<dyn Fn(&C::Error) -> bool + Send + Sync>>,
    overall_timeout: Duration,
    events: Arc<EventBroadcaster>,
    in_flight: tokio::sync::Mutex<Option<InFlight>>,
    returned_reader: tokio::sync::Mutex<Option<Weak<MergedReader<C>>>>,
}

impl<C: ShardClient> MultiShardCommand<C> {
    fn new(
        client: Arc<C>,
        shards: Vec<ShardEndpoint>,
        connection_template: ConnectionTemplate,
        template: CommandTemplate,
    ) -> Self {
        Self {
            client,
            shards,
            connection_template,
            template,
            behavior: ReadBehavior::default(),
            policy: ExecutionPolicy::Complete,
            options: ExecutionOptions::default(),
            connect_retry: RetryConfig::default(),
            execute_retry: RetryConfig::default(),
            transient_predicate: None,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            events: Arc::new(EventBroadcaster::new()),
            in_flight: tokio::sync::Mutex::new(None),
            returned_reader: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_connect_retry(mut self, config: RetryConfig) -> Self {
        self.connect_retry = config;
        self
    }

    pub fn with_execute_retry(mut self, config: RetryConfig) -> Self {
        self.execute_retry = config;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Adds a caller-supplied transient-error predicate, unioned with the
    /// client's own [`ShardClient::is_transient`] at execution time (§4.2
    /// "the union of a standard database-transient detector and a
    /// user-supplied predicate").
    pub fn with_transient_predicate(mut self, predicate: Arc<dyn Fn(&C::Error) -> bool + Send + Sync>) -> Self {
        self.transient_predicate = Some(predicate);
        self
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    /// Fans the command out across every shard and merges the results
    /// (§4.4, §4.5). Fails immediately with
    /// [`InvalidStateKind::PendingOperation`] if a previous execution on
    /// this command instance hasn't finished (§4.8, §5).
    ///
    /// The returned reader is `Arc`-wrapped and a weak reference to it is
    /// retained so a later [`MultiShardCommand::cancel`] can still reach it
    /// after it's handed back to the caller (§4.8 "if a reader has already
    /// been returned, it forwards cancellation to that reader").
    pub async fn execute_reader_async(&self, caller_token: CancellationToken) -> Result<Arc<MergedReader<C>>, Error> {
        self.behavior.validate()?;

        let supports_completeness = matches!(self.policy, ExecutionPolicy::Complete);
        let cancellation = Arc::new(CancellationManager::new(caller_token, supports_completeness, self.overall_timeout));

        {
            let mut guard = self.in_flight.lock().await;
            if guard.is_some() {
                return Err(InvalidStateKind::PendingOperation.into());
            }
            *guard = Some(InFlight {
                cancellation: cancellation.clone(),
            });
        }

        let result = self.run_dispatch(cancellation).await;

        *self.in_flight.lock().await = None;

        let reader = Arc::new(result?);
        *self.returned_reader.lock().await = Some(Arc::downgrade(&reader));
        Ok(reader)
    }

    /// Synchronous form of [`MultiShardCommand::execute_reader_async`] (§6):
    /// blocks the calling thread only, not the whole runtime. Has no
    /// external cancellation token to plumb in, matching §6's sync
    /// signature — use `execute_reader_async` plus `cancel()` from another
    /// thread when cooperative cancellation from outside is needed. Must be
    /// called from a thread that isn't itself driving the `tokio` runtime
    /// this command's client runs on — `Handle::block_on` panics if called
    /// from inside an already-running task on that runtime.
    pub fn execute_reader(&self) -> Result<Arc<MergedReader<C>>, Error> {
        tokio::runtime::Handle::current().block_on(self.execute_reader_async(CancellationToken::new()))
    }

    async fn run_dispatch(&self, cancellation: Arc<CancellationManager>) -> Result<MergedReader<C>, Error> {
        let client = self.client.clone();
        let user_predicate = self.transient_predicate.clone();
        let is_transient: Arc<dyn Fn(&C::Error) -> bool + Send + Sync> =
            Arc::new(retry::classifier(move |err: &C::Error| client.is_transient(err), user_predicate));

        let ctx = Arc::new(ExecutorContext {
            client: self.client.clone(),
            template: self.template.clone(),
            behavior: self.behavior,
            policy: self.policy,
            connect_retry: RetryPolicy::new(self.connect_retry),
            execute_retry: RetryPolicy::new(self.execute_retry),
            is_transient,
            events: self.events.clone(),
            connection_template: self.connection_template.clone(),
        });

        dispatcher::dispatch(self.shards.clone(), ctx, cancellation, self.options.include_shard_name).await
    }

    /// Cancels the in-flight execution, if any, and also forwards
    /// cancellation to the most recently returned reader if it's still
    /// alive. Safe to call from any task; a no-op if neither applies (§4.8
    /// `cancel()`).
    pub async fn cancel(&self) {
        if let Some(in_flight) = self.in_flight.lock().await.as_ref() {
            in_flight.cancellation.cancel_command_instance();
        }
        if let Some(reader) = self.returned_reader.lock().await.as_ref().and_then(Weak::upgrade) {
            reader.close().await;
        }
    }

    /// Disposes of the command instance. Idempotent; safe to call whether
    /// or not an execution is in flight (§4.8 `dispose()`).
    pub async fn dispose(&self) {
        self.cancel().await;
    }
}
