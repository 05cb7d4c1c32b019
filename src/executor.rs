//! Per-shard executor (§4.4).
//!
//! Grounded on `backend/server/connection.rs`'s connect-then-query sequence
//! and `backend/pool/healthcheck.rs`'s retry-wrapped single operation;
//! generalized here into the full open-under-retry, execute-under-retry,
//! event-narrated lifecycle for one shard, with policy-aware failure
//! handling (§4.4 step 6).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::cancellation::CancellationManager;
use crate::client::{ReadBehavior, ShardClient};
use crate::command::CommandTemplate;
use crate::endpoint::{ConnectionTemplate, ShardEndpoint};
use crate::error::Error;
use crate::events::{EventBroadcaster, ShardEvent};
use crate::reader::{LabeledReader, ReadyReader};
use crate::retry::RetryPolicy;
use crate::ExecutionPolicy;

/// Everything one shard's execution needs that doesn't vary per shard. The
/// per-shard connection options are derived from `connection_template` at
/// dispatch time (§3 "Per-shard connection"), not precomputed here, since
/// `data_source`/`database` differ per shard.
pub struct ExecutorContext<C: ShardClient> {
    pub client: Arc<C>,
    pub template: CommandTemplate,
    pub behavior: ReadBehavior,
    pub policy: ExecutionPolicy,
    pub connect_retry: RetryPolicy,
    pub execute_retry: RetryPolicy,
    pub is_transient: Arc<dyn Fn(&C::Error) -> bool + Send + Sync>,
    pub events: Arc<EventBroadcaster>,
    pub connection_template: ConnectionTemplate,
}

/// Runs one shard end to end: open (under retry), execute (under retry),
/// narrate lifecycle events, and decide the labeled outcome (§4.4 step 6).
///
/// Under [`ExecutionPolicy::Complete`] a genuine failure or cancellation is
/// returned as `Err`, which the dispatcher treats as cause to cancel every
/// sibling shard. Under [`ExecutionPolicy::Partial`] every outcome —
/// success, cancellation, or failure — becomes `Ok`, carried either as
/// [`LabeledReader::Ready`] or [`LabeledReader::Failed`], so one shard's
/// trouble never keeps the others from reporting their rows.
pub async fn run_shard<C: ShardClient>(
    shard: ShardEndpoint,
    ctx: Arc<ExecutorContext<C>>,
    cancellation: Arc<CancellationManager>,
) -> Result<LabeledReader<C>, Error> {
    let span = info_span!("shard_execution", shard = %shard);
    async move {
        // `RetryPolicy`/`ShardClient` operate on a concrete `CancellationToken`,
        // while the derived signal (§4.3) is a `select!` over four unrelated
        // sources. Bridge the two with a short-lived task that cancels
        // `bridge` as soon as the derived signal fires.
        let bridge = CancellationToken::new();
        let bridge_task = {
            let cancellation = cancellation.clone();
            let bridge = bridge.clone();
            tokio::spawn(async move {
                cancellation.cancelled().await;
                bridge.cancel();
            })
        };

        let outcome = execute_once(&shard, &ctx, &bridge).await;
        bridge_task.abort();

        // A handler failure on `reader-returned`/`succeeded` is routed
        // through the same failure path as any other shard error (§4.4,
        // §9 "Event handlers causing failures") rather than unwinding this
        // task, so a just-opened reader is closed before the error
        // propagates.
        let outcome = match outcome {
            Ok((connection, command, reader, schema)) => {
                let mut ready = ReadyReader::new(shard.clone(), ctx.client.clone(), connection, command, reader, schema);
                match emit_success_events(&ctx, &shard) {
                    Ok(()) => Ok(ready),
                    Err(err) => {
                        ready.cancel().await;
                        ready.close().await;
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(ready) => Ok(LabeledReader::Ready(ready)),
            Err(err) => {
                let err = if bridge.is_cancelled() && !err.is_cancelled() {
                    // The bridged token fired mid-attempt; report the
                    // manager's own classification (timeout vs. plain
                    // cancellation) rather than whatever the client
                    // surfaced as a consequence.
                    cancellation.cancellation_error()
                } else {
                    err
                };

                if err.is_cancelled() {
                    let _ = ctx.events.emit(ShardEvent::Cancelled(shard.clone()));
                } else {
                    let _ = ctx
                        .events
                        .emit(ShardEvent::Faulted(shard.clone(), Arc::new(clone_for_event(&shard, &err))));
                }

                match ctx.policy {
                    ExecutionPolicy::Complete => {
                        if !err.is_cancelled() {
                            cancellation.trigger_completeness();
                        }
                        Err(err)
                    }
                    ExecutionPolicy::Partial => Ok(LabeledReader::Failed { shard, error: err }),
                }
            }
        }
    }
    .instrument(span)
    .await
}

fn emit_success_events<C: ShardClient>(ctx: &ExecutorContext<C>, shard: &ShardEndpoint) -> Result<(), Error> {
    ctx.events
        .emit(ShardEvent::ReaderReturned(shard.clone()))
        .map_err(|e| Error::shard_execution(shard.clone(), e))?;
    ctx.events
        .emit(ShardEvent::Succeeded(shard.clone()))
        .map_err(|e| Error::shard_execution(shard.clone(), e))
}

type OpenedExecution<C> = (
    <C as ShardClient>::Connection,
    <C as ShardClient>::Command,
    <C as ShardClient>::RowReader,
    Option<crate::schema::SchemaTable>,
);

async fn execute_once<C: ShardClient>(
    shard: &ShardEndpoint,
    ctx: &ExecutorContext<C>,
    token: &CancellationToken,
) -> Result<OpenedExecution<C>, Error> {
    ctx.events
        .emit(ShardEvent::Began(shard.clone()))
        .map_err(|e| Error::shard_execution(shard.clone(), e))?;

    ctx.behavior.validate()?;

    let is_transient = ctx.is_transient.clone();
    let options = ctx.connection_template.for_shard(shard);

    let connection = ctx
        .connect_retry
        .execute(token, |e: &C::Error| is_transient(e), || {
            ctx.client.open(shard, &options, token)
        })
        .await
        .map_err(|e| Error::shard_execution(shard.clone(), e))?;

    // A freshly cloned command per attempt avoids retrying on a command left
    // in an inconsistent state by a prior failed attempt (§4.4 "state
    // residue").
    let attempt_result = ctx
        .execute_retry
        .execute(token, |e: &C::Error| is_transient(e), || {
            let template = ctx.template.clone_for_dispatch();
            let connection = &connection;
            let behavior = ctx.behavior;
            async move {
                let mut command = ctx.client.clone_command(&template, connection).await?;
                let (reader, schema) = ctx.client.execute_reader(&mut command, behavior, token).await?;
                Ok::<_, C::Error>((command, reader, schema))
            }
        })
        .await;

    match attempt_result {
        Ok((command, reader, schema)) => Ok((connection, command, reader, schema)),
        Err(e) => {
            ctx.client.close_connection(connection).await;
            Err(Error::shard_execution(shard.clone(), e))
        }
    }
}

/// `Error` doesn't implement `Clone` (client errors are type-erased trait
/// objects), so event payloads get a re-rendered copy scoped to this
/// executor's shard rather than the original error value.
fn clone_for_event(shard: &ShardEndpoint, error: &Error) -> Error {
    Error::shard_execution(shard.clone(), EventRenderedError(error.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct EventRenderedError(String);

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::events::{EventHandlerError, FnEventSink};
    use crate::retry::RetryConfig;
    use crate::testing::{FakeClient, FakeError};

    fn context(client: FakeClient, policy: ExecutionPolicy, events: Arc<EventBroadcaster>) -> Arc<ExecutorContext<FakeClient>> {
        Arc::new(ExecutorContext {
            client: Arc::new(client),
            template: CommandTemplate::new("select 1"),
            behavior: ReadBehavior::default(),
            policy,
            connect_retry: RetryPolicy::new(RetryConfig::no_retry()),
            execute_retry: RetryPolicy::new(RetryConfig::no_retry()),
            is_transient: Arc::new(|_: &FakeError| false),
            events,
            connection_template: ConnectionTemplate::new(),
        })
    }

    fn manager() -> Arc<CancellationManager> {
        Arc::new(CancellationManager::new(CancellationToken::new(), false, Duration::ZERO))
    }

    fn manager_with_completeness() -> Arc<CancellationManager> {
        Arc::new(CancellationManager::new(CancellationToken::new(), true, Duration::ZERO))
    }

    #[tokio::test]
    async fn success_path_emits_began_reader_returned_and_succeeded_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events = Arc::new(EventBroadcaster::new());
        events.subscribe(Arc::new(FnEventSink({
            let seen = seen.clone();
            move |event: &ShardEvent| {
                seen.lock().unwrap().push(format!("{event:?}"));
                Ok(())
            }
        })));

        let ctx = context(FakeClient::new(), ExecutionPolicy::Complete, events);
        let shard = ShardEndpoint::new("a", "db");
        let outcome = run_shard(shard, ctx, manager()).await.unwrap();

        assert!(matches!(outcome, LabeledReader::Ready(_)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].starts_with("Began"));
        assert!(seen[1].starts_with("ReaderReturned"));
        assert!(seen[2].starts_with("Succeeded"));
    }

    #[tokio::test]
    async fn failing_handler_on_succeeded_turns_a_healthy_shard_into_a_failure() {
        let events = Arc::new(EventBroadcaster::new());
        events.subscribe(Arc::new(FnEventSink(|event: &ShardEvent| match event {
            ShardEvent::Succeeded(_) => Err(EventHandlerError("handler boom".into())),
            _ => Ok(()),
        })));

        let ctx = context(FakeClient::new(), ExecutionPolicy::Partial, events);
        let shard = ShardEndpoint::new("a", "db");
        let outcome = run_shard(shard.clone(), ctx, manager()).await.unwrap();

        match outcome {
            LabeledReader::Failed { shard: failed, .. } => assert_eq!(failed, shard),
            LabeledReader::Ready(_) => panic!("expected the handler failure to fail the shard"),
        }
    }

    #[tokio::test]
    async fn failing_handler_under_complete_aborts_with_err() {
        let events = Arc::new(EventBroadcaster::new());
        events.subscribe(Arc::new(FnEventSink(|event: &ShardEvent| match event {
            ShardEvent::Began(_) => Err(EventHandlerError("refuses to start".into())),
            _ => Ok(()),
        })));

        let ctx = context(FakeClient::new(), ExecutionPolicy::Complete, events);
        let cancellation = manager_with_completeness();
        let result = run_shard(ShardEndpoint::new("a", "db"), ctx, cancellation.clone()).await;

        assert!(result.is_err());
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn open_failure_under_partial_is_a_labeled_failure_not_an_err() {
        let ctx = context(
            FakeClient::with_open_error(FakeError("connection refused".into())),
            ExecutionPolicy::Partial,
            Arc::new(EventBroadcaster::new()),
        );
        let shard = ShardEndpoint::new("a", "db");
        let outcome = run_shard(shard.clone(), ctx, manager()).await.unwrap();

        match outcome {
            LabeledReader::Failed { shard: failed, .. } => assert_eq!(failed, shard),
            LabeledReader::Ready(_) => panic!("expected a failed labeled reader"),
        }
    }
}
