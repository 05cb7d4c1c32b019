//! Fan-out dispatcher (§4.5).
//!
//! Grounded on `backend/pool/connection/multi_shard/mod.rs`'s use of
//! `tokio::spawn` + `JoinSet`-style fan-out across shard connections;
//! generalized here to launch one executor task per shard, wait for all of
//! them, and classify the aggregate the way `Task.WhenAll` classification
//! in §4.5 describes: any genuine failure under
//! [`ExecutionPolicy::Complete`] cancels the rest and aborts the whole
//! command; otherwise the merged reader is built from whatever came back.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::cancellation::CancellationManager;
use crate::client::ShardClient;
use crate::endpoint::ShardEndpoint;
use crate::error::Error;
use crate::executor::{self, ExecutorContext};
use crate::reader::{LabeledReader, MergedReader};
use crate::ExecutionPolicy;

/// Fans `run_shard` out across every endpoint, waits for all of them, and
/// either returns a fully constructed [`MergedReader`] or propagates the
/// first disqualifying failure (§4.5).
///
/// On the abort path every sibling task still in flight is cancelled via
/// the shared [`CancellationManager`] and its reader (if any) is closed
/// before the error is returned, so no shard connection leaks past a failed
/// dispatch (§4.5 "terminating readers on abort").
pub async fn dispatch<C: ShardClient>(
    shards: Vec<ShardEndpoint>,
    ctx: Arc<ExecutorContext<C>>,
    cancellation: Arc<CancellationManager>,
    include_shard_name: bool,
) -> Result<MergedReader<C>, Error> {
    let policy = ctx.policy;
    let shard_count = shards.len();
    let mut tasks = JoinSet::new();

    for (index, shard) in shards.into_iter().enumerate() {
        let ctx = ctx.clone();
        let cancellation = cancellation.clone();
        tasks.spawn(async move { (index, executor::run_shard(shard, ctx, cancellation).await) });
    }

    // Tasks are tagged with their input index and slotted back into place
    // here because `JoinSet::join_next` resolves in completion order, not
    // spawn order; the merged reader's queue must come out in the shard
    // list's order regardless of which shard answers first (§5).
    let mut slots: Vec<Option<LabeledReader<C>>> = (0..shard_count).map(|_| None).collect();
    let mut dispatch_error = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(outcome))) => slots[index] = Some(outcome),
            Ok((_index, Err(err))) => {
                // Only reachable under `Complete` (`run_shard` never
                // returns `Err` under `Partial`, per §4.4 step 6).
                debug_assert!(matches!(policy, ExecutionPolicy::Complete));
                if dispatch_error.is_none() {
                    dispatch_error = Some(err);
                    cancellation.trigger_completeness();
                }
            }
            Err(join_err) => {
                if dispatch_error.is_none() {
                    dispatch_error = Some(Error::shard_execution(
                        ShardEndpoint::new("unknown", "unknown"),
                        JoinFailure(join_err.to_string()),
                    ));
                    cancellation.trigger_completeness();
                }
            }
        }
    }

    if let Some(err) = dispatch_error {
        for outcome in slots.into_iter().flatten() {
            if let LabeledReader::Ready(mut ready) = outcome {
                ready.cancel().await;
                ready.close().await;
            }
        }
        return Err(err);
    }

    let labeled: Vec<_> = slots.into_iter().flatten().collect();
    MergedReader::new(policy, labeled, include_shard_name).await
}

#[derive(Debug, thiserror::Error)]
#[error("shard task panicked or was aborted: {0}")]
struct JoinFailure(String);

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::CommandTemplate;
    use crate::client::ReadBehavior;
    use crate::endpoint::ConnectionTemplate;
    use crate::events::EventBroadcaster;
    use crate::retry::{RetryConfig, RetryPolicy};
    use crate::testing::{FakeClient, FakeError};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn context(client: FakeClient, policy: ExecutionPolicy) -> Arc<ExecutorContext<FakeClient>> {
        Arc::new(ExecutorContext {
            client: Arc::new(client),
            template: CommandTemplate::new("select 1"),
            behavior: ReadBehavior::default(),
            policy,
            connect_retry: RetryPolicy::new(RetryConfig::no_retry()),
            execute_retry: RetryPolicy::new(RetryConfig::no_retry()),
            is_transient: Arc::new(|_: &FakeError| false),
            events: Arc::new(EventBroadcaster::new()),
            connection_template: ConnectionTemplate::new(),
        })
    }

    #[tokio::test]
    async fn partial_policy_merges_despite_one_shard_failing_to_open() {
        let failing = context(FakeClient::with_open_error(FakeError("boom".into())), ExecutionPolicy::Partial);
        let healthy = context(FakeClient::new(), ExecutionPolicy::Partial);
        let cancellation = Arc::new(CancellationManager::new(CancellationToken::new(), false, Duration::ZERO));

        let mut tasks = JoinSet::new();
        tasks.spawn(executor::run_shard(ShardEndpoint::new("a", "db"), failing, cancellation.clone()));
        tasks.spawn(executor::run_shard(ShardEndpoint::new("b", "db"), healthy, cancellation.clone()));

        let mut labeled = Vec::new();
        while let Some(r) = tasks.join_next().await {
            labeled.push(r.unwrap().unwrap());
        }

        let merged = MergedReader::new(ExecutionPolicy::Partial, labeled, false).await.unwrap();
        let exceptions = merged.multi_shard_exceptions().await;
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].0, ShardEndpoint::new("a", "db"));
    }

    #[tokio::test]
    async fn merges_readers_in_shard_list_order_regardless_of_completion_order() {
        use crate::value::Value;

        let client = FakeClient::new()
            .with_open_delay_for("a", Duration::from_millis(20))
            .with_rows(1, vec![vec![Value::Integer(1)]]);
        let ctx = context(client, ExecutionPolicy::Complete);
        let cancellation = Arc::new(CancellationManager::new(CancellationToken::new(), true, Duration::ZERO));

        // "a" is listed first but opens slower than "b", so it completes
        // second; the merged order must still follow the shard list, not
        // completion order (§5, §8 scenario 1).
        let merged = dispatch(
            vec![ShardEndpoint::new("a", "db"), ShardEndpoint::new("b", "db")],
            ctx,
            cancellation,
            true,
        )
        .await
        .unwrap();

        let mut shard_order = Vec::new();
        while merged.read().await.unwrap() {
            shard_order.push(merged.get_string(1).await.unwrap());
        }
        assert_eq!(shard_order, vec!["a/db".to_string(), "b/db".to_string()]);
    }

    #[tokio::test]
    async fn complete_policy_aborts_on_first_shard_failure() {
        let ctx = context(FakeClient::with_open_error(FakeError("boom".into())), ExecutionPolicy::Complete);
        let cancellation = Arc::new(CancellationManager::new(CancellationToken::new(), true, Duration::ZERO));

        let result = dispatch(
            vec![ShardEndpoint::new("a", "db"), ShardEndpoint::new("b", "db")],
            ctx,
            cancellation.clone(),
            false,
        )
        .await;

        assert!(result.is_err());
        assert!(cancellation.is_cancelled());
    }
}
