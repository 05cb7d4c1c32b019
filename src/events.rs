//! Lifecycle events emitted by per-shard execution (§4.4, §4.8, §6).
//!
//! Grounded on `backend/pool/connection/multi_shard/mod.rs`'s `forward`
//! state machine, which likewise narrates one shard's lifecycle
//! (row-description seen, command complete, ready-for-query) as discrete
//! steps an outside observer can react to.

use std::sync::Arc;

use crate::endpoint::ShardEndpoint;

/// One per-shard lifecycle event (§4.8 `began`/`succeeded`/`faulted`/
/// `cancelled`, §4.4 internal `reader-returned`).
#[derive(Debug, Clone)]
pub enum ShardEvent {
    Began(ShardEndpoint),
    /// Internal event (§4.4 step 4): fired synchronously once the reader
    /// has been obtained, before it is handed to the dispatcher.
    ReaderReturned(ShardEndpoint),
    Succeeded(ShardEndpoint),
    Faulted(ShardEndpoint, Arc<crate::error::Error>),
    Cancelled(ShardEndpoint),
}

impl ShardEvent {
    pub fn shard(&self) -> &ShardEndpoint {
        match self {
            ShardEvent::Began(s)
            | ShardEvent::ReaderReturned(s)
            | ShardEvent::Succeeded(s)
            | ShardEvent::Faulted(s, _)
            | ShardEvent::Cancelled(s) => s,
        }
    }
}

/// An error raised by an event handler. The executor wraps this into a
/// shard-scoped [`crate::error::Error`] and treats it as a command failure
/// for that shard (§4.4 "Events"), rather than unwinding the worker task —
/// handlers run on the executor's own task and must not be allowed to take
/// it down via a panic-shaped control flow.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EventHandlerError(pub String);

/// Receives lifecycle events. Handlers run inline on the per-shard
/// executor's task (§4.4 "all event handlers run on the executor's
/// thread").
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ShardEvent) -> Result<(), EventHandlerError>;
}

/// Discards every event. The default sink when a caller doesn't care.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn on_event(&self, _event: &ShardEvent) -> Result<(), EventHandlerError> {
        Ok(())
    }
}

/// Adapts a plain closure into an [`EventSink`].
pub struct FnEventSink<F>(pub F)
where
    F: Fn(&ShardEvent) -> Result<(), EventHandlerError> + Send + Sync;

impl<F> EventSink for FnEventSink<F>
where
    F: Fn(&ShardEvent) -> Result<(), EventHandlerError> + Send + Sync,
{
    fn on_event(&self, event: &ShardEvent) -> Result<(), EventHandlerError> {
        (self.0)(event)
    }
}

/// Broadcasts to every registered sink, continuing even if one fails so a
/// later subscriber still hears about the event; the first failure is
/// still what gets returned to the executor.
#[derive(Default)]
pub struct EventBroadcaster {
    sinks: parking_lot::RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn emit(&self, event: ShardEvent) -> Result<(), EventHandlerError> {
        let sinks = self.sinks.read();
        let mut first_error = None;
        for sink in sinks.iter() {
            if let Err(e) = sink.on_event(&event) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn broadcaster_calls_every_sink() {
        let broadcaster = EventBroadcaster::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            broadcaster.subscribe(Arc::new(FnEventSink(move |_event: &ShardEvent| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })));
        }

        broadcaster
            .emit(ShardEvent::Began(ShardEndpoint::new("a", "db")))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn broadcaster_surfaces_handler_failure() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.subscribe(Arc::new(FnEventSink(|_event: &ShardEvent| {
            Err(EventHandlerError("boom".into()))
        })));
        let err = broadcaster
            .emit(ShardEvent::Began(ShardEndpoint::new("a", "db")))
            .unwrap_err();
        assert_eq!(err.0, "boom");
    }
}
