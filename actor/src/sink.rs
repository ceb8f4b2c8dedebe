// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Result sinks.
//!
//! A sink is whatever glue started a query: a test harness, another actor, a web handler. It
//! is consumed by the single call it receives, either `ok` or `fail`.

use crate::{
    ActorContext, Error, Value,
    actor::Actor,
    handler::{InboxSender, Work},
};

use tokio::sync::oneshot;
use tracing::debug;

use std::marker::PhantomData;

/// Receiver of the outcome of a query.
pub trait ResultSink: Send + 'static {
    /// Called with the result of a successful query.
    fn ok(self: Box<Self>, value: Value);

    /// Called when the query failed, expired or was cancelled.
    fn fail(self: Box<Self>, error: Error);
}

/// Boxed result sink.
pub type BoxedSink = Box<dyn ResultSink>;

/// Sink calling a closure with the result.
pub struct FnSink<F> {
    callback: F,
}

/// Wraps a closure into a [`ResultSink`].
///
/// The closure runs on whichever task settles the query (the callee's inbox or the expiry
/// timer). Actors that need the result under their own exclusivity use
/// `ActorContext::query` instead.
pub fn sink_fn<F>(callback: F) -> FnSink<F>
where
    F: FnOnce(Result<Value, Error>) + Send + 'static,
{
    FnSink { callback }
}

impl<F> ResultSink for FnSink<F>
where
    F: FnOnce(Result<Value, Error>) + Send + 'static,
{
    fn ok(self: Box<Self>, value: Value) {
        (self.callback)(Ok(value))
    }

    fn fail(self: Box<Self>, error: Error) {
        (self.callback)(Err(error))
    }
}

/// Sink backing `MethodRef::ask`.
pub(crate) struct OneshotSink(pub(crate) oneshot::Sender<Result<Value, Error>>);

impl ResultSink for OneshotSink {
    fn ok(self: Box<Self>, value: Value) {
        let _ = self.0.send(Ok(value));
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.0.send(Err(error));
    }
}

/// Sink that moves the result back onto the calling actor's inbox, so the callback runs
/// with exclusive access to the caller's state.
pub(crate) struct RoutedSink<A, F>
where
    A: Actor,
{
    inbox: InboxSender<A>,
    callback: F,
    _phantom_actor: PhantomData<fn(A)>,
}

impl<A, F> RoutedSink<A, F>
where
    A: Actor,
    F: FnOnce(&mut A, &mut ActorContext<A>, Result<Value, Error>) + Send + 'static,
{
    pub(crate) fn new(inbox: InboxSender<A>, callback: F) -> Self {
        Self {
            inbox,
            callback,
            _phantom_actor: PhantomData,
        }
    }

    fn route(self, result: Result<Value, Error>) {
        let callback = self.callback;
        let completion = Box::new(
            move |actor: &mut A, ctx: &mut ActorContext<A>| {
                callback(actor, ctx, result)
            },
        );
        if self.inbox.send(Work::Completion(completion)).is_err() {
            debug!("Caller inbox is closed, dropping query result.");
        }
    }
}

impl<A, F> ResultSink for RoutedSink<A, F>
where
    A: Actor,
    F: FnOnce(&mut A, &mut ActorContext<A>, Result<Value, Error>) + Send + 'static,
{
    fn ok(self: Box<Self>, value: Value) {
        self.route(Ok(value))
    }

    fn fail(self: Box<Self>, error: Error) {
        self.route(Err(error))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_fn_sink() {
        let (sender, mut receiver) = oneshot::channel();
        let sink: BoxedSink = Box::new(sink_fn(move |result| {
            let _ = sender.send(result);
        }));
        sink.ok(Value::Int(5));
        assert_eq!(receiver.try_recv().unwrap(), Ok(Value::Int(5)));
    }

    #[test]
    fn test_oneshot_sink() {
        let (sender, mut receiver) = oneshot::channel();
        let sink: BoxedSink = Box::new(OneshotSink(sender));
        sink.fail(Error::Cancelled);
        assert_eq!(receiver.try_recv().unwrap(), Err(Error::Cancelled));
    }
}
