// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Query correlation
//!
//! A query pairs an envelope with a result sink and an absolute expiry. Both ends share one
//! `Correlation`: the callee completes it through its `Reply`, the caller's expiry timer and
//! `QueryToken` complete it from the other side, and whichever arrives first takes the sink.
//! Everything arriving later is dropped, so a sink is invoked exactly once.
//!

use crate::{ActorPath, Error, Value, sink::BoxedSink};

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{cell::RefCell, sync::Arc};

thread_local! {
    /// Replies dropped while their thread was unwinding, waiting for the inbox that catches
    /// the panic.
    static UNWOUND: RefCell<Vec<Arc<Correlation>>> = const { RefCell::new(Vec::new()) };
}

/// Fails every reply dropped on this thread by a panic with `Error::Failure`.
pub(crate) fn fail_unwound(path: &ActorPath, reason: &str) -> usize {
    let unwound = UNWOUND
        .try_with(|unwound| std::mem::take(&mut *unwound.borrow_mut()))
        .unwrap_or_default();
    unwound
        .into_iter()
        .filter(|correlation| {
            correlation.complete(Err(Error::Failure(path.clone(), reason.to_owned())))
        })
        .count()
}

pub(crate) struct Correlation {
    /// Taken by the first completion.
    sink: Mutex<Option<BoxedSink>>,
    /// Cancelled once the query is settled; stops the expiry timer.
    settled: CancellationToken,
    target: ActorPath,
    method: String,
}

impl Correlation {
    pub(crate) fn new(target: ActorPath, method: &str, sink: BoxedSink) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(Some(sink)),
            settled: CancellationToken::new(),
            target,
            method: method.to_owned(),
        })
    }

    /// Delivers `result` to the sink unless the query is already settled.
    pub(crate) fn complete(&self, result: Result<Value, Error>) -> bool {
        let sink = self.sink.lock().take();
        match sink {
            Some(sink) => {
                self.settled.cancel();
                match result {
                    Ok(value) => sink.ok(value),
                    Err(error) => sink.fail(error),
                }
                true
            }
            None => {
                debug!(
                    "Dropping late result for query {}:{}.",
                    self.target, self.method
                );
                false
            }
        }
    }

    /// Settles the query without calling the sink.
    pub(crate) fn disarm(&self) {
        self.sink.lock().take();
        self.settled.cancel();
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.is_cancelled()
    }

    pub(crate) fn timeout_error(&self) -> Error {
        Error::Timeout(self.target.clone(), self.method.clone())
    }

    /// Fails the sink with a timeout at `deadline` unless something settles it first.
    pub(crate) fn arm(self: &Arc<Self>, deadline: Instant) {
        let correlation = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = correlation.settled.cancelled() => {}
                _ = sleep_until(deadline) => {
                    if correlation.complete(Err(correlation.timeout_error())) {
                        debug!(
                            "Query {}:{} expired.",
                            correlation.target, correlation.method
                        );
                    }
                }
            }
        });
    }
}

/// Callee side of a query.
///
/// Handlers registered with `MethodTable::deferred` receive the `Reply` and may keep it until
/// the answer is known. A fire-and-forget envelope carries an inert reply. Dropping a reply
/// that a caller waits on fails the caller with `Error::BrokenPromise`.
pub struct Reply {
    correlation: Option<Arc<Correlation>>,
}

impl Reply {
    pub(crate) fn none() -> Self {
        Self { correlation: None }
    }

    pub(crate) fn expecting(correlation: Arc<Correlation>) -> Self {
        Self {
            correlation: Some(correlation),
        }
    }

    /// True when a caller waits for this reply and it has not been settled yet.
    pub fn is_expected(&self) -> bool {
        self.correlation
            .as_ref()
            .is_some_and(|correlation| !correlation.is_settled())
    }

    pub fn ok(self, value: impl Into<Value>) {
        self.complete(Ok(value.into()));
    }

    pub fn fail(self, error: Error) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, result: Result<Value, Error>) {
        if let Some(correlation) = self.correlation.take() {
            correlation.complete(result);
        }
    }

    pub(crate) fn disarm(mut self) {
        if let Some(correlation) = self.correlation.take() {
            correlation.disarm();
        }
    }

}

impl Drop for Reply {
    fn drop(&mut self) {
        let Some(correlation) = self.correlation.take() else {
            return;
        };
        // The inbox catching the panic fails it with the panic message.
        if std::thread::panicking() {
            let _ = UNWOUND.try_with(|unwound| unwound.borrow_mut().push(correlation));
            return;
        }
        let error = Error::BrokenPromise(
            correlation.target.clone(),
            correlation.method.clone(),
        );
        if correlation.complete(Err(error)) {
            debug!(
                "Reply for {}:{} dropped without an answer.",
                correlation.target, correlation.method
            );
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("expected", &self.is_expected())
            .finish()
    }
}

/// Caller side cancel token of a query.
#[derive(Clone)]
pub struct QueryToken {
    correlation: Arc<Correlation>,
}

impl QueryToken {
    pub(crate) fn new(correlation: Arc<Correlation>) -> Self {
        Self { correlation }
    }

    /// Fails the sink with `Error::Cancelled` if the query is still pending. Idempotent.
    pub fn cancel(&self) {
        self.correlation.complete(Err(Error::Cancelled));
    }

    /// True once the sink has been invoked (or the query was disarmed).
    pub fn is_settled(&self) -> bool {
        self.correlation.is_settled()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::sink::sink_fn;

    use std::time::Duration;

    fn recording() -> (BoxedSink, Arc<Mutex<Vec<Result<Value, Error>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let sink = sink_fn(move |result| inner.lock().push(result));
        (Box::new(sink), calls)
    }

    #[test]
    fn test_first_completion_wins() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        assert!(correlation.complete(Ok(Value::Int(5))));
        assert!(!correlation.complete(Err(Error::Cancelled)));
        assert_eq!(*calls.lock(), vec![Ok(Value::Int(5))]);
        assert!(correlation.is_settled());
    }

    #[test]
    fn test_reply_dropped_by_panic_fails_with_reason() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/proxy"), "add", sink);
        let reply = Reply::expecting(correlation.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _reply = reply;
            panic!("lost");
        }));
        assert!(result.is_err());
        assert!(!correlation.is_settled());

        assert_eq!(fail_unwound(&ActorPath::from("/proxy"), "lost"), 1);
        assert_eq!(
            *calls.lock(),
            vec![Err(Error::Failure(ActorPath::from("/proxy"), "lost".to_owned()))]
        );
        assert_eq!(fail_unwound(&ActorPath::from("/proxy"), "lost"), 0);
    }

    #[test]
    fn test_dropped_reply_breaks_promise() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        let reply = Reply::expecting(correlation);
        assert!(reply.is_expected());
        drop(reply);
        assert_eq!(
            *calls.lock(),
            vec![Err(Error::BrokenPromise(
                ActorPath::from("/calc"),
                "add".to_owned()
            ))]
        );
    }

    #[test]
    fn test_disarm_skips_sink() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        Reply::expecting(correlation.clone()).disarm();
        assert!(correlation.is_settled());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        let token = QueryToken::new(correlation.clone());
        token.cancel();
        token.cancel();
        Reply::expecting(correlation).ok(5);
        assert_eq!(*calls.lock(), vec![Err(Error::Cancelled)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_result() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        let reply = Reply::expecting(correlation.clone());
        correlation.arm(Instant::now() + Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reply.is_expected());
        reply.ok(5);

        assert_eq!(
            *calls.lock(),
            vec![Err(Error::Timeout(ActorPath::from("/calc"), "add".to_owned()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_disarms_timer() {
        let (sink, calls) = recording();
        let correlation = Correlation::new(ActorPath::from("/calc"), "add", sink);
        correlation.arm(Instant::now() + Duration::from_millis(50));
        Reply::expecting(correlation).ok(5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*calls.lock(), vec![Ok(Value::Int(5))]);
    }
}
