// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Pipes
//!
//! A pipe streams values from one producer to a stream method of one consumer actor. The
//! producer never runs consumer code: `next` pushes into a bounded [`RingBuffer`] and, at
//! most once per drain cycle, posts a wake letter to the consumer's inbox. The consumer
//! drains the ring from its own inbox, in push order, and then delivers the terminal event.
//!
//! The wake state is shared by both sides and only flipped with compare-and-set:
//!
//! ```text
//!            next / ok / fail                 next / ok / fail
//!   Idle ─────────────────────▶ Draining ─────────────────────▶ DrainPending
//!    ▲      (posts one wake)      │  ▲                               │
//!    └────────────────────────────┘  └───────────────────────────────┘
//!        drain pass, nothing new         drain pass, posts a new wake
//! ```
//!

use crate::{
    ActorContext, ActorPath, Error, MethodRef, Value,
    actor::Actor,
    handler::{Letter, Method, MethodTable},
    ring::RingBuffer,
    runner,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

/// Event delivered to a stream method.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A value, in the order the producer pushed it.
    Next(Value),
    /// The producer finished.
    Complete,
    /// The producer failed. Delivered after every value buffered before the failure.
    Failed(Error),
}

/// Coordination state between producer and consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeState {
    /// No drain scheduled.
    Idle = 0,
    /// A wake letter is queued or being handled.
    Draining = 1,
    /// New data arrived while draining; the drain pass must schedule another wake.
    DrainPending = 2,
}

impl From<u8> for WakeState {
    fn from(value: u8) -> Self {
        match value {
            0 => WakeState::Idle,
            1 => WakeState::Draining,
            _ => WakeState::DrainPending,
        }
    }
}

#[derive(Debug)]
enum Terminal {
    Complete,
    Failed(Error),
}

pub(crate) struct PipeShared {
    ring: RingBuffer<Value>,
    consumer: MethodRef,
    state: AtomicU8,
    terminal: Mutex<Option<Terminal>>,
    /// Set once the terminal event has been handed to the consumer.
    finished: AtomicBool,
    cancel: CancellationToken,
    wakes: AtomicUsize,
}

impl PipeShared {
    fn state(&self) -> WakeState {
        WakeState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WakeState, to: WakeState) -> Result<(), WakeState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(WakeState::from)
    }

    /// Producer side: makes sure a drain will see what was just pushed.
    fn wake(self: &Arc<Self>) -> Result<(), Error> {
        let mut current = self.state();
        loop {
            let next = match current {
                WakeState::Idle => WakeState::Draining,
                WakeState::Draining => WakeState::DrainPending,
                WakeState::DrainPending => return Ok(()),
            };
            match self.transition(current, next) {
                Ok(()) if current == WakeState::Idle => return self.schedule(),
                Ok(()) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn schedule(self: &Arc<Self>) -> Result<(), Error> {
        self.wakes.fetch_add(1, Ordering::Relaxed);
        let result = self
            .consumer
            .handle()
            .post(Letter::Wake(Wake(self.clone())));
        if result.is_err() {
            debug!(
                "Consumer {} of the pipe is gone, closing it.",
                self.consumer.handle().path()
            );
            self.cancel.cancel();
            self.state.store(WakeState::Idle as u8, Ordering::Release);
        }
        result
    }

    fn closed_error(&self) -> Error {
        Error::Closed(self.consumer.handle().path().clone())
    }

    fn take_terminal(&self) -> Option<StreamEvent> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        let terminal = self.terminal.lock();
        let event = match terminal.as_ref()? {
            Terminal::Complete => StreamEvent::Complete,
            Terminal::Failed(error) => StreamEvent::Failed(error.clone()),
        };
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(event)
    }
}

/// Wake letter of a pipe, handled by the consumer's inbox.
pub struct Wake(pub(crate) Arc<PipeShared>);

impl Wake {
    /// Target of the wake: the consumer's stream method.
    pub fn consumer(&self) -> &MethodRef {
        &self.0.consumer
    }

    /// Closes the pipe from a consumer that is shutting down.
    pub(crate) fn close(self) {
        self.0.cancel.cancel();
        self.0.ring.clear();
        self.0.state.store(WakeState::Idle as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Wake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wake")
            .field("consumer", &self.0.consumer)
            .finish()
    }
}

/// Consumer-side cancel handle of a pipe.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<PipeShared>,
}

impl Subscription {
    /// Closes the pipe. Values already dequeued stay delivered. Idempotent.
    pub fn cancel(&self) {
        if !self.shared.cancel.is_cancelled() {
            debug!(
                "Pipe to {} cancelled.",
                self.shared.consumer.handle().path()
            );
        }
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the pipe is cancelled.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }
}

/// Producer end of a pipe.
///
/// There is exactly one producer, so the type is not `Clone`. Dropping it without calling
/// [`Pipe::ok`] or [`Pipe::fail`] fails the consumer with `Error::Pipe`.
pub struct Pipe {
    shared: Arc<PipeShared>,
}

impl Pipe {
    /// Opens a pipe to the stream method `consumer`.
    pub fn open(consumer: MethodRef, capacity: usize) -> Result<Self, Error> {
        let handle = consumer.handle();
        if handle.is_closed() {
            return Err(Error::Closed(handle.path().clone()));
        }
        if !handle.accepts_stream(consumer.name()) {
            return Err(Error::UnknownMethod(
                handle.path().clone(),
                consumer.name().to_owned(),
            ));
        }
        if capacity == 0 {
            return Err(Error::Pipe("ring capacity must be positive".to_owned()));
        }
        debug!("Opening pipe to {:?}.", &consumer);
        Ok(Self {
            shared: Arc::new(PipeShared {
                ring: RingBuffer::new(capacity),
                consumer,
                state: AtomicU8::new(WakeState::Idle as u8),
                terminal: Mutex::new(None),
                finished: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                wakes: AtomicUsize::new(0),
            }),
        })
    }

    /// Pushes a value.
    ///
    /// # Errors
    ///
    /// `Error::Backpressure` when the ring is full (the value is not enqueued),
    /// `Error::Closed` when the consumer cancelled or shut down.
    pub fn next(&self, value: impl Into<Value>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        if self.shared.ring.offer(value.into()).is_err() {
            return Err(Error::Backpressure(self.shared.ring.capacity()));
        }
        self.shared.wake()
    }

    /// Signals completion after the buffered values.
    pub fn ok(self) -> Result<(), Error> {
        self.finish(Terminal::Complete)
    }

    /// Signals failure after the buffered values.
    pub fn fail(self, cause: Error) -> Result<(), Error> {
        self.finish(Terminal::Failed(cause))
    }

    fn finish(&self, terminal: Terminal) -> Result<(), Error> {
        {
            let mut slot = self.shared.terminal.lock();
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(terminal);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.closed_error());
        }
        self.shared.wake()
    }

    /// Cancel handle, the same one the consumer's stream method receives.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            shared: self.shared.clone(),
        }
    }

    /// True when the consumer cancelled or shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled() || self.shared.consumer.handle().is_closed()
    }

    pub fn consumer(&self) -> &MethodRef {
        &self.shared.consumer
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Values pushed and not yet drained.
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }

    pub fn state(&self) -> WakeState {
        self.shared.state()
    }

    /// Wake letters posted so far.
    pub fn wake_count(&self) -> usize {
        self.shared.wakes.load(Ordering::Relaxed)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let unfinished = self.shared.terminal.lock().is_none();
        if unfinished && !self.shared.cancel.is_cancelled() {
            debug!("Pipe producer dropped without a terminal signal.");
            let _ = self.finish(Terminal::Failed(Error::Pipe(
                "producer dropped".to_owned(),
            )));
        }
    }
}

/// Consumer side: one drain pass, run by the consumer's inbox.
pub(crate) fn drain<A: Actor>(
    wake: Wake,
    path: &ActorPath,
    actor: &mut A,
    ctx: &mut ActorContext<A>,
    methods: &MethodTable<A>,
) {
    let shared = wake.0;
    let handler = match methods.get(shared.consumer.name()) {
        Some(Method::Stream(handler)) => handler,
        _ => {
            error!(
                "Actor {} has no stream method '{}', closing pipe.",
                path,
                shared.consumer.name()
            );
            shared.cancel.cancel();
            return;
        }
    };
    let subscription = Subscription {
        shared: shared.clone(),
    };
    let mut deliver = |event: StreamEvent| {
        let result = catch_unwind(AssertUnwindSafe(|| {
            handler(actor, ctx, event, &subscription)
        }));
        if let Err(panic) = result {
            error!(
                "Stream method {}:{} panicked: {}",
                path,
                shared.consumer.name(),
                runner::unwound(path, panic.as_ref())
            );
        }
    };

    loop {
        while !shared.cancel.is_cancelled() {
            match shared.ring.poll() {
                Some(value) => deliver(StreamEvent::Next(value)),
                None => break,
            }
        }
        if shared.cancel.is_cancelled() {
            let discarded = shared.ring.clear();
            if discarded > 0 {
                debug!("Discarded {} values of a cancelled pipe.", discarded);
            }
        } else if let Some(event) = shared.take_terminal() {
            // Values pushed before the terminal signal may have raced the poll loop above.
            while let Some(value) = shared.ring.poll() {
                deliver(StreamEvent::Next(value));
            }
            deliver(event);
        }

        match shared.transition(WakeState::Draining, WakeState::Idle) {
            Ok(()) => return,
            Err(WakeState::DrainPending) => {
                shared
                    .state
                    .store(WakeState::Draining as u8, Ordering::Release);
                if shared.cancel.is_cancelled() || shared.finished.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(error) = shared.schedule() {
                    debug!("Could not reschedule pipe drain: {}", error);
                }
                return;
            }
            Err(state) => {
                debug!("Unexpected pipe state {:?} after drain.", state);
                shared.state.store(WakeState::Idle as u8, Ordering::Release);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{ActorHandle, handler::Mailbox};

    use tokio::sync::oneshot;

    /// Mailbox that only records letters, so no drain ever runs.
    struct Recorder {
        path: ActorPath,
        letters: Mutex<Vec<Letter>>,
        closed: AtomicBool,
    }

    impl Mailbox for Recorder {
        fn path(&self) -> &ActorPath {
            &self.path
        }

        fn accepts(&self, _method: &str) -> bool {
            false
        }

        fn accepts_stream(&self, method: &str) -> bool {
            method == "ticks"
        }

        fn post(&self, letter: Letter) -> Result<(), Error> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed(self.path.clone()));
            }
            self.letters.lock().push(letter);
            Ok(())
        }

        fn stop(&self, _ack: Option<oneshot::Sender<()>>) {}

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    fn recorder() -> (Arc<Recorder>, MethodRef) {
        let recorder = Arc::new(Recorder {
            path: ActorPath::from("/consumer"),
            letters: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let handle = ActorHandle::from_mailbox(recorder.clone());
        (recorder, handle.method("ticks"))
    }

    #[test]
    fn test_rapid_next_posts_one_wake() {
        let (recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 32).unwrap();
        for value in 0..10 {
            pipe.next(value).unwrap();
        }
        assert_eq!(pipe.wake_count(), 1);
        assert_eq!(recorder.letters.lock().len(), 1);
        assert_eq!(pipe.state(), WakeState::DrainPending);
        assert_eq!(pipe.len(), 10);
    }

    #[test]
    fn test_full_ring_rejects() {
        let (_recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 4).unwrap();
        for value in 0..4 {
            pipe.next(value).unwrap();
        }
        assert_eq!(pipe.next(4), Err(Error::Backpressure(4)));
        assert_eq!(pipe.len(), 4);
    }

    #[test]
    fn test_open_requires_stream_method() {
        let (recorder, _) = recorder();
        let handle = ActorHandle::from_mailbox(recorder);
        assert_eq!(
            Pipe::open(handle.method("other"), 4).err(),
            Some(Error::UnknownMethod(
                ActorPath::from("/consumer"),
                "other".to_owned()
            ))
        );
    }

    #[test]
    fn test_cancel_closes_producer() {
        let (_recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 4).unwrap();
        let subscription = pipe.subscription();
        subscription.cancel();
        subscription.cancel();
        assert!(pipe.is_closed());
        assert_eq!(
            pipe.next(1),
            Err(Error::Closed(ActorPath::from("/consumer")))
        );
    }

    #[test]
    fn test_closed_consumer() {
        let (recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 4).unwrap();
        recorder.closed.store(true, Ordering::Release);
        assert!(pipe.next(1).is_err());
    }

    #[test]
    fn test_terminal_taken_once() {
        let (_recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 4).unwrap();
        let shared = pipe.shared.clone();
        pipe.ok().unwrap();
        assert_eq!(shared.take_terminal(), Some(StreamEvent::Complete));
        assert_eq!(shared.take_terminal(), None);
    }

    #[test]
    fn test_dropped_producer_fails_consumer() {
        let (_recorder, consumer) = recorder();
        let pipe = Pipe::open(consumer, 4).unwrap();
        let shared = pipe.shared.clone();
        drop(pipe);
        assert_eq!(
            shared.take_terminal(),
            Some(StreamEvent::Failed(Error::Pipe("producer dropped".to_owned())))
        );
    }
}
