// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor
//!
//! The `actor` module provides the `Actor` trait, the `ActorContext` handed to every handler,
//! and the two address types: `ActorHandle`, a reference to an actor, and `MethodRef`, a
//! reference to one method of it. Handles are the only way to reach an actor; its state is
//! touched exclusively by the inbox task that owns it.
//!

use crate::{
    ActorPath, Args, Error, Value,
    envelope::Headers,
    handler::{InboxSender, Letter, Mailbox, MethodTable, Work},
    outbox::Outbox,
    pipe::Pipe,
    query::{Correlation, QueryToken, Reply},
    runner::StopSender,
    sink::{OneshotSink, ResultSink, RoutedSink},
    system::SystemRef,
};

use async_trait::async_trait;

use tokio::{sync::oneshot, time::Instant};

use tracing::debug;

use std::{cmp::Ordering, fmt::Debug, sync::Arc, time::Duration};

/// Actor execution context.
///
/// The context is the actor's view of the system while one of its handlers runs: its own
/// path and outbox, the envelope being handled, and the operations that produce new work
/// (sending, querying, opening pipes, creating children). None of them blocks; results come
/// back later as new work on this actor's inbox.
///
/// # Examples
///
/// ```ignore
/// MethodTable::new().method("forward", |_, ctx, args| {
///     let calc = ctx.system().method("/calc", "add")?;
///     ctx.query(&calc, args, Duration::from_secs(1), |actor: &mut Proxy, _ctx, result| {
///         actor.last = result.ok();
///     })?;
///     Ok(Value::Null)
/// })
/// ```
pub struct ActorContext<A: Actor> {
    /// Hierarchical path identifying this actor in the system
    path: ActorPath,
    /// Reference to the actor system for global operations
    system: SystemRef,
    /// Origin of every envelope this actor sends
    outbox: Outbox,
    /// This actor's own inbox, target of completions
    inbox: InboxSender<A>,
    /// Channel sender for stopping this actor
    stop: StopSender,
    /// Children created through this context
    children: Vec<ActorHandle>,
    /// Origin and headers of the envelope being handled
    current: Option<(ActorPath, Headers)>,
}

impl<A> ActorContext<A>
where
    A: Actor,
{
    pub(crate) fn new(
        path: ActorPath,
        system: SystemRef,
        inbox: InboxSender<A>,
        stop: StopSender,
    ) -> Self {
        Self {
            outbox: Outbox::new(path.clone()),
            path,
            system,
            inbox,
            stop,
            children: Vec::new(),
            current: None,
        }
    }

    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    pub fn system(&self) -> &SystemRef {
        &self.system
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Origin of the envelope being handled.
    pub fn sender(&self) -> Option<&ActorPath> {
        self.current.as_ref().map(|(origin, _)| origin)
    }

    /// Header of the envelope being handled.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|(_, headers)| headers.get(key))
            .map(String::as_str)
    }

    pub(crate) fn set_current(&mut self, origin: ActorPath, headers: Headers) {
        self.current = Some((origin, headers));
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
    }

    /// Handle of this actor.
    pub fn reference(&self) -> Result<ActorHandle, Error> {
        self.system.resolve(&self.path)
    }

    /// Fire-and-forget send from this actor's outbox.
    pub fn send(&self, method: &MethodRef, args: impl Into<Args>) -> Result<(), Error> {
        method.send(&self.outbox, args)
    }

    /// Queries `method` and runs `callback` on this actor's inbox with the result.
    ///
    /// The callback is invoked exactly once: with the result, or with `Error::Timeout` if
    /// `timeout` elapses first, or `Error::Cancelled` if the returned token is cancelled.
    /// If the envelope cannot be enqueued the error is returned here and the callback never
    /// runs.
    pub fn query<F>(
        &self,
        method: &MethodRef,
        args: impl Into<Args>,
        timeout: Duration,
        callback: F,
    ) -> Result<QueryToken, Error>
    where
        F: FnOnce(&mut A, &mut ActorContext<A>, Result<Value, Error>)
            + Send
            + 'static,
    {
        let sink = RoutedSink::new(self.inbox.clone(), callback);
        method.query(&self.outbox, args, sink, timeout)
    }

    /// Same as [`ActorContext::query`] with the configured default timeout.
    pub fn query_default<F>(
        &self,
        method: &MethodRef,
        args: impl Into<Args>,
        callback: F,
    ) -> Result<QueryToken, Error>
    where
        F: FnOnce(&mut A, &mut ActorContext<A>, Result<Value, Error>)
            + Send
            + 'static,
    {
        let timeout = self.system.config().query_timeout();
        self.query(method, args, timeout, callback)
    }

    /// Enqueues `task` on this actor's inbox, after the work already queued.
    pub fn schedule<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut A, &mut ActorContext<A>) + Send + 'static,
    {
        self.inbox
            .send(Work::Completion(Box::new(task)))
            .map_err(|_| Error::Closed(self.path.clone()))
    }

    /// Opens a pipe to a stream method, with the configured ring capacity.
    pub fn pipe(&self, consumer: &MethodRef) -> Result<Pipe, Error> {
        Pipe::open(consumer.clone(), self.system.config().pipe_capacity)
    }

    pub fn pipe_with_capacity(
        &self,
        consumer: &MethodRef,
        capacity: usize,
    ) -> Result<Pipe, Error> {
        Pipe::open(consumer.clone(), capacity)
    }

    /// Creates a child actor at `<this path>/<name>`.
    ///
    /// The child starts asynchronously; envelopes sent before its `pre_start` finishes
    /// wait in its inbox.
    pub fn create_child<C>(&mut self, name: &str, actor: C) -> Result<ActorHandle, Error>
    where
        C: Actor,
    {
        let path = self.path.child(name);
        let (handle, _started) = self.system.spawn_actor(path, actor)?;
        self.children.retain(|child| !child.is_closed());
        self.children.push(handle.clone());
        Ok(handle)
    }

    /// Child created through this context, if still running.
    pub fn get_child(&self, name: &str) -> Option<ActorHandle> {
        let path = self.path.child(name);
        self.children
            .iter()
            .find(|child| *child.path() == path && !child.is_closed())
            .cloned()
    }

    pub fn children(&self) -> impl Iterator<Item = &ActorHandle> {
        self.children.iter().filter(|child| !child.is_closed())
    }

    /// Stops every child and waits for them to finish.
    pub(crate) async fn stop_children(&mut self) {
        for child in self.children.drain(..) {
            child.ask_stop().await;
        }
    }

    /// Asks this actor to stop once the current handler returns.
    pub fn stop(&self) {
        if self.stop.try_send(None).is_err() {
            debug!("Actor {} is already stopping.", &self.path);
        }
    }
}

/// The `Actor` trait is the main trait that actors must implement.
///
/// An actor is plain state plus an explicit dispatch table. The table is built once by
/// [`Actor::methods`] when the actor type is registered; every envelope is resolved against
/// it, never by reflection.
///
/// # Examples
///
/// ```ignore
/// struct Calc;
///
/// #[async_trait]
/// impl Actor for Calc {
///     fn methods() -> MethodTable<Self> {
///         MethodTable::new().method("add", |_, _, args| {
///             Ok(Value::from(args.int(0)? + args.int(1)?))
///         })
///     }
/// }
/// ```
///
/// # Lifecycle
///
/// `pre_start` runs before the first envelope. When the actor is asked to stop, `pre_stop`
/// runs, children are stopped, queued queries fail with `Error::BrokenPromise`, and
/// `post_stop` runs last. A failing `pre_start` terminates the actor without handling any
/// envelope.
#[async_trait]
pub trait Actor: Send + Sized + 'static {
    /// Builds the dispatch table of this actor type.
    fn methods() -> MethodTable<Self>;

    /// Called before the first envelope is handled.
    async fn pre_start(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called when a stop is requested, before the children are stopped.
    async fn pre_stop(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called once the actor has left the registry.
    async fn post_stop(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Resolves a child address below this actor.
    ///
    /// `SystemRef::lookup` forwards unregistered addresses here, one segment at a time,
    /// starting from the nearest registered ancestor. Returning `None` means not found.
    fn on_lookup(
        &mut self,
        _name: &str,
        _ctx: &mut ActorContext<Self>,
    ) -> Option<ActorHandle> {
        None
    }
}

/// Reference to an actor.
///
/// Handles are cheap to clone and compare by address. A handle does not keep the actor
/// alive; once the actor stops the handle reports closed and rejects every send with
/// `Error::Closed`.
#[derive(Clone)]
pub struct ActorHandle {
    mailbox: Arc<dyn Mailbox>,
}

impl ActorHandle {
    /// Wraps a mailbox, local or provided by a transport.
    pub fn from_mailbox(mailbox: Arc<dyn Mailbox>) -> Self {
        Self { mailbox }
    }

    pub fn path(&self) -> &ActorPath {
        self.mailbox.path()
    }

    /// Reference to one method of this actor.
    pub fn method(&self, name: &str) -> MethodRef {
        MethodRef {
            handle: self.clone(),
            name: Arc::from(name),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub fn accepts(&self, method: &str) -> bool {
        self.mailbox.accepts(method)
    }

    pub fn accepts_stream(&self, method: &str) -> bool {
        self.mailbox.accepts_stream(method)
    }

    pub(crate) fn post(&self, letter: Letter) -> Result<(), Error> {
        self.mailbox.post(letter)
    }

    /// Forwards `name` to the actor's lookup hook.
    pub async fn lookup(&self, name: &str) -> Result<ActorHandle, Error> {
        let (sender, receiver) = oneshot::channel();
        self.post(Letter::Lookup(name.to_owned(), sender))?;
        receiver
            .await
            .map_err(|_| Error::Closed(self.path().clone()))?
            .ok_or_else(|| Error::NotFound(self.path().child(name)))
    }

    /// Stops the actor and waits until it has stopped.
    pub async fn ask_stop(&self) {
        let (sender, receiver) = oneshot::channel();
        self.mailbox.stop(Some(sender));
        // A dropped acknowledgement means the actor was already gone.
        let _ = receiver.await;
    }

    /// Stops the actor without waiting.
    pub fn tell_stop(&self) {
        self.mailbox.stop(None);
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl Eq for ActorHandle {}

impl PartialOrd for ActorHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActorHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path().cmp(other.path())
    }
}

impl Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActorHandle({})", self.path())
    }
}

/// Reference to a named method of an actor.
///
/// Method references are stateless and reusable. They order by actor address, then method
/// name.
#[derive(Clone)]
pub struct MethodRef {
    handle: ActorHandle,
    name: Arc<str>,
}

impl MethodRef {
    pub fn handle(&self) -> &ActorHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn check(&self) -> Result<(), Error> {
        if self.handle.is_closed() {
            Err(Error::Closed(self.handle.path().clone()))
        } else if !self.handle.accepts(&self.name) {
            Err(Error::UnknownMethod(
                self.handle.path().clone(),
                self.name.to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Enqueues a fire-and-forget envelope.
    ///
    /// # Errors
    ///
    /// `Error::Closed` if the actor is gone, `Error::UnknownMethod` if the method is not in
    /// its dispatch table. Nothing is enqueued in either case.
    pub fn send(&self, outbox: &Outbox, args: impl Into<Args>) -> Result<(), Error> {
        self.check()?;
        let envelope = outbox.envelope(
            self.handle.path(),
            &self.name,
            args.into(),
            None,
            Reply::none(),
        );
        self.handle.post(Letter::Envelope(envelope))
    }

    /// Enqueues a query whose outcome goes to `sink`.
    ///
    /// Never blocks. The sink receives exactly one call: the result, `Error::Timeout` once
    /// `timeout` has elapsed (a timeout such as `Duration::MAX` never elapses), or `Error::Cancelled` through the returned token. Results
    /// arriving after that are dropped. When this returns an error the sink is dropped
    /// without being called.
    pub fn query<S>(
        &self,
        outbox: &Outbox,
        args: impl Into<Args>,
        sink: S,
        timeout: Duration,
    ) -> Result<QueryToken, Error>
    where
        S: ResultSink,
    {
        self.check()?;
        // A timeout past the clock's range never expires.
        let deadline = Instant::now().checked_add(timeout);
        let correlation =
            Correlation::new(self.handle.path().clone(), &self.name, Box::new(sink));
        let envelope = outbox.envelope(
            self.handle.path(),
            &self.name,
            args.into(),
            deadline,
            Reply::expecting(correlation.clone()),
        );
        self.handle.post(Letter::Envelope(envelope))?;
        if let Some(deadline) = deadline {
            correlation.arm(deadline);
        }
        Ok(QueryToken::new(correlation))
    }

    /// Queries the method and awaits the result, for callers outside any actor.
    pub async fn ask(
        &self,
        outbox: &Outbox,
        args: impl Into<Args>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let (sender, receiver) = oneshot::channel();
        self.query(outbox, args, OneshotSink(sender), timeout)?;
        receiver
            .await
            .map_err(|_| Error::Closed(self.handle.path().clone()))?
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.name == other.name
    }
}

impl Eq for MethodRef {}

impl PartialOrd for MethodRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MethodRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.handle
            .cmp(&other.handle)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl Debug for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.handle.path(), self.name)
    }
}
