// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Dispatch tables and mailboxes.
//!
//! Every actor type builds a [`MethodTable`] once, when it is registered. Envelopes name a
//! method of that table; the inbox looks the name up and calls the handler with exclusive
//! access to the actor state. A [`Mailbox`] is the address-side view of an inbox, the seam a
//! transport implements to make a remote actor look local.

use crate::{
    ActorContext, ActorHandle, ActorPath, Args, Error, Value,
    actor::Actor,
    envelope::Envelope,
    pipe::{StreamEvent, Subscription, Wake},
    query::Reply,
    runner::StopSender,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Handler answering as soon as it returns.
pub type CallFn<A> = Box<
    dyn Fn(&mut A, &mut ActorContext<A>, Args) -> Result<Value, Error>
        + Send
        + Sync,
>;

/// Handler that answers through a [`Reply`], possibly later.
pub type DeferredFn<A> =
    Box<dyn Fn(&mut A, &mut ActorContext<A>, Args, Reply) + Send + Sync>;

/// Downstream handler of a pipe.
pub type StreamFn<A> = Box<
    dyn Fn(&mut A, &mut ActorContext<A>, StreamEvent, &Subscription)
        + Send
        + Sync,
>;

pub(crate) enum Method<A: Actor> {
    Call(CallFn<A>),
    Deferred(DeferredFn<A>),
    Stream(StreamFn<A>),
}

/// Explicit dispatch table of an actor type: method name to handler.
pub struct MethodTable<A: Actor> {
    methods: HashMap<String, Method<A>>,
}

impl<A: Actor> MethodTable<A> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    fn insert(mut self, name: &str, method: Method<A>) -> Self {
        if self.methods.insert(name.to_owned(), method).is_some() {
            warn!("Method '{}' registered twice, keeping the last one.", name);
        }
        self
    }

    /// Registers a method whose return value answers the query.
    pub fn method<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut A, &mut ActorContext<A>, Args) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Method::Call(Box::new(handler)))
    }

    /// Registers a method that answers through the given [`Reply`].
    pub fn deferred<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut A, &mut ActorContext<A>, Args, Reply) + Send + Sync + 'static,
    {
        self.insert(name, Method::Deferred(Box::new(handler)))
    }

    /// Registers the downstream handler of pipes opened to `name`.
    pub fn stream<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut A, &mut ActorContext<A>, StreamEvent, &Subscription)
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Method::Stream(Box::new(handler)))
    }

    /// True if envelopes may target `name`.
    pub fn accepts(&self, name: &str) -> bool {
        matches!(
            self.methods.get(name),
            Some(Method::Call(_)) | Some(Method::Deferred(_))
        )
    }

    /// True if pipes may be opened to `name`.
    pub fn accepts_stream(&self, name: &str) -> bool {
        matches!(self.methods.get(name), Some(Method::Stream(_)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Method<A>> {
        self.methods.get(name)
    }
}

impl<A: Actor> Default for MethodTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a mailbox can carry to an inbox.
pub enum Letter {
    /// A method invocation.
    Envelope(Envelope),
    /// Drain notification of a pipe.
    Wake(Wake),
    /// Request forwarded to the actor's lookup hook.
    Lookup(String, oneshot::Sender<Option<ActorHandle>>),
}

impl Letter {
    /// Discards a letter that never reached its inbox.
    fn disarm(self) {
        if let Letter::Envelope(envelope) = self {
            envelope.disarm();
        }
    }
}

/// Closure run on the owning actor's inbox.
pub(crate) type Completion<A> =
    Box<dyn FnOnce(&mut A, &mut ActorContext<A>) + Send>;

/// Item of an inbox queue.
pub(crate) enum Work<A: Actor> {
    Letter(Letter),
    Completion(Completion<A>),
}

pub(crate) type InboxSender<A> = mpsc::UnboundedSender<Work<A>>;

pub(crate) type InboxReceiver<A> = mpsc::UnboundedReceiver<Work<A>>;

/// Creates the unbounded queue of an inbox.
pub(crate) fn inbox<A: Actor>() -> (InboxSender<A>, InboxReceiver<A>) {
    mpsc::unbounded_channel()
}

/// Address-side view of an inbox.
///
/// The local implementation feeds an actor task; a transport can implement it to forward
/// letters to a remote node.
pub trait Mailbox: Send + Sync + 'static {
    /// Address of the actor behind the mailbox.
    fn path(&self) -> &ActorPath;

    /// True if envelopes may target `method`.
    fn accepts(&self, method: &str) -> bool;

    /// True if pipes may be opened to `method`.
    fn accepts_stream(&self, method: &str) -> bool;

    /// Enqueues a letter. Fails synchronously when the actor is closed.
    fn post(&self, letter: Letter) -> Result<(), Error>;

    /// Asks the actor to stop, optionally acknowledging once it has.
    fn stop(&self, ack: Option<oneshot::Sender<()>>);

    /// True once the actor has shut down. Never cleared.
    fn is_closed(&self) -> bool;
}

/// Mailbox of an actor running in this process.
pub(crate) struct LocalMailbox<A: Actor> {
    path: ActorPath,
    sender: InboxSender<A>,
    stop: StopSender,
    methods: Arc<MethodTable<A>>,
    closed: Arc<AtomicBool>,
}

impl<A: Actor> LocalMailbox<A> {
    pub(crate) fn new(
        path: ActorPath,
        sender: InboxSender<A>,
        stop: StopSender,
        methods: Arc<MethodTable<A>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        debug!("Creating new mailbox for {}.", &path);
        Self {
            path,
            sender,
            stop,
            methods,
            closed,
        }
    }
}

impl<A: Actor> Mailbox for LocalMailbox<A> {
    fn path(&self) -> &ActorPath {
        &self.path
    }

    fn accepts(&self, method: &str) -> bool {
        self.methods.accepts(method)
    }

    fn accepts_stream(&self, method: &str) -> bool {
        self.methods.accepts_stream(method)
    }

    fn post(&self, letter: Letter) -> Result<(), Error> {
        if self.is_closed() {
            letter.disarm();
            return Err(Error::Closed(self.path.clone()));
        }
        if let Err(error) = self.sender.send(Work::Letter(letter)) {
            debug!("Failed to post letter to {}!", &self.path);
            if let Work::Letter(letter) = error.0 {
                letter.disarm();
            }
            return Err(Error::Closed(self.path.clone()));
        }
        Ok(())
    }

    fn stop(&self, ack: Option<oneshot::Sender<()>>) {
        if self.stop.try_send(ack).is_err() {
            debug!("Actor {} is already stopping.", &self.path);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }
}
