// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Inbox execution
//!
//! Each actor is owned by one `ActorRunner`, spawned as its own tokio task. The runner is the
//! actor's inbox: it takes work off a single FIFO queue and runs it with exclusive access to
//! the actor state, so handlers never need locks of their own.
//!
//! ## Work kinds
//!
//! 1. **Envelopes**: method invocations. Expired queries fail with `Error::Timeout` without
//!    being invoked; handler errors and panics go to the caller's sink.
//! 2. **Wakes**: pipe drain notifications, delivered to the consumer's stream method.
//! 3. **Lookups**: child address resolution through `Actor::on_lookup`.
//! 4. **Completions**: query callbacks routed back to the actor that asked.
//!
//! ## Lifecycle
//!
//! Created → Started → Stopped → Terminated, or Created → Failed → Terminated when
//! `pre_start` fails. On the way out the runner closes the mailbox, fails every queued query
//! with `Error::BrokenPromise`, and removes the actor from the registry before acknowledging
//! the stop request.
//!

use crate::{
    ActorPath, Error,
    actor::{Actor, ActorContext, ActorHandle},
    envelope::Envelope,
    handler::{
        InboxReceiver, InboxSender, Letter, LocalMailbox, Method, MethodTable,
        Work, inbox,
    },
    pipe, query,
    system::SystemRef,
};

use futures::FutureExt;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, warn};

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

pub type StopReceiver = mpsc::Receiver<Option<oneshot::Sender<()>>>;

pub type StopSender = mpsc::Sender<Option<oneshot::Sender<()>>>;

/// Lifecycle of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorLifecycle {
    /// The actor is created.
    Created,
    /// The actor is started.
    Started,
    /// The actor is stopped.
    Stopped,
    /// The actor failed to start.
    Failed,
    /// The actor is terminated.
    Terminated,
}

pub(crate) struct ActorRunner<A: Actor> {
    path: ActorPath,
    actor: A,
    lifecycle: ActorLifecycle,
    methods: Arc<MethodTable<A>>,
    sender: InboxSender<A>,
    receiver: InboxReceiver<A>,
    stop_sender: StopSender,
    stop_receiver: StopReceiver,
    closed: Arc<AtomicBool>,
    ack: Option<oneshot::Sender<()>>,
}

impl<A> ActorRunner<A>
where
    A: Actor,
{
    pub(crate) fn create(
        path: ActorPath,
        actor: A,
        stop_capacity: usize,
    ) -> (Self, ActorHandle) {
        debug!("Creating new actor runner.");
        let (sender, receiver) = inbox();
        let (stop_sender, stop_receiver) = mpsc::channel(stop_capacity.max(1));
        let methods = Arc::new(A::methods());
        let closed = Arc::new(AtomicBool::new(false));
        let mailbox = LocalMailbox::new(
            path.clone(),
            sender.clone(),
            stop_sender.clone(),
            methods.clone(),
            closed.clone(),
        );
        let runner = ActorRunner {
            path,
            actor,
            lifecycle: ActorLifecycle::Created,
            methods,
            sender,
            receiver,
            stop_sender,
            stop_receiver,
            closed,
            ack: None,
        };
        (runner, ActorHandle::from_mailbox(Arc::new(mailbox)))
    }

    pub(crate) async fn init(
        &mut self,
        system: SystemRef,
        mut start: Option<oneshot::Sender<bool>>,
    ) {
        debug!("Initializing actor {} runner.", &self.path);

        debug!("Creating actor {} context.", &self.path);
        let mut ctx: ActorContext<A> = ActorContext::new(
            self.path.clone(),
            system,
            self.sender.clone(),
            self.stop_sender.clone(),
        );

        loop {
            match self.lifecycle {
                ActorLifecycle::Created => {
                    debug!("Actor {} is created.", &self.path);
                    let result = AssertUnwindSafe(self.actor.pre_start(&mut ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(Error::Start(panic_message(panic.as_ref())))
                        });
                    match result {
                        Ok(()) => {
                            debug!(
                                "Actor '{}' has started successfully.",
                                &self.path
                            );
                            self.lifecycle = ActorLifecycle::Started;
                        }
                        Err(err) => {
                            error!(
                                "Actor {} failed to start: {:?}",
                                &self.path, err
                            );
                            self.lifecycle = ActorLifecycle::Failed;
                        }
                    }
                }
                ActorLifecycle::Started => {
                    debug!("Actor {} is started.", &self.path);
                    if let Some(sender) = start.take() {
                        if sender.send(true).is_err() {
                            debug!("Nobody waits for actor {} to start.", &self.path);
                        }
                    }
                    self.ack = self.run(&mut ctx).await;
                    // Handles reject new letters while the stop hooks run.
                    self.closed.store(true, Ordering::Release);
                    self.lifecycle = ActorLifecycle::Stopped;
                }
                ActorLifecycle::Stopped => {
                    debug!("Actor {} is stopped.", &self.path);
                    let result = AssertUnwindSafe(self.actor.pre_stop(&mut ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(Error::Stop));
                    if let Err(err) = result {
                        error!("Actor '{}' failed to stop: {:?}", &self.path, err);
                    }
                    ctx.stop_children().await;
                    self.close(&mut ctx);
                    let result = AssertUnwindSafe(self.actor.post_stop(&mut ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(Error::Stop));
                    if let Err(err) = result {
                        error!("Actor '{}' failed to stop: {:?}", &self.path, err);
                    }
                    self.lifecycle = ActorLifecycle::Terminated;
                }
                ActorLifecycle::Failed => {
                    debug!("Actor {} is faulty.", &self.path);
                    ctx.stop_children().await;
                    self.close(&mut ctx);
                    if let Some(sender) = start.take() {
                        if sender.send(false).is_err() {
                            debug!("Nobody waits for actor {} to start.", &self.path);
                        }
                    }
                    self.lifecycle = ActorLifecycle::Terminated;
                }
                ActorLifecycle::Terminated => {
                    debug!("Actor {} is terminated.", &self.path);
                    if let Some(ack) = self.ack.take() {
                        let _ = ack.send(());
                    }
                    // Stop requests that raced the shutdown.
                    self.stop_receiver.close();
                    while let Ok(stop) = self.stop_receiver.try_recv() {
                        if let Some(ack) = stop {
                            let _ = ack.send(());
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Runs the inbox until a stop request arrives, returning its acknowledgement channel.
    async fn run(
        &mut self,
        ctx: &mut ActorContext<A>,
    ) -> Option<oneshot::Sender<()>> {
        debug!("Running actor {}.", &self.path);

        loop {
            select! {
                stop = self.stop_receiver.recv() => {
                    debug!("Stopping actor {}.", &self.path);
                    return stop.flatten();
                }
                work = self.receiver.recv() => {
                    match work {
                        Some(work) => self.dispatch(work, ctx),
                        None => return None,
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, work: Work<A>, ctx: &mut ActorContext<A>) {
        match work {
            Work::Letter(Letter::Envelope(envelope)) => self.invoke(envelope, ctx),
            Work::Letter(Letter::Wake(wake)) => pipe::drain(
                wake,
                &self.path,
                &mut self.actor,
                ctx,
                &self.methods,
            ),
            Work::Letter(Letter::Lookup(name, sender)) => {
                let actor = &mut self.actor;
                match catch_unwind(AssertUnwindSafe(|| actor.on_lookup(&name, ctx))) {
                    Ok(found) => {
                        let _ = sender.send(found);
                    }
                    Err(panic) => error!(
                        "Actor {} panicked looking up '{}': {}",
                        &self.path,
                        name,
                        unwound(&self.path, panic.as_ref())
                    ),
                }
            }
            Work::Completion(task) => {
                let actor = &mut self.actor;
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(actor, ctx))) {
                    error!(
                        "Query callback of actor {} panicked: {}",
                        &self.path,
                        unwound(&self.path, panic.as_ref())
                    );
                }
            }
        }
    }

    fn invoke(&mut self, envelope: Envelope, ctx: &mut ActorContext<A>) {
        let parts = envelope.into_parts();
        if parts.expiry.is_some_and(|expiry| expiry <= Instant::now()) {
            debug!(
                "Query {}:{} expired before dispatch.",
                &self.path, &parts.method
            );
            parts
                .reply
                .fail(Error::Timeout(self.path.clone(), parts.method));
            return;
        }

        let Some(method) = self.methods.get(&parts.method) else {
            warn!("Actor {} has no method '{}'.", &self.path, &parts.method);
            parts
                .reply
                .fail(Error::UnknownMethod(self.path.clone(), parts.method));
            return;
        };

        ctx.set_current(parts.origin, parts.headers);
        let actor = &mut self.actor;
        match method {
            Method::Call(handler) => {
                let args = parts.args;
                let result = catch_unwind(AssertUnwindSafe(|| handler(actor, ctx, args)))
                    .unwrap_or_else(|panic| {
                        Err(Error::Failure(
                            self.path.clone(),
                            unwound(&self.path, panic.as_ref()),
                        ))
                    });
                if let Err(err) = &result {
                    debug!("Method {}:{} failed: {}", &self.path, &parts.method, err);
                }
                parts.reply.complete(result);
            }
            Method::Deferred(handler) => {
                let args = parts.args;
                let reply = parts.reply;
                let result =
                    catch_unwind(AssertUnwindSafe(|| handler(actor, ctx, args, reply)));
                if let Err(panic) = result {
                    debug!(
                        "Method {}:{} panicked: {}",
                        &self.path,
                        &parts.method,
                        unwound(&self.path, panic.as_ref())
                    );
                }
            }
            Method::Stream(_) => {
                parts
                    .reply
                    .fail(Error::UnknownMethod(self.path.clone(), parts.method));
            }
        }
        ctx.clear_current();
    }

    /// Closes the mailbox and fails whatever is still queued.
    fn close(&mut self, ctx: &mut ActorContext<A>) {
        self.closed.store(true, Ordering::Release);
        self.receiver.close();
        let mut dropped = 0;
        while let Ok(work) = self.receiver.try_recv() {
            dropped += 1;
            match work {
                // Dropping the reply fails a waiting caller with `BrokenPromise`.
                Work::Letter(Letter::Envelope(envelope)) => drop(envelope),
                Work::Letter(Letter::Wake(wake)) => wake.close(),
                Work::Letter(Letter::Lookup(..)) | Work::Completion(_) => {}
            }
        }
        if dropped > 0 {
            debug!("Actor {} dropped {} queued items.", &self.path, dropped);
        }
        ctx.system().remove_actor(&self.path);
    }
}

/// Text of a caught panic. Replies the panicking code dropped fail with it.
pub(crate) fn unwound(path: &ActorPath, panic: &(dyn Any + Send)) -> String {
    let message = panic_message(panic);
    let failed = query::fail_unwound(path, &message);
    if failed > 0 {
        debug!("Actor {} failed {} replies dropped by a panic.", path, failed);
    }
    message
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{
        Value, args, handler::MethodTable, outbox::Outbox, system::SystemRef,
    };
    use async_trait::async_trait;

    use tokio_util::sync::CancellationToken;
    use tracing::Instrument;
    use tracing_test::traced_test;

    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct TestActor {
        failed: bool,
    }

    #[async_trait]
    impl Actor for TestActor {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
                .method("echo", |_, _, args| Ok(args.into_first()))
                .method("boom", |_, _, _| panic!("boom"))
                .method("stop", |_, ctx, _| {
                    ctx.stop();
                    Ok(Value::Null)
                })
                .deferred("relay", |_, ctx, _, reply| {
                    let _ = ctx.schedule(move |_, _| {
                        let _reply = reply;
                        panic!("relay lost");
                    });
                })
        }

        async fn pre_start(
            &mut self,
            _ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            if self.failed {
                Err(Error::Start("PreStart failed".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn post_stop(
            &mut self,
            _ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            debug!("Post stop");
            Ok(())
        }
    }

    /// Takes its time to stop.
    pub struct Lingering;

    #[async_trait]
    impl Actor for Lingering {
        fn methods() -> MethodTable<Self> {
            MethodTable::new().method("hit", |_, _, _| Ok(Value::Null))
        }

        async fn pre_stop(
            &mut self,
            _ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    fn spawn<A: Actor>(system: &SystemRef, actor: A) -> (ActorHandle, oneshot::Receiver<bool>) {
        let (mut runner, handle) =
            ActorRunner::create(ActorPath::from("/test"), actor, 10);
        let inner_system = system.clone();
        let (start, started) = oneshot::channel();
        tokio::spawn(
            async move {
                runner.init(inner_system, Some(start)).await;
            }
            .in_current_span(),
        );
        (handle, started)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_actor_lifecycle() {
        let system = SystemRef::new(Default::default(), CancellationToken::new());
        let (handle, started) = spawn(&system, TestActor { failed: false });
        assert_eq!(started.await, Ok(true));

        let outbox = Outbox::new("/");
        let echo = handle
            .method("echo")
            .ask(&outbox, args!["hi"], Duration::from_secs(1))
            .await;
        assert_eq!(echo, Ok(Value::from("hi")));

        let boom = handle
            .method("boom")
            .ask(&outbox, args![], Duration::from_secs(1))
            .await;
        assert_eq!(
            boom,
            Err(Error::Failure(ActorPath::from("/test"), "boom".to_owned()))
        );

        handle.method("stop").send(&outbox, args![]).unwrap();
        handle.ask_stop().await;
        assert!(handle.is_closed());

        assert!(logs_contain("Creating new actor runner"));
        assert!(logs_contain("Initializing actor /test runner"));
        assert!(logs_contain("Creating actor /test context"));
        assert!(logs_contain("Actor /test is created"));
        assert!(logs_contain("Actor /test is started"));
        assert!(logs_contain("Running actor /test"));
        assert!(logs_contain("Post stop"));
        assert!(logs_contain("Actor /test is terminated"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_actor_failed_to_start() {
        let system = SystemRef::new(Default::default(), CancellationToken::new());
        let (handle, started) = spawn(&system, TestActor { failed: true });
        assert_eq!(started.await, Ok(false));
        assert!(handle.is_closed());
        assert!(logs_contain("Actor /test failed to start"));
        assert!(logs_contain("Actor /test is faulty"));
        assert!(logs_contain("Actor /test is terminated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_actor_rejects_letters() {
        let system = SystemRef::new(Default::default(), CancellationToken::new());
        let (handle, started) = spawn(&system, Lingering);
        assert_eq!(started.await, Ok(true));
        let outbox = Outbox::new("/");

        handle.tell_stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_closed());
        assert_eq!(
            handle.method("hit").send(&outbox, args![]),
            Err(Error::Closed(ActorPath::from("/test")))
        );
        assert_eq!(
            handle
                .method("hit")
                .ask(&outbox, args![], Duration::from_secs(1))
                .await,
            Err(Error::Closed(ActorPath::from("/test")))
        );
        handle.ask_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_panic_fails_captured_reply() {
        let system = SystemRef::new(Default::default(), CancellationToken::new());
        let (handle, started) = spawn(&system, TestActor { failed: false });
        assert_eq!(started.await, Ok(true));

        let relay = handle
            .method("relay")
            .ask(&Outbox::new("/"), args![], Duration::from_secs(30))
            .await;
        assert_eq!(
            relay,
            Err(Error::Failure(ActorPath::from("/test"), "relay lost".to_owned()))
        );
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "panic");
    }
}
