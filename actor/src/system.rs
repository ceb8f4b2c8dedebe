// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor system
//!
//! The `SystemRef` is the registry of running actors and the entry point for code outside
//! them: it registers actors, resolves addresses to handles, and hands out outboxes and pipes.
//! The `SystemRunner` returned alongside it completes once the cancellation token has been
//! triggered and every registered actor has stopped.
//!

use crate::{
    Actor, ActorHandle, ActorPath, Args, Error, MethodRef, Value,
    config::SystemConfig,
    outbox::Outbox,
    pipe::Pipe,
    runner::ActorRunner,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tracing::{Instrument, debug, error};

use std::{collections::HashMap, sync::Arc};

/// Actor system factory.
pub struct ActorSystem {}

impl ActorSystem {
    /// Creates an actor system with the default configuration.
    pub fn create(token: CancellationToken) -> (SystemRef, SystemRunner) {
        Self::with_config(SystemConfig::default(), token)
    }

    /// Creates an actor system. Cancelling `token` shuts it down.
    pub fn with_config(
        config: SystemConfig,
        token: CancellationToken,
    ) -> (SystemRef, SystemRunner) {
        let (event_sender, event_receiver) = mpsc::channel(100);
        let system = SystemRef::new(config, token);
        system.watch(event_sender);
        let runner = SystemRunner::new(event_receiver);
        (system, runner)
    }
}

/// System events.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Every registered actor has stopped.
    StopSystem,
}

/// Shared handle to the actor system.
#[derive(Clone)]
pub struct SystemRef {
    /// Running actors by address.
    actors: Arc<RwLock<HashMap<ActorPath, ActorHandle>>>,
    /// Actors registered through `register`, stopped on shutdown in reverse order.
    roots: Arc<Mutex<Vec<ActorHandle>>>,
    config: Arc<SystemConfig>,
    token: CancellationToken,
}

impl SystemRef {
    /// Creates an empty system. Nothing stops it on its own; see [`ActorSystem::create`].
    pub fn new(config: SystemConfig, token: CancellationToken) -> Self {
        SystemRef {
            actors: Arc::new(RwLock::new(HashMap::new())),
            roots: Arc::new(Mutex::new(Vec::new())),
            config: Arc::new(config),
            token,
        }
    }

    /// Stops the registered actors once the token is cancelled.
    fn watch(&self, event_sender: mpsc::Sender<SystemEvent>) {
        let system = self.clone();
        tokio::spawn(
            async move {
                system.token.cancelled().await;
                debug!("Stopping actor system...");
                loop {
                    let root = system.roots.lock().pop();
                    match root {
                        Some(root) => root.ask_stop().await,
                        None => break,
                    }
                }
                let _ = event_sender.send(SystemEvent::StopSystem).await;
            }
            .in_current_span(),
        );
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Registers `actor` at `address`, used verbatim, and waits for its `pre_start`.
    ///
    /// # Errors
    ///
    /// `Error::Exists` if the address is taken, `Error::Start` if `pre_start` fails or does
    /// not finish within `SystemConfig::start_timeout_ms`.
    pub async fn register<A>(
        &self,
        address: impl Into<ActorPath>,
        actor: A,
    ) -> Result<ActorHandle, Error>
    where
        A: Actor,
    {
        let path = address.into();
        if path.is_empty() {
            return Err(Error::Functional(
                "Cannot register an actor at the root address".to_owned(),
            ));
        }
        let (handle, started) = self.spawn_actor(path.clone(), actor)?;
        {
            let mut roots = self.roots.lock();
            roots.retain(|root| !root.is_closed());
            roots.push(handle.clone());
        }
        match tokio::time::timeout(self.config.start_timeout(), started).await {
            Ok(Ok(true)) => Ok(handle),
            Ok(_) => Err(Error::Start(format!("Runner can not init {}", path))),
            Err(_) => {
                handle.tell_stop();
                Err(Error::Start(format!("Actor {} did not start in time", path)))
            }
        }
    }

    /// Inserts the actor in the registry and spawns its inbox task.
    pub(crate) fn spawn_actor<A>(
        &self,
        path: ActorPath,
        actor: A,
    ) -> Result<(ActorHandle, oneshot::Receiver<bool>), Error>
    where
        A: Actor,
    {
        let (mut runner, handle) =
            ActorRunner::create(path.clone(), actor, self.config.stop_capacity);
        {
            let mut actors = self.actors.write();
            if actors.contains_key(&path) {
                error!("Actor '{}' already exists!", &path);
                return Err(Error::Exists(path));
            }
            actors.insert(path, handle.clone());
        }

        let (sender, receiver) = oneshot::channel::<bool>();
        let system = self.clone();
        tokio::spawn(
            async move {
                runner.init(system, Some(sender)).await;
            }
            .in_current_span(),
        );
        Ok((handle, receiver))
    }

    /// Registry lookup of a running actor.
    pub fn resolve(&self, address: impl Into<ActorPath>) -> Result<ActorHandle, Error> {
        let path = address.into();
        let actors = self.actors.read();
        match actors.get(&path) {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(Error::NotFound(path)),
        }
    }

    /// Hierarchical lookup.
    ///
    /// An address that is not registered is resolved by its nearest registered ancestor,
    /// whose `on_lookup` hook is asked for each remaining segment in turn.
    pub async fn lookup(
        &self,
        address: impl Into<ActorPath>,
    ) -> Result<ActorHandle, Error> {
        let path = address.into();
        if let Ok(handle) = self.resolve(&path) {
            return Ok(handle);
        }

        let mut ancestor = path.parent();
        let mut current = loop {
            if ancestor.is_empty() {
                return Err(Error::NotFound(path));
            }
            if let Ok(handle) = self.resolve(&ancestor) {
                break handle;
            }
            ancestor = ancestor.parent();
        };

        let segments = path.relative_to(&ancestor).unwrap_or_default();
        for segment in segments {
            debug!("Forwarding lookup of '{}' to {}.", segment, current.path());
            current = current
                .lookup(segment)
                .await
                .map_err(|_| Error::NotFound(path.clone()))?;
        }
        Ok(current)
    }

    /// Method reference of a registered actor.
    pub fn method(
        &self,
        address: impl Into<ActorPath>,
        name: &str,
    ) -> Result<MethodRef, Error> {
        Ok(self.resolve(address)?.method(name))
    }

    /// Looks the actor up and queries one of its methods with the configured timeout.
    pub async fn ask(
        &self,
        address: impl Into<ActorPath>,
        method: &str,
        args: impl Into<Args>,
    ) -> Result<Value, Error> {
        let method = self.lookup(address).await?.method(method);
        method
            .ask(&self.outbox(), args, self.config.query_timeout())
            .await
    }

    /// Outbox for callers outside any actor.
    pub fn outbox(&self) -> Outbox {
        Outbox::new(ActorPath::default())
    }

    /// Opens a pipe from outside any actor, with the configured ring capacity.
    pub fn pipe(&self, consumer: &MethodRef) -> Result<Pipe, Error> {
        Pipe::open(consumer.clone(), self.config.pipe_capacity)
    }

    pub(crate) fn remove_actor(&self, path: &ActorPath) {
        let mut actors = self.actors.write();
        actors.remove(path);
    }

    /// Stops the actor at `address` and waits for it. Unknown addresses are ignored.
    pub async fn stop_actor(&self, address: impl Into<ActorPath>) {
        if let Ok(handle) = self.resolve(address) {
            handle.ask_stop().await;
        }
    }

    pub fn stop_system(&self) {
        self.token.cancel();
    }

    /// Addresses registered directly below `address`.
    pub fn children(&self, address: impl Into<ActorPath>) -> Vec<ActorPath> {
        let path = address.into();
        let actors = self.actors.read();
        let mut children: Vec<ActorPath> = actors
            .keys()
            .filter(|actor| actor.is_child_of(&path))
            .cloned()
            .collect();
        children.sort();
        children
    }
}

/// Completes once the actor system has shut down.
pub struct SystemRunner {
    event_receiver: mpsc::Receiver<SystemEvent>,
}

impl SystemRunner {
    pub(crate) fn new(event_receiver: mpsc::Receiver<SystemEvent>) -> Self {
        Self { event_receiver }
    }

    pub async fn run(&mut self) {
        debug!("Running actor system...");
        if let Some(SystemEvent::StopSystem) = self.event_receiver.recv().await {
            debug!("Actor system stopped.");
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{ActorContext, MethodTable, args};

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use std::time::Duration;

    struct Folder;

    #[async_trait]
    impl Actor for Folder {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
                .method("name", |_, ctx, _| Ok(Value::from(ctx.path().key())))
                .method("mkdir", |_, ctx, args| {
                    let name = args.str(0)?.to_owned();
                    ctx.create_child(&name, Folder)?;
                    Ok(Value::Null)
                })
        }

        fn on_lookup(
            &mut self,
            name: &str,
            ctx: &mut ActorContext<Self>,
        ) -> Option<ActorHandle> {
            if name.starts_with("auto") {
                ctx.get_child(name)
                    .or_else(|| ctx.create_child(name, Folder).ok())
            } else {
                ctx.get_child(name)
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl Actor for Broken {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }

        async fn pre_start(
            &mut self,
            _ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            Err(Error::Start("broken".to_owned()))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stop_actor_system() {
        let token = CancellationToken::new();
        let (system, mut runner) = ActorSystem::create(token.clone());
        let folder = system.register("/home", Folder).await.unwrap();

        let handle = tokio::spawn(
            async move {
                runner.run().await;
            }
            .in_current_span(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(logs_contain("Running actor system..."));
        token.cancel();
        handle.await.unwrap();

        assert!(folder.is_closed());
        assert!(system.resolve("/home").is_err());
        assert!(logs_contain("Stopping actor system..."));
        assert!(logs_contain("Actor system stopped."));
    }

    #[tokio::test]
    async fn test_duplicate_and_failed_registration() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        system.register("/home", Folder).await.unwrap();
        assert_eq!(
            system.register("/home", Folder).await.err(),
            Some(Error::Exists(ActorPath::from("/home")))
        );
        assert!(matches!(
            system.register("/broken", Broken).await,
            Err(Error::Start(_))
        ));
        assert!(matches!(
            system.register("/", Folder).await,
            Err(Error::Functional(_))
        ));
    }

    #[tokio::test]
    async fn test_hierarchical_lookup() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let home = system.register("/home", Folder).await.unwrap();
        home.method("mkdir")
            .ask(&system.outbox(), args!["docs"], Duration::from_secs(1))
            .await
            .unwrap();

        // Registered children resolve directly.
        let docs = system.lookup("/home/docs").await.unwrap();
        assert_eq!(docs.path(), &ActorPath::from("/home/docs"));
        assert_eq!(
            system.children("/home"),
            vec![ActorPath::from("/home/docs")]
        );

        // Unregistered segments go through the ancestors' lookup hook.
        let deep = system.lookup("/home/docs/auto1/auto2").await.unwrap();
        assert_eq!(deep.path(), &ActorPath::from("/home/docs/auto1/auto2"));
        let name = system
            .ask("/home/docs/auto1/auto2", "name", args![])
            .await
            .unwrap();
        assert_eq!(name, Value::from("auto2"));

        assert_eq!(
            system.lookup("/home/missing/x").await.err(),
            Some(Error::NotFound(ActorPath::from("/home/missing/x")))
        );
        assert_eq!(
            system.lookup("/nowhere").await.err(),
            Some(Error::NotFound(ActorPath::from("/nowhere")))
        );
    }

    #[tokio::test]
    async fn test_stop_parent_stops_children() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let home = system.register("/home", Folder).await.unwrap();
        home.method("mkdir")
            .ask(&system.outbox(), args!["docs"], Duration::from_secs(1))
            .await
            .unwrap();
        let docs = system.resolve("/home/docs").unwrap();

        system.stop_actor("/home").await;
        assert!(home.is_closed());
        assert!(docs.is_closed());
        assert!(system.children("/home").is_empty());
    }
}
