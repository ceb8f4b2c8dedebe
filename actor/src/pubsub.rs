// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Publish / subscribe
//!
//! A [`PubSubNode`] fans one published stream out two ways at once: every subscriber gets
//! every value, in address order, and exactly one consumer gets each value, chosen round-robin
//! by the publish sequence. Closed targets are pruned while publishing.
//!
//! The node is plain data meant to live inside an actor. [`Topic`] is a ready-made actor
//! wrapping one.
//!

use crate::{
    ActorContext, ActorPath, Args, Error, MethodRef, Value,
    actor::Actor,
    args,
    handler::MethodTable,
    outbox::Outbox,
};

use async_trait::async_trait;
use tracing::debug;

use std::collections::{BTreeMap, BTreeSet};

/// Outcome of one publish pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    /// Sequence number of the publish.
    pub sequence: u64,
    /// Subscribers and consumer that accepted the value.
    pub delivered: usize,
    /// Targets dropped because they could no longer receive.
    pub pruned: usize,
}

/// Fan-out point for broadcast subscribers and round-robin consumers.
#[derive(Debug)]
pub struct PubSubNode {
    address: ActorPath,
    subscribers: BTreeSet<MethodRef>,
    consumers: Vec<MethodRef>,
    sequence: u64,
}

impl PubSubNode {
    pub fn new(address: impl Into<ActorPath>) -> Self {
        Self {
            address: address.into(),
            subscribers: BTreeSet::new(),
            consumers: Vec::new(),
            sequence: 0,
        }
    }

    pub fn address(&self) -> &ActorPath {
        &self.address
    }

    /// Adds a broadcast subscriber. Returns false if it was already subscribed.
    pub fn subscribe(&mut self, subscriber: MethodRef) -> bool {
        self.subscribers.insert(subscriber)
    }

    /// Appends a round-robin consumer.
    pub fn consume(&mut self, consumer: MethodRef) {
        self.consumers.push(consumer);
    }

    fn remove_where<F>(&mut self, matches: F) -> usize
    where
        F: Fn(&MethodRef) -> bool,
    {
        let before = self.subscribers.len() + self.consumers.len();
        self.subscribers.retain(|subscriber| !matches(subscriber));
        self.consumers.retain(|consumer| !matches(consumer));
        before - self.subscribers.len() - self.consumers.len()
    }

    /// Removes `target` from subscribers and consumers. Returns true if it was present.
    pub fn unsubscribe(&mut self, target: &MethodRef) -> bool {
        self.remove_where(|candidate| candidate == target) > 0
    }

    /// Same as [`PubSubNode::unsubscribe`], for a target that may no longer be resolvable.
    pub fn unsubscribe_named(&mut self, address: &ActorPath, method: &str) -> bool {
        self.remove_where(|candidate| {
            candidate.handle().path() == address && candidate.name() == method
        }) > 0
    }

    /// Removes every subscription of the actor at `address`. Returns how many were removed.
    pub fn cancel(&mut self, address: &ActorPath) -> usize {
        self.remove_where(|candidate| candidate.handle().path() == address)
    }

    /// Publishes `value` to every open subscriber and to one consumer.
    pub fn publish(&mut self, outbox: &Outbox, value: Value) -> Publication {
        let sequence = self.sequence;
        self.sequence += 1;

        let mut delivered = 0;
        let mut pruned = 0;
        let address = &self.address;
        self.subscribers.retain(|subscriber| {
            match subscriber.send(outbox, args![value.clone()]) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(error) => {
                    debug!("Pruning subscriber {:?} of {}: {}", subscriber, address, error);
                    pruned += 1;
                    false
                }
            }
        });

        let before = self.consumers.len();
        self.consumers.retain(|consumer| !consumer.is_closed());
        pruned += before - self.consumers.len();
        if !self.consumers.is_empty() {
            let index = (sequence % self.consumers.len() as u64) as usize;
            match self.consumers[index].send(outbox, args![value]) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    let consumer = self.consumers.remove(index);
                    debug!("Pruning consumer {:?} of {}: {}", consumer, address, error);
                    pruned += 1;
                }
            }
        }

        Publication {
            sequence,
            delivered,
            pruned,
        }
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &MethodRef> {
        self.subscribers.iter()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &MethodRef> {
        self.consumers.iter()
    }

    /// Number of publishes so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Actor wrapping a [`PubSubNode`].
///
/// Methods:
/// - `subscribe(address, method)`: returns whether the subscriber is new.
/// - `consume(address, method)`
/// - `unsubscribe(address, method)`: returns whether anything was removed.
/// - `cancel(address)`: returns how many subscriptions were removed.
/// - `publish(value)`: returns the number of deliveries.
/// - `stats()`: map with `subscribers`, `consumers` and `sequence`.
#[derive(Debug)]
pub struct Topic {
    node: PubSubNode,
}

impl Topic {
    pub fn new() -> Self {
        Self {
            node: PubSubNode::new(ActorPath::default()),
        }
    }

    pub fn node(&self) -> &PubSubNode {
        &self.node
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new()
    }
}

fn target(ctx: &ActorContext<Topic>, args: &Args) -> Result<MethodRef, Error> {
    let address = args.str(0)?;
    let method = args.str(1)?;
    ctx.system().method(address, method)
}

#[async_trait]
impl Actor for Topic {
    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .method("subscribe", |topic: &mut Topic, ctx, args| {
                let subscriber = target(ctx, &args)?;
                Ok(Value::from(topic.node.subscribe(subscriber)))
            })
            .method("consume", |topic: &mut Topic, ctx, args| {
                let consumer = target(ctx, &args)?;
                topic.node.consume(consumer);
                Ok(Value::Null)
            })
            .method("unsubscribe", |topic: &mut Topic, _, args| {
                let address = ActorPath::from(args.str(0)?);
                let removed = topic.node.unsubscribe_named(&address, args.str(1)?);
                Ok(Value::from(removed))
            })
            .method("cancel", |topic: &mut Topic, _, args| {
                let address = ActorPath::from(args.str(0)?);
                Ok(Value::from(topic.node.cancel(&address)))
            })
            .method("publish", |topic: &mut Topic, ctx, args| {
                let value = args.into_first();
                let publication = topic.node.publish(ctx.outbox(), value);
                Ok(Value::from(publication.delivered))
            })
            .method("stats", |topic: &mut Topic, _, _| {
                let node = &topic.node;
                let mut stats = BTreeMap::new();
                stats.insert(
                    "subscribers".to_owned(),
                    Value::from(node.subscribers.len()),
                );
                stats.insert("consumers".to_owned(), Value::from(node.consumers.len()));
                stats.insert("sequence".to_owned(), Value::Int(node.sequence as i64));
                Ok(Value::from(stats))
            })
    }

    async fn pre_start(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), Error> {
        self.node.address = ctx.path().clone();
        debug!("Topic {} is ready.", ctx.path());
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{ActorHandle, ActorSystem};

    use tokio_util::sync::CancellationToken;

    use std::time::Duration;

    #[derive(Default)]
    struct Collector {
        values: Vec<Value>,
    }

    #[async_trait]
    impl Actor for Collector {
        fn methods() -> MethodTable<Self> {
            MethodTable::new()
                .method("push", |collector: &mut Collector, _, args| {
                    collector.values.push(args.into_first());
                    Ok(Value::Null)
                })
                .method("values", |collector: &mut Collector, _, _| {
                    Ok(Value::List(collector.values.clone()))
                })
        }
    }

    async fn values(handle: &ActorHandle, outbox: &Outbox) -> Value {
        handle
            .method("values")
            .ask(outbox, args![], Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_consumers() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let outbox = system.outbox();
        let mut node = PubSubNode::new("/topic");
        let mut collectors = Vec::new();
        for index in 0..3 {
            let handle = system
                .register(format!("/consumer{}", index), Collector::default())
                .await
                .unwrap();
            node.consume(handle.method("push"));
            collectors.push(handle);
        }

        for value in 1..=6 {
            let publication = node.publish(&outbox, Value::from(value));
            assert_eq!(publication.delivered, 1);
        }
        assert_eq!(node.sequence(), 6);

        assert_eq!(values(&collectors[0], &outbox).await, Value::from(vec![1, 4]));
        assert_eq!(values(&collectors[1], &outbox).await, Value::from(vec![2, 5]));
        assert_eq!(values(&collectors[2], &outbox).await, Value::from(vec![3, 6]));
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_subscribers() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let outbox = system.outbox();
        let mut node = PubSubNode::new("/topic");
        let a = system.register("/a", Collector::default()).await.unwrap();
        let b = system.register("/b", Collector::default()).await.unwrap();
        let c = system.register("/c", Collector::default()).await.unwrap();
        assert!(node.subscribe(c.method("push")));
        assert!(node.subscribe(a.method("push")));
        assert!(node.subscribe(b.method("push")));
        assert!(!node.subscribe(a.method("push")));

        let order: Vec<String> = node
            .subscribers()
            .map(|subscriber| subscriber.handle().path().to_string())
            .collect();
        assert_eq!(order, vec!["/a", "/b", "/c"]);

        b.ask_stop().await;
        let publication = node.publish(&outbox, Value::from("hello"));
        assert_eq!(publication.delivered, 2);
        assert_eq!(publication.pruned, 1);
        assert_eq!(node.subscribers().count(), 2);
        assert_eq!(values(&a, &outbox).await, Value::from(vec!["hello"]));
        assert_eq!(values(&c, &outbox).await, Value::from(vec!["hello"]));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_cancel() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let mut node = PubSubNode::new("/topic");
        let a = system.register("/a", Collector::default()).await.unwrap();
        node.subscribe(a.method("push"));
        node.consume(a.method("push"));
        node.consume(a.method("values"));
        assert!(node.unsubscribe(&a.method("push")));
        assert!(!node.unsubscribe(&a.method("push")));
        assert_eq!(node.consumers().count(), 1);
        assert_eq!(node.cancel(&ActorPath::from("/a")), 1);
        assert_eq!(node.cancel(&ActorPath::from("/a")), 0);
    }

    #[tokio::test]
    async fn test_topic_actor() {
        let (system, _) = ActorSystem::create(CancellationToken::new());
        let outbox = system.outbox();
        let timeout = Duration::from_secs(1);
        let topic = system.register("/news", Topic::new()).await.unwrap();
        let reader = system.register("/reader", Collector::default()).await.unwrap();
        let worker = system.register("/worker", Collector::default()).await.unwrap();

        let subscribe = topic.method("subscribe");
        assert_eq!(
            subscribe.ask(&outbox, args!["/reader", "push"], timeout).await,
            Ok(Value::Bool(true))
        );
        assert_eq!(
            subscribe.ask(&outbox, args!["/reader", "push"], timeout).await,
            Ok(Value::Bool(false))
        );
        assert_eq!(
            subscribe.ask(&outbox, args!["/ghost", "push"], timeout).await,
            Err(Error::NotFound(ActorPath::from("/ghost")))
        );
        topic
            .method("consume")
            .ask(&outbox, args!["/worker", "push"], timeout)
            .await
            .unwrap();

        let publish = topic.method("publish");
        assert_eq!(publish.ask(&outbox, args![7], timeout).await, Ok(Value::Int(2)));

        let stats = topic
            .method("stats")
            .ask(&outbox, args![], timeout)
            .await
            .unwrap();
        assert_eq!(stats.get("sequence"), Some(&Value::Int(1)));
        assert_eq!(stats.get("subscribers"), Some(&Value::Int(1)));

        assert_eq!(
            topic.method("cancel").ask(&outbox, args!["/worker"], timeout).await,
            Ok(Value::Int(1))
        );
        assert_eq!(publish.ask(&outbox, args![8], timeout).await, Ok(Value::Int(1)));
        assert_eq!(values(&reader, &outbox).await, Value::from(vec![7, 8]));
        assert_eq!(values(&worker, &outbox).await, Value::from(vec![7]));
    }
}
