// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Core library for the Relay framework.
//! Re-exports the actor runtime: handles and method references, inbox scheduling, queries,
//! pipes and publish/subscribe nodes.

pub use actor::{
    Actor, ActorContext, ActorHandle, ActorLifecycle, ActorPath, ActorSystem, Args,
    BoxedSink, CancellationToken, DEFAULT_CAPACITY, Envelope, Error as ActorError,
    Headers, Mailbox, MethodRef, MethodTable, Outbox, Pipe, PubSubNode, Publication,
    QueryToken, Reply, ResultSink, RingBuffer, StreamEvent, Subscription, SystemConfig,
    SystemEvent, SystemRef, SystemRunner, Topic, Value, WakeState, args, sink_fn,
};
