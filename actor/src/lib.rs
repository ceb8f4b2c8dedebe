// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Relay Actor Runtime
//!
//! An in-process actor runtime built on message passing. Actors are plain state reachable only
//! through handles; every call is an envelope enqueued on the target's inbox and executed with
//! exclusive access to that state.
//!
//! ## Core Architecture
//!
//! ### Inboxes and outboxes
//!
//! Each actor owns an inbox, drained by one tokio task. The inbox invokes one method at a time,
//! so a handler never observes concurrent access to its actor. Every enqueue happens from an
//! [`Outbox`], the explicit origin of the envelope; envelopes from the same outbox to the same
//! inbox are handled in the order they were sent.
//!
//! ### Dispatch
//!
//! An actor type declares its methods once, in an explicit [`MethodTable`]. Handles resolve a
//! [`MethodRef`] by name; `send` is fire-and-forget, `query` carries a [`ResultSink`] and an
//! absolute expiry. Dispatch errors (unknown address, closed handle, unknown method) are
//! returned synchronously. Everything else reaches the sink, exactly once: the result, a
//! handler failure, `Error::Timeout`, or `Error::Cancelled`.
//!
//! ### Pipes
//!
//! A [`Pipe`] streams values from one producer to one consumer's stream method through a
//! bounded [`RingBuffer`]. A three-state wake protocol guarantees that at most one drain
//! notification is in flight per pipe, however fast the producer is. A full ring rejects the
//! value with `Error::Backpressure`.
//!
//! ### Publish / subscribe
//!
//! A [`PubSubNode`] broadcasts each published value to its subscribers in address order and
//! hands it to one of its consumers, round-robin. [`Topic`] wraps a node in an actor.
//!
//! ## Getting Started
//!
//! ```ignore
//! use actor::*;
//! use async_trait::async_trait;
//! use std::time::Duration;
//!
//! struct Calc;
//!
//! #[async_trait]
//! impl Actor for Calc {
//!     fn methods() -> MethodTable<Self> {
//!         MethodTable::new().method("add", |_, _, args| {
//!             Ok(Value::from(args.int(0)? + args.int(1)?))
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let (system, mut runner) = ActorSystem::create(CancellationToken::new());
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let calc = system.register("/calc", Calc).await?;
//!     let sum = calc
//!         .method("add")
//!         .ask(&system.outbox(), args![2, 3], Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(sum, Value::Int(5));
//!
//!     system.stop_system();
//!     Ok(())
//! }
//! ```
//!

mod actor;
mod config;
mod envelope;
mod error;
mod handler;
mod outbox;
mod path;
mod pipe;
mod pubsub;
mod query;
mod ring;
mod runner;
mod sink;
mod system;
mod value;

//
// Actors and their addresses
//

/// The trait every actor implements: its dispatch table and lifecycle hooks.
pub use actor::Actor;

/// Context handed to every handler: origin, outbox, queries, pipes and children.
pub use actor::ActorContext;

pub use actor::{ActorHandle, MethodRef};

pub use runner::ActorLifecycle;

pub use path::ActorPath;

//
// Dispatch
//

pub use handler::{CallFn, DeferredFn, Letter, Mailbox, MethodTable, StreamFn};

pub use envelope::{Envelope, Headers};

pub use outbox::Outbox;

pub use value::{Args, Value};

//
// Queries
//

pub use query::{QueryToken, Reply};

pub use sink::{BoxedSink, FnSink, ResultSink, sink_fn};

//
// Streaming
//

pub use pipe::{Pipe, StreamEvent, Subscription, Wake, WakeState};

pub use ring::{DEFAULT_CAPACITY, RingBuffer};

//
// Publish / subscribe
//

pub use pubsub::{PubSubNode, Publication, Topic};

//
// System
//

/// Error type shared by every operation of the runtime.
pub use error::Error;

pub use config::SystemConfig;

pub use system::{ActorSystem, SystemEvent, SystemRef, SystemRunner};

pub use tokio_util::sync::CancellationToken;
