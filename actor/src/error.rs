// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!
//! Every failure the runtime can report, from the synchronous dispatch errors returned at
//! enqueue time to the asynchronous ones delivered through a result sink.
//!

use crate::ActorPath;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the actor system.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// No actor is registered at the address.
    #[error("No actor registered at {0}.")]
    NotFound(ActorPath),
    /// The actor behind the handle has shut down.
    #[error("Actor {0} is closed.")]
    Closed(ActorPath),
    /// The actor's dispatch table has no such method.
    #[error("Actor {0} has no method '{1}'.")]
    UnknownMethod(ActorPath, String),
    /// An actor is already registered at the address.
    #[error("Actor {0} exist.")]
    Exists(ActorPath),
    /// The query expired before a result arrived.
    #[error("Query {0}:{1} timed out.")]
    Timeout(ActorPath, String),
    /// A bounded buffer refused the value.
    #[error("Buffer is full ({0} elements).")]
    Backpressure(usize),
    /// The method panicked while handling an envelope.
    #[error("Actor {0} failed: {1}")]
    Failure(ActorPath, String),
    /// The reply of a query was dropped without being completed.
    #[error("Query {0}:{1} was dropped without a reply.")]
    BrokenPromise(ActorPath, String),
    /// The producer side of a pipe failed.
    #[error("Pipe failed: {0}")]
    Pipe(String),
    /// The query was cancelled by its caller.
    #[error("Query cancelled.")]
    Cancelled,
    /// An argument is missing or has the wrong type.
    #[error("Invalid argument {0}: expected {1}.")]
    Argument(usize, String),
    /// An error occurred while starting an actor.
    #[error("An error occurred while starting the actor: {0}.")]
    Start(String),
    /// An error occurred while stopping an actor.
    #[error("An error occurred while stopping an actor.")]
    Stop,
    /// Error that does not compromise the operation of the system.
    #[error("Error: {0}")]
    Functional(String),
}

impl Error {
    /// True for the errors reported synchronously when an envelope cannot be enqueued.
    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Closed(_)
                | Error::UnknownMethod(..)
                | Error::Exists(_)
        )
    }
}
