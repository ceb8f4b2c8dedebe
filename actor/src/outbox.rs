// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Outbox
//!
//! Explicit origin of every envelope. Each actor context owns one rooted at the actor's path;
//! code outside the system gets one from `SystemRef::outbox`. Envelopes sent through the same
//! outbox to the same inbox are dequeued in send order.
//!

use crate::{
    ActorPath, Args,
    envelope::{Envelope, Headers},
    query::Reply,
};

use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct Outbox {
    origin: ActorPath,
    headers: Headers,
}

impl Outbox {
    pub fn new(origin: impl Into<ActorPath>) -> Self {
        Self {
            origin: origin.into(),
            headers: Headers::new(),
        }
    }

    /// Adds a header copied into every envelope built by this outbox.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn origin(&self) -> &ActorPath {
        &self.origin
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub(crate) fn envelope(
        &self,
        target: &ActorPath,
        method: &str,
        args: Args,
        expiry: Option<Instant>,
        reply: Reply,
    ) -> Envelope {
        Envelope::new(
            self.headers.clone(),
            self.origin.clone(),
            target.clone(),
            method,
            args,
            expiry,
            reply,
        )
    }
}
