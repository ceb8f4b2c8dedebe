// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Envelopes
//!
//! The unit of dispatch: target, method, arguments and, for queries, the expiry and the
//! reply the callee completes. An envelope is immutable once built; the inbox takes it apart
//! only to invoke the method.
//!

use crate::{ActorPath, Args, query::Reply};

use tokio::time::Instant;

use std::collections::HashMap;

/// Envelope headers.
pub type Headers = HashMap<String, String>;

#[derive(Debug)]
pub struct Envelope {
    headers: Headers,
    origin: ActorPath,
    target: ActorPath,
    method: String,
    args: Args,
    expiry: Option<Instant>,
    reply: Reply,
}

/// An envelope taken apart by the inbox that dispatches it.
pub(crate) struct Parts {
    pub(crate) headers: Headers,
    pub(crate) origin: ActorPath,
    pub(crate) method: String,
    pub(crate) args: Args,
    pub(crate) expiry: Option<Instant>,
    pub(crate) reply: Reply,
}

impl Envelope {
    pub(crate) fn new(
        headers: Headers,
        origin: ActorPath,
        target: ActorPath,
        method: &str,
        args: Args,
        expiry: Option<Instant>,
        reply: Reply,
    ) -> Self {
        Self {
            headers,
            origin,
            target,
            method: method.to_owned(),
            args,
            expiry,
            reply,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Path of the outbox that produced the envelope.
    pub fn origin(&self) -> &ActorPath {
        &self.origin
    }

    pub fn target(&self) -> &ActorPath {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// True when the envelope belongs to a query.
    pub fn is_query(&self) -> bool {
        self.reply.is_expected()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    pub(crate) fn into_parts(self) -> Parts {
        Parts {
            headers: self.headers,
            origin: self.origin,
            method: self.method,
            args: self.args,
            expiry: self.expiry,
            reply: self.reply,
        }
    }

    /// Drops the envelope without touching the caller's sink.
    pub(crate) fn disarm(self) {
        self.reply.disarm();
    }
}
