//! Event and messaging system.
//!
//! A keyed multi-subscriber dispatcher. Handlers subscribe to an event kind
//! (or to [`WILDCARD`]) and are invoked in subscription order. A handler that
//! returns an error or panics is logged and skipped; its siblings still run.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
};

use tracing::{error, warn};

/// Subscription key that receives every event.
pub const WILDCARD: &str = "*";

/// Anything that can be routed by a string discriminator.
pub trait Event {
    fn kind(&self) -> &str;
}

/// Returned by [`Dispatcher::on`]; pass it to [`Dispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type Handler<E> = Box<dyn FnMut(&E) -> anyhow::Result<()> + Send>;

/// Ordered handler lists per key plus a wildcard list.
pub struct Dispatcher<E> {
    next_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, Handler<E>)>>,
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            handlers: HashMap::new(),
        }
    }
}

impl<E: Event> Dispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `kind`.
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&E) -> anyhow::Result<()> + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(kind.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Removes a subscription. Returns false if it was not registered under `kind`.
    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(kind);
        }
        removed
    }

    /// Number of handlers that would see an event of `kind`.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        let direct = self.handlers.get(kind).map_or(0, Vec::len);
        let wild = if kind == WILDCARD {
            0
        } else {
            self.handlers.get(WILDCARD).map_or(0, Vec::len)
        };
        direct + wild
    }

    /// Delivers `event` to its kind's handlers, then to wildcard handlers.
    ///
    /// Returns how many handlers completed without error.
    pub fn dispatch(&mut self, event: &E) -> usize {
        let kind = event.kind().to_string();
        let mut delivered = Self::run_list(self.handlers.get_mut(&kind), &kind, event);
        if kind != WILDCARD {
            delivered += Self::run_list(self.handlers.get_mut(WILDCARD), &kind, event);
        }
        delivered
    }

    fn run_list(list: Option<&mut Vec<(HandlerId, Handler<E>)>>, kind: &str, event: &E) -> usize {
        let Some(list) = list else {
            return 0;
        };
        let mut delivered = 0;
        for (id, handler) in list.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(kind, handler = ?id, error = %e, "Event handler failed"),
                Err(_) => error!(kind, handler = ?id, "Event handler panicked"),
            }
        }
        delivered
    }
}
