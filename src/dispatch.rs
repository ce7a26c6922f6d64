//! Handler registry: maps a message `type` to an ordered list of callbacks.
//!
//! DESIGN
//! ======
//! Registration is additive: a second handler for the same type runs after
//! the first, it never replaces it. Dispatch works on a snapshot of the list
//! (cheap `Arc` clones), so callers take their lock only for the lookup and
//! never hold it while a handler runs.
//!
//! ERROR HANDLING
//! ==============
//! Each handler is isolated: an `Err` return or a panic is caught, logged,
//! and recorded in the [`DispatchReport`]; the remaining handlers still run.
//! The caller decides how failures reach the peer.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use crate::message::Message;

// =============================================================================
// TYPES
// =============================================================================

/// Error type returned by business handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type HandlerFn<C> = Arc<dyn Fn(C, Message) -> HandlerFuture + Send + Sync>;

/// Outcome of running every handler registered for one message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that were invoked (including failed ones).
    pub invoked: usize,
    /// One entry per failed handler, in invocation order.
    pub failures: Vec<String>,
}

impl DispatchReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// `type -> [handler]`. `C` is the context handed to every handler.
pub struct HandlerRegistry<C> {
    handlers: HashMap<String, Vec<HandlerFn<C>>>,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<C> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("HandlerRegistry").field("handlers", &counts).finish()
    }
}

impl<C: Clone + Send + 'static> HandlerRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for `kind`.
    pub fn register_handler<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(C, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn<C> = Arc::new(move |ctx: C, msg: Message| -> HandlerFuture { Box::pin(handler(ctx, msg)) });
        self.push(kind.into(), handler);
    }

    /// Register a synchronous handler for `kind`.
    pub fn register_sync_handler<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(C, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: HandlerFn<C> =
            Arc::new(move |ctx: C, msg: Message| -> HandlerFuture { Box::pin(std::future::ready(handler(ctx, &msg))) });
        self.push(kind.into(), handler);
    }

    fn push(&mut self, kind: String, handler: HandlerFn<C>) {
        let list = self.handlers.entry(kind).or_default();
        list.push(handler);
        tracing::debug!(count = list.len(), "handler registered");
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.get(kind).is_some_and(|list| !list.is_empty())
    }

    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }

    /// Clone the handler list for `kind` so it can run outside any lock.
    #[must_use]
    pub fn snapshot(&self, kind: &str) -> HandlerSet<C> {
        HandlerSet { handlers: self.handlers.get(kind).cloned().unwrap_or_default() }
    }
}

// =============================================================================
// HANDLER SET
// =============================================================================

/// An owned, lock-free snapshot of the handlers for one type.
pub struct HandlerSet<C> {
    handlers: Vec<HandlerFn<C>>,
}

impl<C: Clone + Send + 'static> HandlerSet<C> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler in registration order with failure isolation.
    pub async fn dispatch(&self, kind: &str, ctx: C, msg: &Message) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in &self.handlers {
            report.invoked += 1;

            // A sync handler panics while building its future, an async one
            // while being polled; both are caught.
            let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx.clone(), msg.clone())));
            let outcome = match started {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            error!(kind, error = %failure, "handler failed");
            report.failures.push(failure);
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_owned()
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
