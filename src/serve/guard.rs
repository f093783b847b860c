//! Guards.
//!
//! Guards run before method dispatch. Application-wide guards run first,
//! ordered by `order` (lower first, registration order for ties), then the
//! guards bound on each node of the matched chain from root to leaf. The
//! first guard that returns a handler diverts the request to it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::{handler_fn, Guard, Handler};
use crate::serve::request::RequestContext;
use crate::serve::tree::{HandlerTree, NodeId};

/// Default order for guards registered without one.
pub const DEFAULT_ORDER: i32 = 100;

#[derive(Clone)]
struct Entry {
    order: i32,
    guard: Arc<dyn Guard>,
}

/// Application-wide guards.
#[derive(Clone, Default)]
pub struct GuardChain {
    entries: Vec<Entry>,
}

impl GuardChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guard: Arc<dyn Guard>) {
        self.push_with_order(guard, DEFAULT_ORDER);
    }

    pub fn push_with_order(&mut self, guard: Arc<dyn Guard>, order: i32) {
        self.entries.push(Entry { order, guard });
        // Stable sort keeps registration order among equal orders.
        self.entries.sort_by_key(|e| e.order);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run global guards, then node guards along `chain`.
    pub async fn check(
        &self,
        tree: &HandlerTree,
        chain: &[NodeId],
        ctx: &RequestContext,
    ) -> Option<(&'static str, Arc<dyn Handler>)> {
        let node_guards = chain
            .iter()
            .flat_map(|&id| tree.node(id).descriptor().guards.iter());
        for guard in self.entries.iter().map(|e| &e.guard).chain(node_guards) {
            if let Some(handler) = guard.check(ctx).await {
                return Some((guard.name(), handler));
            }
        }
        None
    }
}

impl std::fmt::Debug for GuardChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.guard.name(), e.order)))
            .finish()
    }
}

/// Diverts requests lacking a header to a fixed status.
pub struct RequireHeader {
    header: String,
    status: hyper::StatusCode,
}

impl RequireHeader {
    pub fn new(header: impl Into<String>, status: hyper::StatusCode) -> Self {
        Self {
            header: header.into(),
            status,
        }
    }
}

#[async_trait]
impl Guard for RequireHeader {
    async fn check(&self, ctx: &RequestContext) -> Option<Arc<dyn Handler>> {
        if ctx.header(&self.header).is_some() {
            return None;
        }
        let status = self.status;
        Some(handler_fn(move |out, _| {
            out.status(status).text(status.canonical_reason().unwrap_or("Error"));
            Ok(())
        }))
    }

    fn name(&self) -> &'static str {
        "require_header"
    }
}
