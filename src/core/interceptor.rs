// src/core/interceptor.rs

//! Operation and connection interceptors.
//!
//! Interceptors are capability interfaces with default no-op methods:
//! implementors override only the hooks they care about. Before-hooks may
//! transform an op or drop it silently; a before-hook error rejects the op
//! and nothing else.

use crate::core::errors::OlivineError;
use crate::core::permissions::Principal;
use crate::core::protocol::{EventPayload, MapOp};
use async_trait::async_trait;
use std::sync::Arc;

/// The per-operation context handed to every interceptor and to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub session_id: Option<u64>,
    pub principal: Option<Arc<Principal>>,
    pub authenticated: bool,
    pub from_cluster: bool,
    /// The session (local) or node (cluster) that originated the op; excluded
    /// from the resulting broadcast.
    pub origin_sender: Option<String>,
}

#[async_trait]
pub trait OpInterceptor: Send + Sync {
    /// Runs before the CRDT merge. Return the (possibly transformed) op to
    /// continue, or `None` to drop it silently.
    async fn on_before_op(
        &self,
        op: MapOp,
        _ctx: &OpContext,
    ) -> Result<Option<MapOp>, OlivineError> {
        Ok(Some(op))
    }

    /// Runs after a successful apply, fire-and-forget.
    async fn on_after_op(&self, _op: &MapOp, _payload: &EventPayload, _ctx: &OpContext) {}

    /// Runs when a transport connects. Returning `false` rejects the
    /// connection, which is closed with code 4000.
    async fn on_connect(&self, _session_id: u64) -> bool {
        true
    }

    /// Runs once per session close.
    async fn on_disconnect(&self, _session_id: u64) {}
}
