//! The per-session filter pipeline. Queries run head to tail and terminate in
//! the router; replies run tail to head. A filter session answers every
//! `route_query` with a [`FilterAction`], so a buffer can be forwarded,
//! consumed, answered locally, or refused, but never silently dropped.

pub mod ldi;
pub mod ldi_parser;
pub mod namedserver;

use crate::buffer::BufChain;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::router::{ReplySummary, RouteInfo};
use crate::session::{SessionCtx, SessionInfo};

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

bitflags::bitflags! {
    /// What a filter wants to see flowing through it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterCaps: u64 {
        /// Complete single-statement buffers on the query path.
        const STMT_INPUT = 0x01;
        /// Complete result sets on the reply path.
        const RESULTSET_OUTPUT = 0x02;
    }
}

/// Why a filter refused its configuration.
#[derive(Debug, thiserror::Error)]
pub enum FilterConfigError {
    #[error("invalid regular expression {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("parameter {name}: {reason}")]
    BadParameter { name: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

impl From<FilterConfigError> for io::Error {
    fn from(e: FilterConfigError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    }
}

/// Downstream verdict for one buffer. Ownership of the buffer moves into the
/// action.
pub enum FilterAction {
    /// Pass this (possibly rewritten) buffer to the downstream neighbor.
    Forward(BufChain),
    /// The filter took ownership, e.g. queued the buffer behind a stream.
    Consumed,
    /// Answer the client directly with this payload; nothing is routed.
    Reply(BufChain),
    /// Refuse the buffer. The connection sends ERR and closes.
    Reject(ErrorKind, String),
}

/// Upstream verdict for one reply unit.
pub enum ReplyAction {
    Forward(BufChain),
    /// Swallow the unit (e.g. a LOCAL_INFILE prompt the filter answers
    /// itself).
    Consumed,
}

/// One stage of a session's filter chain. Implementations are worker-local.
pub trait FilterSession {
    fn route_query(&mut self, ctx: &mut SessionCtx, buf: BufChain) -> FilterAction;

    fn client_reply(
        &mut self,
        _ctx: &mut SessionCtx,
        buf: BufChain,
        _route: &RouteInfo,
        _summary: &ReplySummary,
    ) -> ReplyAction {
        ReplyAction::Forward(buf)
    }

    /// Teardown hook, run in reverse chain order; a filter may flush here.
    fn close(&mut self, _ctx: &mut SessionCtx) {}

    /// Read-only structured summary.
    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A filter module: configured once, instantiated per session.
#[async_trait(?Send)]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the per-session stage. Async because some filters resolve the
    /// client address against configured hostnames here.
    async fn new_session(&self, session: &SessionInfo) -> io::Result<Box<dyn FilterSession>>;

    fn capabilities(&self) -> FilterCaps {
        FilterCaps::STMT_INPUT
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Applies a new configuration snapshot. Filters publish the snapshot to
    /// all workers; sessions built before the change keep the snapshot they
    /// started with.
    fn post_configure(&self, _params: &HashMap<String, String>) -> io::Result<()> {
        Ok(())
    }
}

/// Builds a session's chain from the listener's ordered filter list.
pub async fn build_chain(
    filters: &[Arc<dyn Filter>],
    session: &SessionInfo,
) -> io::Result<Vec<Box<dyn FilterSession>>> {
    let mut chain = Vec::with_capacity(filters.len());
    for filter in filters {
        chain.push(filter.new_session(session).await?);
    }
    Ok(chain)
}
