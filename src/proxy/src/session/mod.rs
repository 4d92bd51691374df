//! The session binds one authenticated client connection to its filter chain
//! and router session. Lifecycle states only move forward; teardown is
//! idempotent and releases resources in reverse acquisition order.

pub mod cursor;

use crate::buffer::BufChain;
use crate::filter::{FilterAction, FilterSession, ReplyAction};
use crate::protocol::mysql::basic::stmt_prepare_ok;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::router::{ErrorAction, ReplyInfoUnit, ReplySink, RouterSession};
use crate::server::statement::PsRegistry;
use crate::server::ClientAddr;
use crate::session::cursor::CursorRegistry;

use bytes::Bytes;
use mysql_common::constants::CapabilityFlags;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CURSOR_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Strictly monotonic session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Allocated,
    Ready,
    RouterReady,
    Stopping,
    Stopped,
}

/// Immutable facts about the session, fixed at authentication time. Routers
/// and filters read these; the `auth_token` is what a backend authenticator
/// re-presents when opening a backend connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub user: Option<String>,
    pub database: Option<String>,
    pub remote: ClientAddr,
    pub thread_id: u64,
    pub auth_token: Vec<u8>,
    pub external_identity: Option<String>,
    pub client_caps: CapabilityFlags,
    pub collation: u16,
}

/// An in-flight bulk-load stream feeding the session from a background
/// fetcher. Dropping it interrupts the fetch: the flag is observed per chunk
/// and the in-flight request returns promptly.
pub struct LdiStream {
    pub rx: mpsc::Receiver<Result<Bytes, String>>,
    pub cancel: Arc<AtomicBool>,
}

impl Drop for LdiStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Mutable per-session state shared with every filter session.
pub struct SessionCtx {
    pub info: SessionInfo,
    /// `SET @...` variables filters recognize and intercept.
    pub session_vars: hashbrown::HashMap<String, String>,
    pub statements: PsRegistry,
    pub cursors: Rc<RefCell<CursorRegistry>>,
    /// Set by a filter that took over a LOAD DATA stream; the connection
    /// drives it after the current exchange.
    pub active_stream: Option<LdiStream>,
    /// Set by a filter that needs the session killed with a message.
    pub kill_reason: Option<String>,
    /// Client-facing sequence override for the next reply unit, used when a
    /// filter consumed packets out of the middle of an exchange.
    pub reply_seq_override: Option<u8>,
    /// Backend write-queue depth above which bulk streams pause.
    pub backend_write_watermark: usize,
    /// Runtime for work that must not occupy the owning worker.
    pub background: Option<tokio::runtime::Handle>,
}

impl SessionCtx {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            session_vars: hashbrown::HashMap::new(),
            statements: PsRegistry::new(),
            cursors: Rc::new(RefCell::new(CursorRegistry::new(
                DEFAULT_CURSOR_IDLE_TIMEOUT,
            ))),
            active_stream: None,
            kill_reason: None,
            reply_seq_override: None,
            backend_write_watermark: 65536,
            background: None,
        }
    }
}

/// What became of a routed buffer. Every buffer ends up in exactly one of
/// these; silently dropping one is unrepresentable.
pub enum RouteOutcome {
    /// Reached the router; these reply units survived the upstream filter
    /// walk and go to the client in order.
    Routed(Vec<ReplyInfoUnit>),
    /// A filter answered on the router's behalf with this payload.
    Synthesized(BufChain),
    /// A filter took ownership (e.g. queued it behind a stream).
    Consumed,
    /// A filter refused the buffer; the connection sends ERR and closes.
    Rejected(ErrorKind, String),
    /// The router did not accept the buffer; ask `handle_error`.
    Declined,
}

pub struct Session {
    state: SessionState,
    pub ctx: SessionCtx,
    filters: Vec<Box<dyn FilterSession>>,
    router_session: Box<dyn RouterSession>,
}

impl Session {
    pub fn new(
        ctx: SessionCtx,
        filters: Vec<Box<dyn FilterSession>>,
        router_session: Box<dyn RouterSession>,
    ) -> Self {
        Self {
            state: SessionState::Allocated,
            ctx,
            filters,
            router_session,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the lifecycle forward. Re-entering the current state is a no-op
    /// (teardown is idempotent); moving backward is refused.
    pub fn set_state(&mut self, next: SessionState) -> bool {
        if next == self.state {
            return true;
        }
        if next < self.state {
            return false;
        }
        self.state = next;
        true
    }

    /// Sends one client buffer down the filter chain into the router and
    /// walks the replies back up.
    pub async fn route_query(&mut self, mut buf: BufChain) -> io::Result<RouteOutcome> {
        for i in 0..self.filters.len() {
            match self.filters[i].route_query(&mut self.ctx, buf) {
                FilterAction::Forward(forwarded) => buf = forwarded,
                FilterAction::Consumed => return Ok(RouteOutcome::Consumed),
                FilterAction::Reply(reply) => return Ok(RouteOutcome::Synthesized(reply)),
                FilterAction::Reject(kind, msg) => return Ok(RouteOutcome::Rejected(kind, msg)),
            }
        }

        let mut sink = ReplySink::new();
        if !self.router_session.route_query(buf, &mut sink).await? {
            return Ok(RouteOutcome::Declined);
        }

        let units: Vec<ReplyInfoUnit> = sink.drain().collect();
        let mut surviving = Vec::with_capacity(units.len());
        for (reply, route, summary) in units {
            // prepare OK: the statement map entry exists exactly from here on
            if let Some(ps_id) = summary.generated_ps_id {
                if let Ok((_, ok)) = stmt_prepare_ok(&reply.contiguous()) {
                    self.ctx.statements.register(ps_id, ok.params, ok.columns);
                }
            }
            let mut consumed = false;
            let mut reply_slot = Some(reply);
            for filter in self.filters.iter_mut().rev() {
                let current = reply_slot.take().expect("reply_slot is repopulated on every non-terminal iteration");
                match filter.client_reply(&mut self.ctx, current, &route, &summary) {
                    ReplyAction::Forward(forwarded) => reply_slot = Some(forwarded),
                    ReplyAction::Consumed => {
                        consumed = true;
                        break;
                    }
                }
            }
            if !consumed {
                surviving.push((
                    reply_slot.expect("reply_slot is Some whenever the loop did not consume"),
                    route,
                    summary,
                ));
            }
        }
        Ok(RouteOutcome::Routed(surviving))
    }

    /// Asks the router whether the session survives a routing error.
    pub async fn handle_error(&mut self, error: &io::Error, action: ErrorAction) -> bool {
        if self.state >= SessionState::Stopping {
            // handle_error after close_session is a no-op
            return false;
        }
        self.router_session.handle_error(error, action).await
    }

    /// Tears the session down: router first (closes backends), then filter
    /// sessions in reverse order, then session-owned data. Safe to call more
    /// than once.
    pub async fn stop(&mut self) {
        if !self.set_state(SessionState::Stopping) || self.state == SessionState::Stopped {
            return;
        }
        debug!("session {} stopping", self.ctx.info.id);
        // interrupt any in-flight bulk load before touching the backend
        self.ctx.active_stream = None;
        self.router_session.close().await;
        while let Some(mut filter) = self.filters.pop() {
            filter.close(&mut self.ctx);
        }
        self.ctx.cursors.borrow_mut().close_all();
        self.state = SessionState::Stopped;
    }

    pub fn filters(&self) -> &[Box<dyn FilterSession>] {
        &self.filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_info() -> SessionInfo {
        SessionInfo {
            id: 1,
            user: Some("alice".to_string()),
            database: Some("app".to_string()),
            remote: ClientAddr::Local,
            thread_id: 42,
            auth_token: vec![],
            external_identity: None,
            client_caps: crate::server::default_capabilities(),
            collation: 33,
        }
    }

    struct NullRouterSession;

    #[async_trait::async_trait(?Send)]
    impl RouterSession for NullRouterSession {
        async fn route_query(
            &mut self,
            _buf: BufChain,
            _replies: &mut ReplySink,
        ) -> io::Result<bool> {
            Ok(true)
        }

        async fn handle_error(&mut self, _error: &io::Error, _action: ErrorAction) -> bool {
            true
        }

        async fn close(&mut self) {}
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let mut session = Session::new(
            SessionCtx::new(test_info()),
            Vec::new(),
            Box::new(NullRouterSession),
        );
        assert_eq!(session.state(), SessionState::Allocated);
        assert!(session.set_state(SessionState::Ready));
        assert!(session.set_state(SessionState::RouterReady));
        // backwards is refused
        assert!(!session.set_state(SessionState::Ready));
        // idempotent re-entry is fine
        assert!(session.set_state(SessionState::RouterReady));
        assert!(session.set_state(SessionState::Stopping));
        assert!(session.set_state(SessionState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut session = Session::new(
            SessionCtx::new(test_info()),
            Vec::new(),
            Box::new(NullRouterSession),
        );
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_handle_error_after_stop_is_noop() {
        let mut session = Session::new(
            SessionCtx::new(test_info()),
            Vec::new(),
            Box::new(NullRouterSession),
        );
        session.stop().await;
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "backend gone");
        assert!(!session.handle_error(&err, ErrorAction::ReplyClient).await);
    }
}
