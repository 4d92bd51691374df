//! The router dispatch contract. Routers are external to the protocol core:
//! the filter chain terminates into a [`RouterSession`], and everything the
//! core needs to know about backend replies travels back through the
//! [`ReplySink`] as `(buffer, route info, reply summary)` units.

pub mod forward;

use crate::buffer::BufChain;
use crate::session::SessionInfo;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;

/// Where a reply unit came from and how it is framed.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    /// Name of the backend that answered.
    pub target: Option<String>,
    /// Wire sequence number the reply packet carried.
    pub reply_seq: u8,
    /// Whether this unit is the final chunk of the response.
    pub final_chunk: bool,
    /// Packets accumulated in the current response so far.
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// First packet of a response (OK, result-set head, prepare OK).
    Start,
    /// Column definitions, rows, anything mid-stream.
    Mid,
    /// Final packet of a result.
    End,
    /// An ERR packet.
    Error,
    /// The backend requested a LOCAL_INFILE stream.
    LoadData,
}

#[derive(Debug, Clone, Default)]
pub struct ReplySummary {
    pub state: Option<ReplyState>,
    pub affected_rows: u64,
    pub rows: u64,
    pub warnings: u16,
    /// Textual error when `state == Error`; the ERR packet itself still
    /// passes through verbatim.
    pub error: Option<String>,
    /// Statement id carried by a COM_STMT_PREPARE OK.
    pub generated_ps_id: Option<u32>,
    /// The OK carried SERVER_MORE_RESULTS_EXISTS; the reply stays open.
    pub more_results: bool,
}

impl ReplySummary {
    /// Whether the whole response exchange is over.
    pub fn is_complete(&self) -> bool {
        match self.state {
            Some(ReplyState::End) => !self.more_results,
            Some(ReplyState::Error) => true,
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, Some(ReplyState::Error))
    }

    pub fn is_load_data(&self) -> bool {
        matches!(self.state, Some(ReplyState::LoadData))
    }
}

/// One upstream reply unit: payload, where it came from, and what it means.
pub type ReplyInfoUnit = (BufChain, RouteInfo, ReplySummary);

/// Upstream delivery sink. The router pushes each backend reply unit here, in
/// arrival order; the session walks them back through the filter chain and
/// out to the client.
#[derive(Default)]
pub struct ReplySink {
    items: VecDeque<ReplyInfoUnit>,
}

impl ReplySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers one reply unit upstream.
    pub fn client_reply(&mut self, buf: BufChain, route: RouteInfo, summary: ReplySummary) {
        self.items.push_back((buf, route, summary));
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ReplyInfoUnit> + '_ {
        self.items.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// What the failing party should do about a routing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The session may survive on a fresh backend connection.
    NewConnection,
    /// Surface the error to the client.
    ReplyClient,
}

pub trait Router: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds the per-session router state. Backend connections are opened
    /// lazily, not here.
    fn new_session(&self, session: &SessionInfo) -> io::Result<Box<dyn RouterSession>>;

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[async_trait(?Send)]
pub trait RouterSession {
    /// Dispatches one buffer. Reply units are pushed into `replies` in
    /// arrival order; returns whether the buffer was accepted.
    async fn route_query(&mut self, buf: BufChain, replies: &mut ReplySink) -> io::Result<bool>;

    /// Asks whether the session can continue after a routing error.
    async fn handle_error(&mut self, error: &io::Error, action: ErrorAction) -> bool;

    /// Closes backend connections. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_completion_rules() {
        let mut summary = ReplySummary {
            state: Some(ReplyState::End),
            ..Default::default()
        };
        assert!(summary.is_complete());
        summary.more_results = true;
        assert!(!summary.is_complete());

        let err = ReplySummary {
            state: Some(ReplyState::Error),
            ..Default::default()
        };
        assert!(err.is_complete());

        let mid = ReplySummary {
            state: Some(ReplyState::Mid),
            ..Default::default()
        };
        assert!(!mid.is_complete());
    }

    #[test]
    fn test_sink_preserves_order() {
        let mut sink = ReplySink::new();
        for i in 0..3u8 {
            sink.client_reply(
                BufChain::from_vec(vec![i]),
                RouteInfo {
                    reply_seq: i,
                    ..Default::default()
                },
                ReplySummary::default(),
            );
        }
        let seqs: Vec<u8> = sink.drain().map(|(_, route, _)| route.reply_seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
