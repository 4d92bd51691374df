//! Reply correlation. For every command that expects a response, a
//! [`ReplyTracker`] consumes the backend's payload packets one by one and
//! reports where the response stands, so forwarding never has to buffer a
//! whole result to know when it ends.

use crate::buffer::BufChain;
use crate::protocol::mysql::basic::{
    eof_server_status, ok_packet, read_length_encoded_number, stmt_prepare_ok,
};
use crate::protocol::mysql::constants::CommandCode;
use crate::router::{ReplyState, ReplySummary};

use mysql_common::constants::{CapabilityFlags, StatusFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Expecting the head packet: OK, ERR, LOCAL_INFILE or a column count.
    Head,
    /// Expecting the head of a COM_STMT_PREPARE response.
    PrepareHead,
    /// Inside the parameter/column definition block of a prepare response.
    PrepareDefs { remaining: u32 },
    /// Inside the column definition block of a result set.
    ColumnDefs { remaining: u64 },
    /// Legacy protocol: the EOF that closes the column block.
    ColumnsEof,
    /// Row packets until EOF / terminal OK.
    Rows,
    Done,
}

pub struct ReplyTracker {
    cmd: CommandCode,
    caps: CapabilityFlags,
    phase: Phase,
    packets: u64,
    rows: u64,
}

impl ReplyTracker {
    /// A tracker for commands that get a response at all. `None` means fire
    /// and forget (QUIT, STMT_CLOSE, STMT_SEND_LONG_DATA).
    pub fn for_command(cmd: CommandCode, caps: CapabilityFlags) -> Option<ReplyTracker> {
        let phase = match cmd {
            CommandCode::ComQuit
            | CommandCode::ComStmtClose
            | CommandCode::ComStmtSendLongData => return None,
            CommandCode::ComStmtPrepare => Phase::PrepareHead,
            // fetch continues a cursor: rows straight away
            CommandCode::ComStmtFetch => Phase::Rows,
            _ => Phase::Head,
        };
        Some(ReplyTracker {
            cmd,
            caps,
            phase,
            packets: 0,
            rows: 0,
        })
    }

    pub fn command(&self) -> CommandCode {
        self.cmd
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    fn deprecate_eof(&self) -> bool {
        self.caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    }

    fn summary(&self, state: ReplyState) -> ReplySummary {
        ReplySummary {
            state: Some(state),
            rows: self.rows,
            ..Default::default()
        }
    }

    fn finish_ok(&mut self, payload: &[u8], state: ReplyState) -> ReplySummary {
        let mut summary = self.summary(state);
        if let Ok((_, ok)) = ok_packet(payload, self.caps) {
            summary.affected_rows = ok.affected_rows;
            summary.warnings = ok.warnings;
            summary.more_results = ok
                .status_flags
                .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
        }
        self.phase = if summary.more_results {
            Phase::Head
        } else {
            Phase::Done
        };
        summary
    }

    fn finish_err(&mut self, payload: &[u8]) -> ReplySummary {
        let mut summary = self.summary(ReplyState::Error);
        // 0xff, 2-byte code, '#', sqlstate, message
        if payload.len() > 9 {
            summary.error = Some(String::from_utf8_lossy(&payload[9..]).to_string());
        }
        self.phase = Phase::Done;
        summary
    }

    /// Consumes one backend payload packet and reports the response state
    /// after it.
    pub fn feed(&mut self, packet: &BufChain) -> ReplySummary {
        self.packets += 1;
        let payload = packet.contiguous();
        match self.phase {
            Phase::Head => {
                if packet.is_ok_packet() {
                    self.finish_ok(&payload, ReplyState::End)
                } else if packet.is_err_packet() {
                    self.finish_err(&payload)
                } else if packet.is_local_in_file_packet() {
                    // command phase switches into streaming; the tracker
                    // rearms for the OK that follows the upload.
                    self.phase = Phase::Head;
                    self.summary(ReplyState::LoadData)
                } else if packet.is_eof_packet() {
                    self.phase = Phase::Done;
                    self.summary(ReplyState::End)
                } else {
                    let columns = read_length_encoded_number(&payload)
                        .map(|(_, n)| n)
                        .unwrap_or(0);
                    self.phase = Phase::ColumnDefs { remaining: columns };
                    self.summary(ReplyState::Start)
                }
            }
            Phase::PrepareHead => {
                if packet.is_err_packet() {
                    return self.finish_err(&payload);
                }
                match stmt_prepare_ok(&payload) {
                    Ok((_, ok)) => {
                        let mut expected = ok.params as u32 + ok.columns as u32;
                        if !self.deprecate_eof() {
                            if ok.params > 0 {
                                expected += 1;
                            }
                            if ok.columns > 0 {
                                expected += 1;
                            }
                        }
                        let mut summary = if expected == 0 {
                            self.phase = Phase::Done;
                            self.summary(ReplyState::End)
                        } else {
                            self.phase = Phase::PrepareDefs {
                                remaining: expected,
                            };
                            self.summary(ReplyState::Start)
                        };
                        summary.generated_ps_id = Some(ok.statement_id);
                        summary.warnings = ok.warnings;
                        summary
                    }
                    Err(_) => self.finish_err(&payload),
                }
            }
            Phase::PrepareDefs { remaining } => {
                if remaining <= 1 {
                    self.phase = Phase::Done;
                    self.summary(ReplyState::End)
                } else {
                    self.phase = Phase::PrepareDefs {
                        remaining: remaining - 1,
                    };
                    self.summary(ReplyState::Mid)
                }
            }
            Phase::ColumnDefs { remaining } => {
                let left = remaining.saturating_sub(1);
                if left == 0 {
                    self.phase = if self.deprecate_eof() {
                        Phase::Rows
                    } else {
                        Phase::ColumnsEof
                    };
                } else {
                    self.phase = Phase::ColumnDefs { remaining: left };
                }
                self.summary(ReplyState::Mid)
            }
            Phase::ColumnsEof => {
                // A cursor-mode execute ends after the column block: rows
                // come later via COM_STMT_FETCH.
                if let Ok((_, status)) = eof_server_status(&payload) {
                    if status.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                        self.phase = Phase::Done;
                        return self.summary(ReplyState::End);
                    }
                }
                self.phase = Phase::Rows;
                self.summary(ReplyState::Mid)
            }
            Phase::Rows => {
                if packet.is_err_packet() {
                    self.finish_err(&payload)
                } else if !self.deprecate_eof() && packet.is_eof_packet() {
                    let more = eof_server_status(&payload)
                        .map(|(_, s)| s.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS))
                        .unwrap_or(false);
                    let mut summary = self.summary(ReplyState::End);
                    summary.more_results = more;
                    self.phase = if more { Phase::Head } else { Phase::Done };
                    summary
                } else if self.deprecate_eof() && packet.is_result_set_eof_packet() {
                    self.finish_ok(&payload, ReplyState::End)
                } else {
                    self.rows += 1;
                    self.summary(ReplyState::Mid)
                }
            }
            Phase::Done => {
                // Anything after completion belongs to the next exchange;
                // treat it as a fresh head.
                self.phase = Phase::Head;
                self.rows = 0;
                self.packets -= 1;
                self.feed(packet)
            }
        }
    }
}
