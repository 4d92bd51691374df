//! Client-facing connection: wire framing plus the authentication half of
//! the protocol state machine. The command phase lives in the server driver.

use crate::buffer::BufChain;
use crate::protocol::mysql::basic::client_handshake_response;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::{AuthDecision, AuthResult, Authenticator, ClientAuthState};
use crate::server::{ClientAddr, DEFAULT_SERVER_VERSION};

use common::metrics::metric_def::PROXY_AUTH_FAILURES;
use mysql_common::constants::CapabilityFlags;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Authentication-phase states of the client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPhase {
    Init,
    HandshakeSent,
    AuthReceived,
    AuthOk,
    Failed,
}

pub struct ClientConn<R, W> {
    pub reader: PacketReader<R>,
    pub writer: PacketWriter<W>,
    pub phase: ProtocolPhase,
    pub auth_state: ClientAuthState,
    pub client_caps: CapabilityFlags,
    pub collation: u16,
    pub thread_id: u64,
}

impl<R, W> ClientConn<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W, thread_id: u64, remote: ClientAddr, scramble: [u8; 20]) -> Self {
        Self {
            reader: PacketReader::new(reader),
            writer: PacketWriter::new(writer),
            phase: ProtocolPhase::Init,
            auth_state: ClientAuthState::new(scramble, remote),
            client_caps: CapabilityFlags::empty(),
            collation: 0,
            thread_id,
        }
    }

    pub async fn send_handshake(&mut self, auth_plugin: &str) -> io::Result<()> {
        debug_assert_eq!(self.phase, ProtocolPhase::Init);
        #[cfg(feature = "tls")]
        writers::write_initial_handshake(
            &mut self.writer,
            self.thread_id,
            self.auth_state.scramble,
            DEFAULT_SERVER_VERSION,
            auth_plugin,
            &None,
        )
        .await?;
        #[cfg(not(feature = "tls"))]
        writers::write_initial_handshake(
            &mut self.writer,
            self.thread_id,
            self.auth_state.scramble,
            DEFAULT_SERVER_VERSION,
            auth_plugin,
        )
        .await?;
        self.phase = ProtocolPhase::HandshakeSent;
        Ok(())
    }

    async fn fail(&mut self, seq: u8, kind: ErrorKind, msg: &str) -> io::Error {
        self.phase = ProtocolPhase::Failed;
        common::metrics::counter_inc(
            PROXY_AUTH_FAILURES,
            1,
            Some(common::metrics::common_labels()),
        );
        self.writer.set_seq(seq);
        if let Err(e) = writers::write_err_packet(kind, msg.as_bytes(), &mut self.writer).await {
            return e;
        }
        if let Err(e) = self.writer.flush_all().await {
            return e;
        }
        io::Error::new(io::ErrorKind::PermissionDenied, msg.to_string())
    }

    /// Runs the authentication exchange to completion: reads the handshake
    /// response, loops the mechanism through extract/authenticate (writing
    /// any intermediate packets), and returns the sequence number the final
    /// OK packet must carry. Failures emit ERR 1045 / SQLSTATE 28000 and
    /// close.
    pub async fn authenticate(&mut self, mechanism: &Arc<dyn Authenticator>) -> io::Result<u8> {
        debug_assert_eq!(self.phase, ProtocolPhase::HandshakeSent);
        let Some((seq, packet)) = self.reader.next_async().await? else {
            warn!("client hung up before handshake response");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer terminated connection",
            ));
        };
        let payload = packet.contiguous();
        let Ok((_, response)) = client_handshake_response(&payload, false) else {
            return Err(self
                .fail(
                    seq.wrapping_add(1),
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    "malformed handshake response",
                )
                .await);
        };
        if !response
            .client_flag
            .contains(CapabilityFlags::CLIENT_PROTOCOL_41)
        {
            return Err(self
                .fail(
                    seq.wrapping_add(1),
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    "client does not speak protocol 4.1",
                )
                .await);
        }
        // the handshake never advertised CLIENT_SSL; an SSLRequest here is a
        // client talking to the wrong listener
        if response.client_flag.contains(CapabilityFlags::CLIENT_SSL) {
            return Err(self
                .fail(
                    seq.wrapping_add(1),
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    "TLS requested but not enabled on this listener",
                )
                .await);
        }

        self.client_caps = response.client_flag;
        self.collation = response.collation;
        self.auth_state.user = response.username.as_ref().map(|u| {
            String::from_utf8_lossy(u).to_string()
        });
        self.auth_state.database = response.database_string();
        self.auth_state.auth_token = response.auth_response.clone();
        self.auth_state.client_plugin = response.auth_plugin.clone();
        self.auth_state.advertised_ssl =
            response.client_flag.contains(CapabilityFlags::CLIENT_SSL);
        self.phase = ProtocolPhase::AuthReceived;

        let mut last_seq = seq;
        if let AuthResult::Fail(reason) = mechanism.extract(&mut self.auth_state, &packet) {
            let user = self.auth_state.user_str().to_string();
            return Err(self
                .fail(
                    last_seq.wrapping_add(1),
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    &access_denied(&user, &self.auth_state.remote, &reason),
                )
                .await);
        }

        loop {
            match mechanism.authenticate(&mut self.auth_state) {
                AuthDecision::Accept => {
                    debug!(
                        "auth ok for user {:?} from {}",
                        self.auth_state.user_str(),
                        self.auth_state.remote
                    );
                    return Ok(last_seq.wrapping_add(1));
                }
                AuthDecision::Exchange(payload) => {
                    self.writer.set_seq(last_seq.wrapping_add(1));
                    self.writer.write_all(&payload)?;
                    self.writer.end_packet().await?;
                    self.writer.flush_all().await?;

                    self.reader.expect_seq(last_seq.wrapping_add(2));
                    let Some((next_seq, next_packet)) = self.reader.next_async().await? else {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "client hung up mid-authentication",
                        ));
                    };
                    self.reader.reset_seq();
                    last_seq = next_seq;
                    match mechanism.extract(&mut self.auth_state, &next_packet) {
                        AuthResult::Ok | AuthResult::Incomplete => {}
                        AuthResult::Fail(reason) => {
                            let user = self.auth_state.user_str().to_string();
                            return Err(self
                                .fail(
                                    last_seq.wrapping_add(1),
                                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                                    &access_denied(&user, &self.auth_state.remote, &reason),
                                )
                                .await);
                        }
                    }
                    // loop back into authenticate with the new material
                }
                AuthDecision::Reject(reason) => {
                    let user = self.auth_state.user_str().to_string();
                    warn!("auth rejected for user {user:?}: {reason}");
                    return Err(self
                        .fail(
                            last_seq.wrapping_add(1),
                            ErrorKind::ER_ACCESS_DENIED_ERROR,
                            &access_denied(&user, &self.auth_state.remote, &reason),
                        )
                        .await);
                }
            }
        }
    }

    /// Completes the connection phase: the OK the authenticator owes the
    /// client, with the sequence number it expects.
    pub async fn send_auth_ok(&mut self, seq: u8) -> io::Result<()> {
        self.writer.set_seq(seq);
        writers::write_ok_packet(
            &mut self.writer,
            0,
            0,
            mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        )
        .await?;
        self.writer.flush_all().await?;
        self.phase = ProtocolPhase::AuthOk;
        Ok(())
    }

    /// Synthesizes an ERR packet toward the client.
    pub async fn send_err(&mut self, seq: u8, kind: ErrorKind, msg: &str) -> io::Result<()> {
        self.writer.set_seq(seq);
        writers::write_err_packet(kind, msg.as_bytes(), &mut self.writer).await?;
        self.writer.flush_all().await
    }

    /// Writes one reply payload as a packet.
    pub async fn send_reply(&mut self, seq: u8, payload: &BufChain) -> io::Result<()> {
        self.writer.set_seq(seq);
        self.writer.stage_chain(payload);
        self.writer.end_packet().await
    }
}

fn access_denied(user: &str, remote: &ClientAddr, reason: &str) -> String {
    format!("Access denied for user '{user}'@'{remote}': {reason}")
}
