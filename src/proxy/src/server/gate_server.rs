//! The server driver: accepts an authenticated connection into a session and
//! runs the command phase, dispatching every complete client packet through
//! the filter chain into the router and the replies back out.

use crate::buffer::{BufChain, BufProps};
use crate::filter::{build_chain, Filter};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::get_command;
use crate::router::{ErrorAction, ReplyInfoUnit, Router};
use crate::server::auth::{gen_user_salt, Authenticator};
use crate::server::client_conn::ClientConn;
use crate::server::listener::ListenerConfig;
use crate::server::statement::extract_ps_id;
use crate::server::{init_sql_com_labels, ClientAddr};
use crate::session::{LdiStream, RouteOutcome, Session, SessionCtx, SessionInfo, SessionState};

use common::metrics::metric_def::{PROXY_COM_LATENCY, PROXY_CONN_TOTAL, PROXY_CURR_CONN};
use common::metrics::{common_labels, counter_inc, gauge_dec, gauge_inc, MetricsTimer};
use hashbrown::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

pub struct GateServer {
    sql_com_labels: HashMap<u8, Vec<(&'static str, String)>>,
    listener: ListenerConfig,
    authenticator: Arc<dyn Authenticator>,
    filters: Vec<Arc<dyn Filter>>,
    router: Arc<dyn Router>,
    background: Option<tokio::runtime::Handle>,
    session_seq: AtomicU64,
}

impl GateServer {
    pub fn new(
        listener: ListenerConfig,
        authenticator: Arc<dyn Authenticator>,
        filters: Vec<Arc<dyn Filter>>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            sql_com_labels: init_sql_com_labels().clone().into_iter().collect(),
            listener,
            authenticator,
            filters,
            router,
            background: None,
            session_seq: AtomicU64::new(0),
        }
    }

    pub fn with_background(mut self, handle: tokio::runtime::Handle) -> Self {
        self.background = Some(handle);
        self
    }

    pub fn listener(&self) -> &ListenerConfig {
        &self.listener
    }

    /// Refreshes the authenticator's user table from the listener config.
    pub fn load_users(&self) -> io::Result<usize> {
        self.authenticator.load_users(&self.listener)
    }

    /// Drives one client connection from handshake to teardown. Runs
    /// entirely on the worker that owns the connection.
    pub async fn handle_conn<R, W>(
        &self,
        reader: R,
        writer: W,
        remote: ClientAddr,
    ) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let conn_id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut conn = ClientConn::new(reader, writer, conn_id, remote, gen_user_salt());
        conn.send_handshake(self.authenticator.name()).await?;
        let ok_seq = conn.authenticate(&self.authenticator).await?;

        // Session scope opens only after AUTH_OK: filter chain, then router
        // session; the client sees its OK once everything is in place.
        let info = SessionInfo {
            id: conn_id,
            user: conn.auth_state.user.clone(),
            database: conn.auth_state.database.clone(),
            remote: conn.auth_state.remote.clone(),
            thread_id: conn.thread_id,
            auth_token: conn.auth_state.auth_token.clone(),
            external_identity: conn.auth_state.external_identity.clone(),
            client_caps: conn.client_caps,
            collation: conn.collation,
        };
        let mut ctx = SessionCtx::new(info.clone());
        ctx.background = self.background.clone();
        ctx.backend_write_watermark = self.listener.write_watermark;
        let chain = match build_chain(&self.filters, &info).await {
            Ok(chain) => chain,
            Err(e) => {
                warn!("session {conn_id}: filter chain build failed: {e:?}");
                let _ = conn
                    .send_err(ok_seq, ErrorKind::ER_ABORTING_CONNECTION, "internal error")
                    .await;
                return Err(e);
            }
        };
        let router_session = self.router.new_session(&info)?;
        let mut session = Session::new(ctx, chain, router_session);
        session.set_state(SessionState::Ready);
        session.set_state(SessionState::RouterReady);
        conn.send_auth_ok(ok_seq).await?;

        gauge_inc(PROXY_CURR_CONN, 1_f64, Some(common_labels()));
        counter_inc(PROXY_CONN_TOTAL, 1, Some(common_labels()));
        let result = self.command_loop(&mut conn, &mut session).await;
        session.stop().await;
        gauge_dec(PROXY_CURR_CONN, 1_f64, Some(common_labels()));
        // the connection object dies at the end of the current loop tick
        tokio::task::yield_now().await;
        result
    }

    async fn command_loop<R, W>(
        &self,
        conn: &mut ClientConn<R, W>,
        session: &mut Session,
    ) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        loop {
            conn.reader.reset_seq();
            let Some((seq, packet)) = conn.reader.next_async().await? else {
                debug!("session {}: client disconnected", session.ctx.info.id);
                return Ok(());
            };
            let Some(com) = get_command(&packet) else {
                conn.send_err(
                    seq.wrapping_add(1),
                    ErrorKind::ER_UNKNOWN_COM_ERROR,
                    "Unknown command",
                )
                .await?;
                continue;
            };

            let _com_latency = self
                .sql_com_labels
                .get(&(com as u8))
                .map(|labels| MetricsTimer::new_with_labels(PROXY_COM_LATENCY, labels));

            match com {
                CommandCode::ComQuit => return Ok(()),
                CommandCode::ComPing => {
                    conn.writer.set_seq(seq.wrapping_add(1));
                    crate::protocol::mysql::packet::writers::write_ok_packet(
                        &mut conn.writer,
                        0,
                        0,
                        mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    )
                    .await?;
                    conn.writer.flush_all().await?;
                    continue;
                }
                CommandCode::ComChangeUser => {
                    conn.send_err(
                        seq.wrapping_add(1),
                        ErrorKind::ER_PARSE_ERROR,
                        "COM_CHANGE_USER is not supported through this proxy",
                    )
                    .await?;
                    continue;
                }
                _ => {}
            }

            let mut chain = packet;
            if com.carries_statement() {
                chain.mark_statement();
            }
            let init_db = (com == CommandCode::ComInitDB)
                .then(|| String::from_utf8_lossy(&chain.copy_to_vec(1, chain.len() - 1)).to_string());
            let mut close_id = None;
            if com.is_ps_command() {
                let Some(wire_id) = extract_ps_id(&chain) else {
                    conn.send_err(
                        seq.wrapping_add(1),
                        ErrorKind::ER_PARSE_ERROR,
                        "malformed prepared-statement command",
                    )
                    .await?;
                    continue;
                };
                match session.ctx.statements.resolve(wire_id) {
                    Some(id) => {
                        chain.ps_id = Some(id);
                        if com == CommandCode::ComStmtClose {
                            close_id = Some(id);
                        }
                    }
                    None => {
                        conn.send_err(
                            seq.wrapping_add(1),
                            ErrorKind::ER_UNKNOWN_STMT_HANDLER,
                            "Unknown prepared statement handler given to the proxy",
                        )
                        .await?;
                        continue;
                    }
                }
            }

            let outcome = match session.route_query(chain).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("session {}: routing error {e:?}", session.ctx.info.id);
                    let can_continue = session.handle_error(&e, ErrorAction::ReplyClient).await;
                    conn.send_err(
                        seq.wrapping_add(1),
                        ErrorKind::CR_CONN_HOST_ERROR,
                        &format!("Can't connect to backend server ({e})"),
                    )
                    .await?;
                    if can_continue {
                        continue;
                    }
                    return Ok(());
                }
            };

            match outcome {
                RouteOutcome::Consumed => {}
                RouteOutcome::Synthesized(reply) => {
                    conn.send_reply(seq.wrapping_add(1), &reply).await?;
                    conn.writer.flush_all().await?;
                }
                RouteOutcome::Rejected(kind, msg) => {
                    conn.send_err(seq.wrapping_add(1), kind, &msg).await?;
                    return Ok(());
                }
                RouteOutcome::Declined => {
                    let err = io::Error::other("router declined the query");
                    let can_continue = session.handle_error(&err, ErrorAction::ReplyClient).await;
                    conn.send_err(
                        seq.wrapping_add(1),
                        ErrorKind::ER_PARSE_ERROR,
                        "The query was refused by the routing layer",
                    )
                    .await?;
                    if !can_continue {
                        return Ok(());
                    }
                }
                RouteOutcome::Routed(units) => {
                    let load_data_seq = self.write_reply_units(conn, session, &units).await?;
                    if com == CommandCode::ComInitDB
                        && units.iter().any(|(_, _, s)| s.is_complete() && !s.is_error())
                    {
                        session.ctx.info.database = init_db;
                    }
                    if let Some(stream) = session.ctx.active_stream.take() {
                        self.drive_fetch_stream(conn, session, stream).await?;
                    } else if let Some(ld_seq) = load_data_seq {
                        self.stream_client_file(conn, session, ld_seq).await?;
                    }
                }
            }

            if let Some(id) = close_id {
                session.ctx.statements.close(id);
            }
            if let Some(reason) = session.ctx.kill_reason.take() {
                warn!("session {} killed: {reason}", session.ctx.info.id);
                conn.send_err(seq.wrapping_add(1), ErrorKind::ER_PARSE_ERROR, &reason)
                    .await?;
                return Ok(());
            }
        }
    }

    /// Writes surviving reply units to the client; returns the sequence of a
    /// LOCAL_INFILE prompt if one went out (classic client-side streaming).
    async fn write_reply_units<R, W>(
        &self,
        conn: &mut ClientConn<R, W>,
        session: &mut Session,
        units: &[ReplyInfoUnit],
    ) -> io::Result<Option<u8>>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut load_data_seq = None;
        for (reply, route, summary) in units {
            let seq_out = session
                .ctx
                .reply_seq_override
                .take()
                .unwrap_or(route.reply_seq);
            conn.send_reply(seq_out, reply).await?;
            if summary.is_load_data() {
                load_data_seq = Some(route.reply_seq);
            }
        }
        conn.writer.flush_all().await?;
        Ok(load_data_seq)
    }

    /// Classic LOAD DATA LOCAL INFILE: the client streams file data; each
    /// wire packet is forwarded in order, the empty packet terminates and the
    /// backend's verdict flows back.
    async fn stream_client_file<R, W>(
        &self,
        conn: &mut ClientConn<R, W>,
        session: &mut Session,
        prompt_seq: u8,
    ) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        conn.reader.expect_seq(prompt_seq.wrapping_add(1));
        loop {
            let Some((_seq, chunk)) = conn.reader.next_raw_async().await? else {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client hung up during LOAD DATA stream",
                ));
            };
            let is_end = chunk.is_empty();
            let mut data = chunk;
            data.props |= BufProps::STREAM_DATA;
            if is_end {
                data.props |= BufProps::STREAM_END;
            }
            match session.route_query(data).await? {
                RouteOutcome::Routed(units) => {
                    if is_end {
                        self.write_reply_units(conn, session, &units).await?;
                        break;
                    }
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "LOAD DATA stream was intercepted mid-flight",
                    ));
                }
            }
        }
        conn.reader.reset_seq();
        Ok(())
    }

    /// Server-side bulk load: a filter replaced the client stream with a
    /// background fetch; chunks arrive over the stream channel and are routed
    /// downstream until it ends or errors.
    async fn drive_fetch_stream<R, W>(
        &self,
        conn: &mut ClientConn<R, W>,
        session: &mut Session,
        mut stream: LdiStream,
    ) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        loop {
            match stream.rx.recv().await {
                Some(Ok(bytes)) => {
                    let mut chain = BufChain::from_bytes(bytes);
                    chain.props |= BufProps::STREAM_DATA;
                    match session.route_query(chain).await? {
                        RouteOutcome::Routed(_) => {}
                        _ => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "bulk-load stream was intercepted mid-flight",
                            ));
                        }
                    }
                }
                Some(Err(reason)) => {
                    session.ctx.kill_reason = Some(reason);
                    return Ok(());
                }
                None => {
                    // fetch complete: terminating empty packet, then the
                    // backend's verdict goes to the client
                    let mut end = BufChain::new();
                    end.props |= BufProps::STREAM_DATA | BufProps::STREAM_END;
                    if let RouteOutcome::Routed(units) = session.route_query(end).await? {
                        self.write_reply_units(conn, session, &units).await?;
                    }
                    return Ok(());
                }
            }
        }
    }
}
