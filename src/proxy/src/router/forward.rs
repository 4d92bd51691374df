//! Reference router: forwards every buffer to one backend over a lazily
//! opened connection, honoring routing hints against a static server list.
//! Load balancing beyond "pick a replica at random" is deliberately absent;
//! production routers implement this contract with their own policies.

use crate::buffer::{BufChain, BufProps};
use crate::hint::Hint;
use crate::protocol::mysql::packet::get_command;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::router::{ErrorAction, ReplySink, RouteInfo, Router, RouterSession};
use crate::server::reply::ReplyTracker;
use crate::session::SessionInfo;

use async_trait::async_trait;
use chrono::Utc;
use mysql_common::constants::CapabilityFlags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::io;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub name: String,
    pub addr: String,
    pub master: bool,
}

pub struct ForwardRouter {
    servers: Vec<ServerTarget>,
}

impl ForwardRouter {
    pub fn new(servers: Vec<ServerTarget>) -> Self {
        Self { servers }
    }

    /// `name=addr` pairs, first entry doubles as the master.
    pub fn from_addr_list(addrs: &str) -> Self {
        let servers = addrs
            .split(',')
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, item)| {
                let (name, addr) = item
                    .split_once('=')
                    .unwrap_or((item, item));
                ServerTarget {
                    name: name.to_string(),
                    addr: addr.to_string(),
                    master: i == 0,
                }
            })
            .collect();
        Self { servers }
    }
}

impl Router for ForwardRouter {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn new_session(&self, session: &SessionInfo) -> io::Result<Box<dyn RouterSession>> {
        Ok(Box::new(ForwardRouterSession {
            servers: self.servers.clone(),
            caps: session.client_caps,
            conn: None,
            last_target: None,
            load_data: false,
            rng: StdRng::seed_from_u64(Utc::now().timestamp_subsec_nanos().into()),
        }))
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({
            "servers": self.servers.iter().map(|s| json!({
                "name": s.name,
                "address": s.addr,
                "master": s.master,
            })).collect::<Vec<_>>(),
        })
    }
}

struct BackendConn {
    name: String,
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
}

pub struct ForwardRouterSession {
    servers: Vec<ServerTarget>,
    caps: CapabilityFlags,
    conn: Option<BackendConn>,
    last_target: Option<String>,
    load_data: bool,
    rng: StdRng,
}

impl ForwardRouterSession {
    fn pick_target(&mut self, hints: &[Hint]) -> Option<ServerTarget> {
        for hint in hints {
            match hint {
                Hint::RouteToNamedTarget(name) => {
                    if let Some(t) = self.servers.iter().find(|s| &s.name == name) {
                        return Some(t.clone());
                    }
                    warn!("hint names unknown server {name:?}, ignoring");
                }
                Hint::RouteToMaster => {
                    return self.servers.iter().find(|s| s.master).cloned();
                }
                Hint::RouteToSlave => {
                    let replicas: Vec<&ServerTarget> =
                        self.servers.iter().filter(|s| !s.master).collect();
                    if !replicas.is_empty() {
                        let idx = self.rng.gen_range(0..replicas.len());
                        return Some(replicas[idx].clone());
                    }
                }
                Hint::RouteToAll => {
                    // the reference router has a single dispatch path; the
                    // master gets the statement
                    return self.servers.iter().find(|s| s.master).cloned();
                }
                Hint::RouteToLastUsed => {
                    if let Some(last) = &self.last_target {
                        if let Some(t) = self.servers.iter().find(|s| &s.name == last) {
                            return Some(t.clone());
                        }
                    }
                }
                Hint::Parameter { .. } => {}
            }
        }
        if let Some(last) = &self.last_target {
            if let Some(t) = self.servers.iter().find(|s| &s.name == last) {
                return Some(t.clone());
            }
        }
        self.servers.first().cloned()
    }

    async fn ensure_conn(&mut self, target: &ServerTarget) -> io::Result<()> {
        if let Some(conn) = &self.conn {
            if conn.name == target.name {
                return Ok(());
            }
        }
        debug!("connecting to backend {} ({})", target.name, target.addr);
        let stream = TcpStream::connect(&target.addr).await?;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        self.conn = Some(BackendConn {
            name: target.name.clone(),
            reader: PacketReader::new(r),
            writer: PacketWriter::new(w),
        });
        self.last_target = Some(target.name.clone());
        Ok(())
    }

    async fn write_packet(&mut self, chain: &BufChain) -> io::Result<()> {
        let conn = self
            .conn
            .as_mut()
            .expect("write_packet requires a backend connection");
        conn.writer.stage_chain(chain);
        conn.writer.end_packet().await?;
        conn.writer.flush_all().await
    }

    async fn read_response(&mut self, mut tracker: ReplyTracker, sink: &mut ReplySink) -> io::Result<()> {
        let caps = self.caps;
        let conn = self
            .conn
            .as_mut()
            .expect("read_response requires a backend connection");
        loop {
            let (seq, packet) = crate::async_packet_read!(conn.reader);
            let summary = tracker.feed(&packet);
            if summary.is_error() {
                let payload = packet.contiguous();
                crate::parse_err_packet!(caps, payload, "backend returned ERR");
            }
            let is_load = summary.is_load_data();
            let complete = summary.is_complete();
            let route = RouteInfo {
                target: Some(conn.name.clone()),
                reply_seq: seq,
                final_chunk: complete || is_load,
                packets: tracker.packets(),
            };
            sink.client_reply(packet, route, summary);
            if is_load {
                // upload phase: data packets continue the sequence
                self.load_data = true;
                conn.writer.set_seq(seq.wrapping_add(1));
                return Ok(());
            }
            if complete {
                return Ok(());
            }
        }
    }
}

#[async_trait(?Send)]
impl RouterSession for ForwardRouterSession {
    async fn route_query(&mut self, buf: BufChain, replies: &mut ReplySink) -> io::Result<bool> {
        if self.load_data {
            let is_end = buf.props.contains(BufProps::STREAM_END) || buf.is_empty();
            // data chunks are framed one to one; a full-size chunk must not
            // pick up a logical-message terminator
            {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or_else(|| io::Error::other("load-data stream without a backend"))?;
                conn.writer.stage_chain(&buf);
                conn.writer.end_one_packet().await?;
                conn.writer.flush_all().await?;
            }
            if is_end {
                self.load_data = false;
                let tracker = ReplyTracker::for_command(
                    crate::protocol::mysql::constants::CommandCode::ComQuery,
                    self.caps,
                )
                .expect("query tracker");
                self.read_response(tracker, replies).await?;
            }
            return Ok(true);
        }

        let Some(com) = get_command(&buf) else {
            return Ok(false);
        };
        let target = match self.pick_target(&buf.hints) {
            Some(target) => target,
            None => return Ok(false),
        };
        self.ensure_conn(&target).await?;
        {
            let conn = self.conn.as_mut().expect("just ensured");
            conn.writer.reset_seq();
        }
        self.write_packet(&buf).await?;

        match ReplyTracker::for_command(com, self.caps) {
            Some(tracker) => self.read_response(tracker, replies).await?,
            None => {}
        }
        Ok(true)
    }

    async fn handle_error(&mut self, error: &io::Error, action: ErrorAction) -> bool {
        warn!("forward router error ({action:?}): {error:?}");
        // drop the broken connection; the session may go on and the next
        // query reconnects
        self.conn = None;
        self.load_data = false;
        !self.servers.is_empty()
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            use tokio::io::AsyncWriteExt;
            let _ = conn.writer.inner_writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_servers(servers: Vec<ServerTarget>) -> ForwardRouterSession {
        ForwardRouterSession {
            servers,
            caps: crate::server::default_capabilities(),
            conn: None,
            last_target: None,
            load_data: false,
            rng: StdRng::seed_from_u64(7),
        }
    }

    fn targets() -> Vec<ServerTarget> {
        vec![
            ServerTarget {
                name: "master-a".to_string(),
                addr: "127.0.0.1:13306".to_string(),
                master: true,
            },
            ServerTarget {
                name: "slave-b".to_string(),
                addr: "127.0.0.1:13307".to_string(),
                master: false,
            },
        ]
    }

    #[test]
    fn test_named_target_hint_wins() {
        let mut session = session_with_servers(targets());
        let picked = session
            .pick_target(&[Hint::RouteToNamedTarget("slave-b".to_string())])
            .unwrap();
        assert_eq!(picked.name, "slave-b");
    }

    #[test]
    fn test_master_and_slave_hints() {
        let mut session = session_with_servers(targets());
        assert_eq!(
            session.pick_target(&[Hint::RouteToMaster]).unwrap().name,
            "master-a"
        );
        assert_eq!(
            session.pick_target(&[Hint::RouteToSlave]).unwrap().name,
            "slave-b"
        );
    }

    #[test]
    fn test_unhinted_falls_back_to_first_then_sticks() {
        let mut session = session_with_servers(targets());
        assert_eq!(session.pick_target(&[]).unwrap().name, "master-a");
        session.last_target = Some("slave-b".to_string());
        assert_eq!(session.pick_target(&[]).unwrap().name, "slave-b");
        assert_eq!(
            session
                .pick_target(&[Hint::RouteToLastUsed])
                .unwrap()
                .name,
            "slave-b"
        );
    }

    #[test]
    fn test_addr_list_parsing() {
        let router = ForwardRouter::from_addr_list("master-a=127.0.0.1:3306,slave-b=127.0.0.1:3307");
        assert_eq!(router.servers.len(), 2);
        assert!(router.servers[0].master);
        assert_eq!(router.servers[1].name, "slave-b");
        assert!(!router.servers[1].master);
    }
}
