//! Bulk-load filter: recognizes `LOAD DATA [LOCAL] INFILE` statements whose
//! file is an S3-style URL, rewrites them into a plain LOCAL INFILE the
//! backend accepts, and feeds the upload from object storage instead of the
//! client. The fetch runs off-worker; chunks reach the session through a
//! bounded channel, which is also the flow-control valve: when the backend
//! side stalls, the channel fills and the fetcher pauses.

use crate::buffer::BufChain;
use crate::filter::ldi_parser::{parse_ldi, parse_s3_url, S3Url};
use crate::filter::{Filter, FilterAction, FilterConfigError, FilterSession, ReplyAction};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::get_command;
use crate::protocol::mysql::packet::writers::build_ok_payload;
use crate::router::{ReplySummary, RouteInfo};
use crate::session::{LdiStream, SessionCtx, SessionInfo};
use crate::worker::worker_local::WorkerLocal;
use crate::worker::current_worker_id;

use async_trait::async_trait;
use bytes::Bytes;
use common::metrics::metric_def::LDI_BYTES_STREAMED;
use common::metrics::{common_labels, counter_inc};
use futures::StreamExt;
use mysql_common::constants::StatusFlags;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session variables recognized ahead of a matching LOAD DATA statement.
pub const LDI_VAR_PREFIX: &str = "@maxscale.ldi.";

/// Upload chunk size fed to the backend. Stays well under the wire maximum
/// so a chunk is always one packet.
const LDI_CHUNK_SIZE: usize = 1 << 20;

/// In-flight chunks between the fetcher and the session.
const STREAM_DEPTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct LdiConfig {
    pub key: Option<String>,
    pub secret: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_verify: bool,
    pub use_http: bool,
    pub protocol_version: Option<u8>,
    pub import_user: Option<String>,
    pub import_password: Option<String>,
}

impl LdiConfig {
    pub fn from_params(params: &HashMap<String, String>) -> io::Result<Self> {
        let get = |key: &str| params.get(key).cloned();
        Ok(Self {
            key: get("key"),
            secret: get("secret"),
            region: get("region"),
            host: get("host"),
            port: match params.get("port") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    FilterConfigError::BadParameter {
                        name: "port".to_string(),
                        reason: "not a number".to_string(),
                    }
                })?),
                None => None,
            },
            no_verify: params.get("no_verify").map(|v| v == "true").unwrap_or(false),
            use_http: params.get("use_http").map(|v| v == "true").unwrap_or(false),
            protocol_version: match params.get("protocol_version") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    FilterConfigError::BadParameter {
                        name: "protocol_version".to_string(),
                        reason: "not a number".to_string(),
                    }
                })?),
                None => None,
            },
            import_user: get("import_user"),
            import_password: get("import_password"),
        })
    }

    /// Listener defaults overridden by whatever `@maxscale.ldi.*` variables
    /// the session has set.
    fn effective(&self, vars: &hashbrown::HashMap<String, String>) -> LdiConfig {
        let var = |suffix: &str| vars.get(&format!("{LDI_VAR_PREFIX}{suffix}")).cloned();
        LdiConfig {
            key: var("s3_key").or_else(|| self.key.clone()),
            secret: var("s3_secret").or_else(|| self.secret.clone()),
            region: var("s3_region").or_else(|| self.region.clone()),
            host: var("s3_host").or_else(|| self.host.clone()),
            port: var("s3_port")
                .and_then(|v| v.parse().ok())
                .or(self.port),
            no_verify: self.no_verify,
            use_http: self.use_http,
            protocol_version: var("s3_protocol_version")
                .and_then(|v| v.parse().ok())
                .or(self.protocol_version),
            import_user: var("import_user").or_else(|| self.import_user.clone()),
            import_password: var("import_password").or_else(|| self.import_password.clone()),
        }
    }

    fn object_url(&self, s3: &S3Url) -> String {
        let scheme = if self.use_http { "http" } else { "https" };
        let host = match (&self.host, &self.region) {
            (Some(host), _) => host.clone(),
            (None, Some(region)) => format!("s3.{region}.amazonaws.com"),
            (None, None) => "s3.amazonaws.com".to_string(),
        };
        match self.port {
            Some(port) => format!("{scheme}://{host}:{port}/{}/{}", s3.bucket, s3.filename),
            None => format!("{scheme}://{host}/{}/{}", s3.bucket, s3.filename),
        }
    }
}

pub struct LdiFilter {
    name: String,
    config: WorkerLocal<LdiConfig>,
}

impl LdiFilter {
    pub fn from_params(
        name: &str,
        workers: usize,
        params: &HashMap<String, String>,
    ) -> io::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            config: WorkerLocal::new(workers, Arc::new(LdiConfig::from_params(params)?)),
        })
    }
}

#[async_trait(?Send)]
impl Filter for LdiFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_session(&self, _session: &SessionInfo) -> io::Result<Box<dyn FilterSession>> {
        Ok(Box::new(LdiSession {
            defaults: self.config.get(current_worker_id().unwrap_or(0)),
            state: LdiState::Idle,
            pending: None,
        }))
    }

    fn diagnostics(&self) -> serde_json::Value {
        let config = self.config.get(current_worker_id().unwrap_or(0));
        json!({
            "host": config.host,
            "region": config.region,
            "use_http": config.use_http,
            "no_verify": config.no_verify,
        })
    }

    fn post_configure(&self, params: &HashMap<String, String>) -> io::Result<()> {
        self.config.publish(Arc::new(LdiConfig::from_params(params)?));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LdiState {
    Idle,
    /// Rewritten statement sent; waiting for the backend's LOCAL_INFILE
    /// prompt.
    Prepare,
    /// Fetched data is being streamed to the backend.
    Load,
}

pub struct LdiSession {
    defaults: Arc<LdiConfig>,
    state: LdiState,
    pending: Option<S3Url>,
}

impl LdiSession {
    /// `SET @maxscale.ldi.<key> = '<value>'`, answered locally with OK.
    fn try_session_var(sql: &str) -> Option<(String, String)> {
        let trimmed = sql.trim();
        let rest = trimmed.strip_prefix("SET ").or_else(|| {
            trimmed.strip_prefix("set ")
        })?;
        let rest = rest.trim_start();
        if !rest.starts_with(LDI_VAR_PREFIX) {
            return None;
        }
        let (name, value) = rest.split_once('=')?;
        let value = value.trim().trim_matches('\'').trim_matches('"');
        Some((name.trim().to_string(), value.to_string()))
    }
}

impl FilterSession for LdiSession {
    fn route_query(&mut self, ctx: &mut SessionCtx, buf: BufChain) -> FilterAction {
        if buf.props.contains(crate::buffer::BufProps::STREAM_DATA)
            || get_command(&buf) != Some(CommandCode::ComQuery)
        {
            return FilterAction::Forward(buf);
        }
        let sql_bytes = buf.copy_to_vec(1, buf.len().saturating_sub(1));
        let sql = String::from_utf8_lossy(&sql_bytes);

        if let Some((name, value)) = Self::try_session_var(&sql) {
            debug!("ldi: session variable {name} set");
            ctx.session_vars.insert(name, value);
            return FilterAction::Reply(BufChain::from_vec(build_ok_payload(
                0,
                0,
                StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            )));
        }

        let Ok(ldi) = parse_ldi(&sql) else {
            return FilterAction::Forward(buf);
        };
        let Ok(url) = parse_s3_url(&ldi.filename) else {
            // a plain file: the client streams it itself
            return FilterAction::Forward(buf);
        };

        // Rewrite so the backend prompts us for the data instead of asking
        // the client for a file it does not have.
        let rewritten = format!(
            "LOAD DATA LOCAL INFILE '{}' INTO TABLE {} {}",
            url.filename,
            ldi.quoted_table(),
            ldi.remaining_sql
        );
        let rewritten = rewritten.trim_end().to_string();
        info!(
            "ldi: rewriting bulk load of s3://{}/{} for table {}",
            url.bucket,
            url.filename,
            ldi.quoted_table()
        );
        let mut payload = Vec::with_capacity(1 + rewritten.len());
        payload.push(CommandCode::ComQuery as u8);
        payload.extend_from_slice(rewritten.as_bytes());
        let mut replacement = BufChain::from_vec(payload);
        replacement.buf_type = buf.buf_type;
        replacement.hints = buf.hints.clone();
        self.pending = Some(url);
        self.state = LdiState::Prepare;
        FilterAction::Forward(replacement)
    }

    fn client_reply(
        &mut self,
        ctx: &mut SessionCtx,
        buf: BufChain,
        route: &RouteInfo,
        summary: &ReplySummary,
    ) -> ReplyAction {
        match self.state {
            LdiState::Prepare if summary.is_load_data() => {
                let Some(url) = self.pending.take() else {
                    self.state = LdiState::Idle;
                    return ReplyAction::Forward(buf);
                };
                let config = self.defaults.effective(&ctx.session_vars);
                let (tx, rx) = mpsc::channel(STREAM_DEPTH);
                let cancel = Arc::new(AtomicBool::new(false));
                let task = fetch_object(config, url, tx, Arc::clone(&cancel));
                match &ctx.background {
                    Some(handle) => {
                        handle.spawn(task);
                    }
                    None => {
                        tokio::spawn(task);
                    }
                }
                ctx.active_stream = Some(LdiStream { rx, cancel });
                // the client never saw the LOCAL_INFILE prompt; its next
                // packet is the final verdict with this sequence
                ctx.reply_seq_override = Some(route.reply_seq);
                self.state = LdiState::Load;
                ReplyAction::Consumed
            }
            LdiState::Prepare if summary.is_error() => {
                // the backend refused the rewritten statement
                self.pending = None;
                self.state = LdiState::Idle;
                ReplyAction::Forward(buf)
            }
            LdiState::Load if summary.is_complete() => {
                if summary.is_error() {
                    warn!(
                        "ldi: bulk load failed: {}",
                        summary.error.as_deref().unwrap_or("unknown error")
                    );
                } else {
                    info!("ldi: bulk load done, {} rows", summary.affected_rows);
                }
                self.state = LdiState::Idle;
                ReplyAction::Forward(buf)
            }
            _ => ReplyAction::Forward(buf),
        }
    }

    fn close(&mut self, ctx: &mut SessionCtx) {
        // dropping the stream flips the cancel flag for the fetcher
        ctx.active_stream = None;
        self.pending = None;
        self.state = LdiState::Idle;
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({ "state": format!("{:?}", self.state) })
    }
}

/// Fetches the object and pushes it into the session in packet-sized chunks.
/// Cancellation is a shared flag checked per chunk; the in-flight request is
/// simply dropped.
async fn fetch_object(
    config: LdiConfig,
    url: S3Url,
    tx: mpsc::Sender<Result<Bytes, String>>,
    cancel: Arc<AtomicBool>,
) {
    let object_url = config.object_url(&url);
    debug!("ldi: fetching {object_url}");
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(config.no_verify)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            let _ = tx.send(Err(format!("failed to build HTTP client: {e}"))).await;
            return;
        }
    };
    let mut request = client.get(&object_url);
    if let (Some(key), Some(secret)) = (&config.key, &config.secret) {
        request = request.basic_auth(key, Some(secret));
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx
                .send(Err(format!("fetching {object_url} failed: {e}")))
                .await;
            return;
        }
    };
    if !response.status().is_success() {
        let _ = tx
            .send(Err(format!(
                "fetching {object_url} failed: HTTP {}",
                response.status()
            )))
            .await;
        return;
    }

    let mut stream = response.bytes_stream();
    let mut carry = Vec::new();
    while let Some(chunk) = stream.next().await {
        if cancel.load(Ordering::Relaxed) {
            debug!("ldi: fetch of {object_url} interrupted");
            return;
        }
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(format!("reading {object_url} failed: {e}"))).await;
                return;
            }
        };
        carry.extend_from_slice(&bytes);
        while carry.len() >= LDI_CHUNK_SIZE {
            let rest = carry.split_off(LDI_CHUNK_SIZE);
            let piece = Bytes::from(std::mem::replace(&mut carry, rest));
            counter_inc(LDI_BYTES_STREAMED, piece.len() as u64, Some(common_labels()));
            if tx.send(Ok(piece)).await.is_err() {
                return;
            }
        }
    }
    if !carry.is_empty() {
        counter_inc(LDI_BYTES_STREAMED, carry.len() as u64, Some(common_labels()));
        let _ = tx.send(Ok(Bytes::from(carry))).await;
    }
    // dropping tx closes the stream; the session sends the terminating
    // empty packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ReplyState;
    use crate::server::ClientAddr;
    use crate::session::SessionInfo;

    fn test_info() -> SessionInfo {
        SessionInfo {
            id: 1,
            user: Some("alice".to_string()),
            database: Some("app".to_string()),
            remote: ClientAddr::Local,
            thread_id: 1,
            auth_token: vec![],
            external_identity: None,
            client_caps: crate::server::default_capabilities(),
            collation: 33,
        }
    }

    fn query_chain(sql: &str) -> BufChain {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(sql.as_bytes());
        let mut chain = BufChain::from_vec(payload);
        chain.mark_statement();
        chain
    }

    async fn fresh_session() -> (LdiSession, SessionCtx) {
        let session = LdiSession {
            defaults: Arc::new(LdiConfig::default()),
            state: LdiState::Idle,
            pending: None,
        };
        (session, SessionCtx::new(test_info()))
    }

    #[tokio::test]
    async fn test_s3_statement_is_rewritten() {
        let (mut session, mut ctx) = fresh_session().await;
        let chain = query_chain(
            "LOAD DATA LOCAL INFILE 's3://bkt/data.csv' INTO TABLE t FIELDS TERMINATED BY ','",
        );
        let FilterAction::Forward(rewritten) = session.route_query(&mut ctx, chain) else {
            panic!("expected forward");
        };
        let sql = String::from_utf8(rewritten.copy_to_vec(1, rewritten.len() - 1)).unwrap();
        assert_eq!(
            sql,
            "LOAD DATA LOCAL INFILE 'data.csv' INTO TABLE `t` FIELDS TERMINATED BY ','"
        );
        assert_eq!(session.state, LdiState::Prepare);
        assert_eq!(
            session.pending,
            Some(S3Url {
                bucket: "bkt".to_string(),
                filename: "data.csv".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_plain_ldi_passes_through() {
        let (mut session, mut ctx) = fresh_session().await;
        let chain = query_chain("LOAD DATA LOCAL INFILE 'x.csv' INTO TABLE t");
        let FilterAction::Forward(forwarded) = session.route_query(&mut ctx, chain) else {
            panic!("expected forward");
        };
        let sql = String::from_utf8(forwarded.copy_to_vec(1, forwarded.len() - 1)).unwrap();
        assert!(sql.contains("'x.csv'"));
        assert_eq!(session.state, LdiState::Idle);
    }

    #[tokio::test]
    async fn test_session_variable_intercepted() {
        let (mut session, mut ctx) = fresh_session().await;
        let chain = query_chain("SET @maxscale.ldi.s3_key = 'AKIA123'");
        let FilterAction::Reply(reply) = session.route_query(&mut ctx, chain) else {
            panic!("expected synthesized OK");
        };
        assert!(reply.is_ok_packet());
        assert_eq!(
            ctx.session_vars.get("@maxscale.ldi.s3_key").map(String::as_str),
            Some("AKIA123")
        );
    }

    #[tokio::test]
    async fn test_local_infile_prompt_starts_stream_and_is_consumed() {
        let (mut session, mut ctx) = fresh_session().await;
        let chain = query_chain("LOAD DATA LOCAL INFILE 's3://bkt/f.csv' INTO TABLE t");
        let _ = session.route_query(&mut ctx, chain);

        let mut prompt = vec![0xfb];
        prompt.extend_from_slice(b"f.csv");
        let summary = ReplySummary {
            state: Some(ReplyState::LoadData),
            ..Default::default()
        };
        let route = RouteInfo {
            reply_seq: 1,
            ..Default::default()
        };
        let action = session.client_reply(&mut ctx, BufChain::from_vec(prompt), &route, &summary);
        assert!(matches!(action, ReplyAction::Consumed));
        assert!(ctx.active_stream.is_some());
        assert_eq!(ctx.reply_seq_override, Some(1));
        assert_eq!(session.state, LdiState::Load);
    }

    #[tokio::test]
    async fn test_prepare_error_resets_state() {
        let (mut session, mut ctx) = fresh_session().await;
        let chain = query_chain("LOAD DATA LOCAL INFILE 's3://bkt/f.csv' INTO TABLE t");
        let _ = session.route_query(&mut ctx, chain);

        let summary = ReplySummary {
            state: Some(ReplyState::Error),
            error: Some("table gone".to_string()),
            ..Default::default()
        };
        let action = session.client_reply(
            &mut ctx,
            BufChain::from_vec(vec![0xff]),
            &RouteInfo::default(),
            &summary,
        );
        assert!(matches!(action, ReplyAction::Forward(_)));
        assert_eq!(session.state, LdiState::Idle);
        assert!(session.pending.is_none());
        assert!(ctx.active_stream.is_none());
    }

    #[test]
    fn test_config_overrides_from_session_vars() {
        let defaults = LdiConfig {
            key: Some("listener-key".to_string()),
            region: Some("eu-north-1".to_string()),
            ..Default::default()
        };
        let mut vars = hashbrown::HashMap::new();
        vars.insert(
            "@maxscale.ldi.s3_key".to_string(),
            "session-key".to_string(),
        );
        vars.insert("@maxscale.ldi.s3_port".to_string(), "9000".to_string());
        let effective = defaults.effective(&vars);
        assert_eq!(effective.key.as_deref(), Some("session-key"));
        assert_eq!(effective.region.as_deref(), Some("eu-north-1"));
        assert_eq!(effective.port, Some(9000));
    }

    #[tokio::test]
    async fn test_fetch_object_streams_and_closes_channel() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = b"a,b\nc,d\n";
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        });

        let config = LdiConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(addr.port()),
            use_http: true,
            ..Default::default()
        };
        let url = S3Url {
            bucket: "bkt".to_string(),
            filename: "data.csv".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(STREAM_DEPTH);
        fetch_object(config, url, tx, Arc::new(AtomicBool::new(false))).await;

        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.extend_from_slice(&item.unwrap());
        }
        assert_eq!(got, b"a,b\nc,d\n");
    }

    #[tokio::test]
    async fn test_fetch_object_reports_http_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let config = LdiConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(addr.port()),
            use_http: true,
            ..Default::default()
        };
        let url = S3Url {
            bucket: "bkt".to_string(),
            filename: "missing.csv".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(STREAM_DEPTH);
        fetch_object(config, url, tx, Arc::new(AtomicBool::new(false))).await;
        let first = rx.recv().await.unwrap();
        let err = first.unwrap_err();
        assert!(err.contains("404"), "{err}");
    }

    #[test]
    fn test_object_url_shapes() {
        let url = S3Url {
            bucket: "bkt".to_string(),
            filename: "data.csv".to_string(),
        };
        let mut config = LdiConfig {
            host: Some("minio.local".to_string()),
            port: Some(9000),
            use_http: true,
            ..Default::default()
        };
        assert_eq!(
            config.object_url(&url),
            "http://minio.local:9000/bkt/data.csv"
        );
        config.host = None;
        config.port = None;
        config.use_http = false;
        config.region = Some("us-east-2".to_string());
        assert_eq!(
            config.object_url(&url),
            "https://s3.us-east-2.amazonaws.com/bkt/data.csv"
        );
    }
}
