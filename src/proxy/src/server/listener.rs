//! Listener configuration and the accept loop. The accept loop runs on the
//! main worker; every accepted socket is handed to a routing worker elected
//! round-robin and stays pinned there. File-descriptor exhaustion on accept
//! backs off geometrically and then declines the connection instead of
//! spinning.

use crate::server::gate_server::GateServer;
use crate::server::ClientAddr;
use crate::worker::WorkerPool;

use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

use crate::server::auth::AuthOptions;

/// Total accept backoff budget before a connection attempt is dropped.
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Protocol module name; only the MySQL/MariaDB client protocol exists.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// TCP port, exclusive with `socket`.
    #[serde(default)]
    pub port: Option<u16>,
    /// UNIX-domain socket path. Clients connecting here authenticate as
    /// `localhost`.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default = "default_authenticator")]
    pub authenticator: String,
    #[serde(default)]
    pub authenticator_options: AuthOptions,
    /// Ordered filter list applied to every session of this listener.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Write-queue depth used as the backpressure signal for bulk streams.
    #[serde(default = "default_write_watermark")]
    pub write_watermark: usize,
    /// TLS material for the listener; cipher policy belongs to rustls.
    #[serde(default)]
    pub ssl: Option<SslConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_protocol() -> String {
    "mariadb".to_string()
}

fn default_authenticator() -> String {
    "mysql_native_password".to_string()
}

fn default_write_watermark() -> usize {
    65536
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            port: None,
            socket: None,
            authenticator: default_authenticator(),
            authenticator_options: AuthOptions::default(),
            filters: Vec::new(),
            write_watermark: default_write_watermark(),
            ssl: None,
        }
    }
}

impl ListenerConfig {
    pub fn tcp(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn unix(path: PathBuf) -> Self {
        Self {
            socket: Some(path),
            ..Default::default()
        }
    }
}

pub enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerSocket {
    pub async fn bind(config: &ListenerConfig) -> io::Result<ListenerSocket> {
        if let Some(path) = &config.socket {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            info!("listening on unix socket {}", path.display());
            Ok(ListenerSocket::Unix(listener))
        } else if let Some(port) = config.port {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            info!("listening on 0.0.0.0:{port}");
            Ok(ListenerSocket::Tcp(listener))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listener needs either a port or a socket path",
            ))
        }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    // EMFILE (per-process) or ENFILE (system-wide)
    matches!(e.raw_os_error(), Some(24) | Some(23))
}

/// Accepts connections until the socket errors fatally, electing a worker
/// per connection. EMFILE/ENFILE retries with 1-2-4-… ms backoff, at most
/// [`ACCEPT_BACKOFF_CAP`] total, then drops the attempt and keeps listening.
pub async fn accept_loop(
    socket: ListenerSocket,
    pool: Arc<WorkerPool>,
    server: Arc<GateServer>,
) -> io::Result<()> {
    let mut backoff = Duration::from_millis(1);
    let mut backed_off = Duration::ZERO;
    loop {
        let accepted = match &socket {
            ListenerSocket::Tcp(listener) => match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (r, w) = stream.into_split();
                    Some((Box::new(r) as BoxedRead, Box::new(w) as BoxedWrite, ClientAddr::Tcp(addr)))
                }
                Err(e) => {
                    handle_accept_error(e, &mut backoff, &mut backed_off).await?;
                    None
                }
            },
            ListenerSocket::Unix(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    let (r, w) = stream.into_split();
                    Some((Box::new(r) as BoxedRead, Box::new(w) as BoxedWrite, ClientAddr::Local))
                }
                Err(e) => {
                    handle_accept_error(e, &mut backoff, &mut backed_off).await?;
                    None
                }
            },
        };
        let Some((reader, writer, remote)) = accepted else {
            continue;
        };
        backoff = Duration::from_millis(1);
        backed_off = Duration::ZERO;

        let server = Arc::clone(&server);
        let handle = pool.elect();
        let posted = handle.post(Box::new(move |worker| {
            let remote_str = remote.to_string();
            worker.spawn(async move {
                if let Err(e) = server.handle_conn(reader, writer, remote).await {
                    warn!("connection from {remote_str} ended with error: {e:?}");
                }
            });
        }));
        if !posted {
            warn!("worker queue full, connection dropped");
        }
    }
}

pub type BoxedRead = Box<dyn tokio::io::AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

async fn handle_accept_error(
    e: io::Error,
    backoff: &mut Duration,
    backed_off: &mut Duration,
) -> io::Result<()> {
    if is_fd_exhaustion(&e) {
        if *backed_off >= ACCEPT_BACKOFF_CAP {
            warn!("accept: fd limit reached, dropping connection attempt");
            *backoff = Duration::from_millis(1);
            *backed_off = Duration::ZERO;
            return Ok(());
        }
        warn!("accept: fd limit reached, backing off {backoff:?}");
        tokio::time::sleep(*backoff).await;
        *backed_off += *backoff;
        *backoff = (*backoff * 2).min(ACCEPT_BACKOFF_CAP);
        return Ok(());
    }
    // transient per-connection failures (ECONNABORTED etc.) are not fatal
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    ) {
        return Ok(());
    }
    Err(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ListenerConfig::tcp(3310);
        assert_eq!(config.protocol, "mariadb");
        assert_eq!(config.authenticator, "mysql_native_password");
        assert_eq!(config.port, Some(3310));
        assert!(config.socket.is_none());
    }

    #[test]
    fn test_unix_listener_reports_localhost() {
        let config = ListenerConfig::unix(PathBuf::from("/tmp/gate.sock"));
        assert!(config.socket.is_some());
        assert_eq!(ClientAddr::Local.to_string(), "localhost");
    }

    #[tokio::test]
    async fn test_fd_exhaustion_backoff_stays_bounded() {
        let mut backoff = Duration::from_millis(1);
        let mut backed_off = Duration::ZERO;
        let start = std::time::Instant::now();
        // repeated EMFILE must never exceed the cap per attempt
        for _ in 0..16 {
            let e = io::Error::from_raw_os_error(24);
            handle_accept_error(e, &mut backoff, &mut backed_off)
                .await
                .unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
