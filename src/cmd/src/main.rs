use clap::Parser;
use common::ShutdownMessage;
use proxy::filter::ldi::LdiFilter;
use proxy::filter::namedserver::NamedServerFilter;
use proxy::filter::Filter;
use proxy::router::Router;
use proxy::server::auth::AuthRegistry;
use proxy::server::gate_server::GateServer;
use proxy::server::listener::{accept_loop, ListenerSocket};
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::worker::{WorkerPool, WorkerPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("SqlGate receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("SqlGate receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn build_filters(args: &ProxyServerArgs) -> anyhow::Result<Vec<Arc<dyn Filter>>> {
    let mut filters: Vec<Arc<dyn Filter>> = Vec::new();
    if let Some(params) = args.hint_filter_params() {
        filters.push(Arc::new(NamedServerFilter::from_params(
            "hintfilter",
            args.workers,
            &params,
        )?));
    }
    if let Some(params) = args.ldi_filter_params() {
        filters.push(Arc::new(LdiFilter::from_params(
            "ldi",
            args.workers,
            &params,
        )?));
    }
    Ok(filters)
}

fn main() -> anyhow::Result<()> {
    let args = ProxyServerArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    // setup tracing, quiet the http stack.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    if args.enable_metrics {
        common::metrics::init_metrics_context();
    }

    info!("SqlGate running config args={:?}", args);
    let pool = Arc::new(WorkerPool::new(WorkerPoolOptions {
        workers: args.workers,
        ..Default::default()
    })?);

    let listener_config = args.listener_config();
    let registry = AuthRegistry::default();
    let authenticator = registry.create(&listener_config.authenticator, &args.auth_options())?;
    let filters = build_filters(&args)?;
    let router: Arc<dyn Router> = Arc::new(args.forward_router());

    let server = Arc::new(
        GateServer::new(listener_config, authenticator, filters, router)
            .with_background(pool.background_handle()),
    );
    let loaded = server.load_users()?;
    info!("loaded {loaded} users for listener authentication");

    // the main worker: accept loop plus signal handling
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (shutdown_tx, _shutdown_rx) = watch::channel(ShutdownMessage::Init);
    let result: anyhow::Result<()> = runtime.block_on(async {
        let socket = ListenerSocket::bind(server.listener()).await?;
        tokio::select! {
            shutdown_msg = shutdown_signal() => {
                info!("SqlGate shutting down: {shutdown_msg:?}");
                let _ = shutdown_tx.send(shutdown_msg);
            }
            rs = accept_loop(socket, Arc::clone(&pool), Arc::clone(&server)) => {
                rs?;
            }
        }
        Ok(())
    });

    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown("process exit"),
        Err(_) => info!("worker pool still referenced at exit"),
    }
    result
}
