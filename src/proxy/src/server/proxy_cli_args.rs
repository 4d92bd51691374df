use crate::router::forward::ForwardRouter;
use crate::server::auth::AuthOptions;
use crate::server::listener::ListenerConfig;

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "sqlgate",
    version = "0.1.0",
    about = "protocol-aware reverse proxy for MySQL/MariaDB."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKERS", default_value_t = 4)]
    pub workers: usize,
    #[clap(long, value_name = "PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(long, value_name = "UNIX_SOCKET")]
    pub socket: Option<PathBuf>,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, value_name = "AUTHENTICATOR", default_value = "mysql_native_password")]
    pub authenticator: String,
    /// authenticator options, `key=value` pairs separated by `;`
    /// (e.g. "users=alice:pw,bob:")
    #[clap(long, value_name = "AUTH_OPTIONS")]
    pub auth_options: Option<String>,
    /// routing-hint filter parameters, `key=value` pairs separated by `;`
    /// (e.g. "match01=^INSERT;target01=master-a")
    #[clap(long, value_name = "HINT_FILTER")]
    pub hint_filter: Option<String>,
    /// S3 bulk-load filter parameters, `key=value` pairs separated by `;`
    #[clap(long, value_name = "LDI_FILTER")]
    pub ldi_filter: Option<String>,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    #[clap(long, value_name = "WRITE_WATERMARK", default_value_t = 65536)]
    pub write_watermark: usize,
    #[clap(subcommand)]
    pub backend: Option<BackendConfigArgs>,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
#[command(next_line_help = true)]
pub enum BackendConfigArgs {
    #[command(long_about = "Forward to a fixed backend list, `name=addr` pairs.")]
    Backend {
        #[clap(long)]
        backend_addr: String,
    },
}

fn parse_kv_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl ProxyServerArgs {
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = match &self.socket {
            Some(path) => ListenerConfig::unix(path.clone()),
            None => ListenerConfig::tcp(self.port),
        };
        config.authenticator = self.authenticator.clone();
        config.authenticator_options = self.auth_options();
        config.write_watermark = self.write_watermark;
        if self.hint_filter.is_some() {
            config.filters.push("hintfilter".to_string());
        }
        if self.ldi_filter.is_some() {
            config.filters.push("ldi".to_string());
        }
        config
    }

    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            workers: self.workers,
            params: self
                .auth_options
                .as_deref()
                .map(parse_kv_pairs)
                .unwrap_or_default(),
        }
    }

    pub fn hint_filter_params(&self) -> Option<HashMap<String, String>> {
        self.hint_filter.as_deref().map(parse_kv_pairs)
    }

    pub fn ldi_filter_params(&self) -> Option<HashMap<String, String>> {
        self.ldi_filter.as_deref().map(parse_kv_pairs)
    }

    pub fn forward_router(&self) -> ForwardRouter {
        match &self.backend {
            Some(BackendConfigArgs::Backend { backend_addr }) => {
                ForwardRouter::from_addr_list(backend_addr)
            }
            // testing default
            None => ForwardRouter::from_addr_list("backend=127.0.0.1:3315"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_pair_parsing() {
        let params = parse_kv_pairs("match01=^INSERT;target01=master-a; user = admin");
        assert_eq!(params.get("match01").unwrap(), "^INSERT");
        assert_eq!(params.get("target01").unwrap(), "master-a");
        assert_eq!(params.get("user").unwrap(), "admin");
    }

    #[test]
    fn test_listener_from_args() {
        let args = ProxyServerArgs {
            port: 3310,
            workers: 2,
            authenticator: "mysql_native_password".to_string(),
            auth_options: Some("users=alice:pw".to_string()),
            hint_filter: Some("match01=^SELECT;target01=slave-b".to_string()),
            ..Default::default()
        };
        let config = args.listener_config();
        assert_eq!(config.port, Some(3310));
        assert_eq!(config.filters, vec!["hintfilter".to_string()]);
        assert_eq!(
            config.authenticator_options.params.get("users").unwrap(),
            "alice:pw"
        );
    }
}
