pub const PROXY_MAX_CONN: &str = "proxy_max_connections";
pub const PROXY_CURR_CONN: &str = "proxy_curr_connections";
pub const PROXY_CONN_TOTAL: &str = "proxy_connections_total";
pub const PROXY_COM_LATENCY: &str = "proxy_com_latency";
pub const PROXY_AUTH_FAILURES: &str = "proxy_auth_failures_total";
pub const FILTER_DIVERTED: &str = "filter_queries_diverted_total";
pub const FILTER_UNDIVERTED: &str = "filter_queries_undiverted_total";
pub const LDI_BYTES_STREAMED: &str = "ldi_bytes_streamed_total";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyMaxConnections, max_connections, MetricType::Gauge, PROXY_MAX_CONN, "The max number of connections allowed by the proxy."},
    { ProxyCurrentConnections, current_connections, MetricType::Gauge, PROXY_CURR_CONN, "The current connection count of the proxy."},
    { ProxyConnectionsTotal, connections_total, MetricType::Counter, PROXY_CONN_TOTAL, "Client connections accepted since startup."},
    { ProxyComLatency, com_latency, MetricType::Histogram, PROXY_COM_LATENCY, "Latency of command execution."},
    { ProxyAuthFailures, auth_failures, MetricType::Counter, PROXY_AUTH_FAILURES, "Client authentication failures."},
    { FilterDiverted, filter_diverted, MetricType::Counter, FILTER_DIVERTED, "Statements diverted by the routing-hint filter."},
    { FilterUndiverted, filter_undiverted, MetricType::Counter, FILTER_UNDIVERTED, "Statements left unhinted by the routing-hint filter."},
    { LdiBytesStreamed, ldi_bytes_streamed, MetricType::Counter, LDI_BYTES_STREAMED, "Bytes streamed into LOAD DATA uploads."}
);
