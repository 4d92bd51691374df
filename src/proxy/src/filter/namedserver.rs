//! Routing-hint filter: matches statements against an ordered regex list and
//! attaches routing hints for the router. Activation can be restricted by
//! client source address (dotted-quad with `%` wildcards, exact IPs, or
//! hostnames) and by user. Hints chosen at COM_STMT_PREPARE time are
//! remembered per statement id and re-attached to every execution.

use crate::buffer::{BufChain, BufType};
use crate::filter::{
    Filter, FilterAction, FilterCaps, FilterConfigError, FilterSession, ReplyAction,
};
use crate::hint::Hint;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::get_command;
use crate::router::{ReplySummary, RouteInfo};
use crate::session::{SessionCtx, SessionInfo};
use crate::server::ClientAddr;
use crate::worker::current_worker_id;
use crate::worker::worker_local::WorkerLocal;

use async_trait::async_trait;
use common::metrics::metric_def::{FILTER_DIVERTED, FILTER_UNDIVERTED};
use common::metrics::{common_labels, counter_inc};
use regex::{Regex, RegexBuilder};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the indexed `matchNN`/`targetNN` parameter pairs.
pub const N_REGEX_MAX: usize = 25;

/// One compiled regex and the hints a match attaches.
pub struct RegexToTargets {
    pub match_str: String,
    regex: Regex,
    pub hints: Vec<Hint>,
}

impl std::fmt::Debug for RegexToTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexToTargets")
            .field("match", &self.match_str)
            .field("hints", &self.hints)
            .finish()
    }
}

/// A configured source restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceAddr {
    /// Dotted quad, `%` wildcards zeroed out; only the first `octets` octets
    /// are compared.
    V4Pattern { address: String, base: [u8; 4], octets: u8 },
    Exact(IpAddr),
}

/// Immutable configuration snapshot shared by all sessions built after a
/// (re)configure.
#[derive(Debug, Default)]
pub struct Setup {
    sources: Vec<SourceAddr>,
    hostnames: Vec<String>,
    mapping: Vec<RegexToTargets>,
    user: Option<String>,
}

pub struct NamedServerFilter {
    name: String,
    setup: WorkerLocal<Setup>,
    /// Totals over all sessions. Lockless and shared, so momentarily stale
    /// reads are possible.
    total_diverted: Arc<AtomicU64>,
    total_undiverted: Arc<AtomicU64>,
}

impl NamedServerFilter {
    pub fn from_params(
        name: &str,
        workers: usize,
        params: &HashMap<String, String>,
    ) -> io::Result<Self> {
        let setup = build_setup(params)?;
        Ok(Self {
            name: name.to_string(),
            setup: WorkerLocal::new(workers, Arc::new(setup)),
            total_diverted: Arc::new(AtomicU64::new(0)),
            total_undiverted: Arc::new(AtomicU64::new(0)),
        })
    }

    fn snapshot(&self) -> Arc<Setup> {
        self.setup.get(current_worker_id().unwrap_or(0))
    }
}

fn regex_options(raw: Option<&String>) -> (bool, bool) {
    // (case_insensitive, extended) - matching is case-insensitive unless
    // `case` is given explicitly
    let mut ignorecase = true;
    let mut extended = false;
    if let Some(raw) = raw {
        for opt in raw.split(',').map(str::trim) {
            match opt {
                "ignorecase" => ignorecase = true,
                "case" => ignorecase = false,
                "extended" => extended = true,
                "" => {}
                other => warn!("unknown regex option {other:?} ignored"),
            }
        }
    }
    (ignorecase, extended)
}

fn compile(match_str: &str, ignorecase: bool, extended: bool) -> Result<Regex, FilterConfigError> {
    RegexBuilder::new(match_str)
        .case_insensitive(ignorecase)
        .ignore_whitespace(extended)
        .build()
        .map_err(|e| FilterConfigError::BadRegex {
            pattern: match_str.to_string(),
            source: e,
        })
}

fn parse_targets(target: &str, legacy_mode: bool) -> Result<Vec<Hint>, FilterConfigError> {
    let items: Vec<&str> = target
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        return Err(FilterConfigError::Invalid(
            "empty routing target".to_string(),
        ));
    }
    if items.len() == 1 {
        let only = items[0];
        if only.starts_with("->") && !matches!(only, "->master" | "->slave" | "->all") {
            return Err(FilterConfigError::Invalid(format!(
                "invalid special target {only:?}"
            )));
        }
        return Ok(vec![Hint::from_target(only)]);
    }
    // a list can only name concrete servers; legacy mode never had lists
    if legacy_mode || items.iter().any(|t| t.starts_with("->")) {
        return Err(FilterConfigError::Invalid(format!(
            "invalid target list {target:?}"
        )));
    }
    Ok(items
        .iter()
        .map(|t| Hint::RouteToNamedTarget(t.to_string()))
        .collect())
}

/// `%` wildcards stand for whole 8-bit groups: "1.2.%.%" compares the first
/// two octets only. Match-any ("%" or "%.%.%.%") is not allowed.
fn validate_ipv4_pattern(host: &str) -> bool {
    if host.starts_with('%') || host.starts_with('.') || host.len() > 15 {
        return false;
    }
    let mut groups = 0;
    for group in host.split('.') {
        groups += 1;
        if group != "%" && (group.is_empty() || group.parse::<u8>().is_err()) {
            return false;
        }
    }
    groups == 4
}

fn parse_source(token: &str) -> Result<SourceAddr, String> {
    if validate_ipv4_pattern(token) {
        let mut base = [0u8; 4];
        let mut octets = 4u8;
        let mut wildcard_seen = false;
        for (i, group) in token.split('.').enumerate() {
            if group == "%" {
                if !wildcard_seen {
                    octets = i as u8;
                    wildcard_seen = true;
                }
                base[i] = 0;
            } else {
                if wildcard_seen {
                    return Err(format!("wildcard before literal group in {token:?}"));
                }
                base[i] = group.parse::<u8>().expect("validated above");
            }
        }
        info!("source {token:?} valid, comparing {octets} octets");
        return Ok(SourceAddr::V4Pattern {
            address: token.to_string(),
            base,
            octets,
        });
    }
    token
        .parse::<IpAddr>()
        .map(SourceAddr::Exact)
        .map_err(|_| format!("{token:?} is not an address"))
}

fn build_setup(params: &HashMap<String, String>) -> io::Result<Setup> {
    let (ignorecase, extended) = regex_options(params.get("options"));
    let mut mapping = Vec::new();

    // legacy match/server pair
    let legacy_match = params.get("match");
    let legacy_server = params.get("server");
    match (legacy_match, legacy_server) {
        (Some(m), Some(s)) => {
            mapping.push(RegexToTargets {
                match_str: m.clone(),
                regex: compile(m, ignorecase, extended)?,
                hints: parse_targets(s, true)?,
            });
        }
        (None, None) => {}
        _ => {
            return Err(FilterConfigError::Invalid(
                "'match' and 'server' must be set together; \
                 use 'match01' and 'target01' etc. for indexed parameters"
                    .to_string(),
            )
            .into());
        }
    }

    // indexed pairs; the array may be sparse, gaps are skipped
    for idx in 1..=N_REGEX_MAX {
        let match_key = format!("match{idx:02}");
        let target_key = format!("target{idx:02}");
        match (params.get(&match_key), params.get(&target_key)) {
            (Some(m), Some(t)) => {
                mapping.push(RegexToTargets {
                    match_str: m.clone(),
                    regex: compile(m, ignorecase, extended)?,
                    hints: parse_targets(t, false)?,
                });
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(FilterConfigError::BadParameter {
                    name: match_key,
                    reason: format!("does not have a matching {target_key}"),
                }
                .into());
            }
            (None, Some(_)) => {
                return Err(FilterConfigError::BadParameter {
                    name: target_key,
                    reason: format!("does not have a matching {match_key}"),
                }
                .into());
            }
        }
    }

    let mut sources = Vec::new();
    let mut hostnames = Vec::new();
    if let Some(raw) = params.get("source") {
        for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_source(token) {
                Ok(source) => sources.push(source),
                Err(reason) => {
                    info!("source {token:?}: {reason}; treating it as a hostname");
                    hostnames.push(token.to_string());
                }
            }
        }
    }

    Ok(Setup {
        sources,
        hostnames,
        mapping,
        user: params.get("user").cloned(),
    })
}

/// IPv6-mapped IPv4 reduces to IPv4 before any comparison.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn check_source_host(setup: &Setup, remote: &ClientAddr) -> bool {
    // UNIX-domain clients count as localhost
    let ip = match remote.ip() {
        Some(ip) => normalize_ip(ip),
        None => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    };
    for source in &setup.sources {
        match (source, ip) {
            (SourceAddr::V4Pattern { address, base, octets }, IpAddr::V4(v4)) => {
                let client = v4.octets();
                if client[..*octets as usize] == base[..*octets as usize] {
                    debug!("client {ip} matches source {address}");
                    return true;
                }
            }
            (SourceAddr::Exact(exact), ip) => {
                if normalize_ip(*exact) == ip {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

async fn check_source_hostnames(setup: &Setup, remote: &ClientAddr) -> bool {
    let Some(ip) = remote.ip().map(normalize_ip) else {
        return setup.hostnames.iter().any(|h| h == "localhost");
    };
    for host in &setup.hostnames {
        match tokio::net::lookup_host((host.as_str(), 0)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if normalize_ip(addr.ip()) == ip {
                        debug!("client {ip} matches host source {host}");
                        return true;
                    }
                }
            }
            Err(e) => {
                info!("failed to resolve {host:?}: {e}");
            }
        }
    }
    false
}

#[async_trait(?Send)]
impl Filter for NamedServerFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_session(&self, session: &SessionInfo) -> io::Result<Box<dyn FilterSession>> {
        let setup = self.snapshot();
        let mut active = true;
        let mut ip_found = false;
        if !setup.sources.is_empty() {
            ip_found = check_source_host(&setup, &session.remote);
            active = ip_found;
        }
        // hostnames are only consulted when no literal source matched
        if !setup.hostnames.is_empty() && !ip_found {
            active = check_source_hostnames(&setup, &session.remote).await;
        }
        if let Some(user) = &setup.user {
            if session.user.as_deref() != Some(user.as_str()) {
                active = false;
            }
        }
        Ok(Box::new(NamedServerSession {
            filter_diverted: Arc::clone(&self.total_diverted),
            filter_undiverted: Arc::clone(&self.total_undiverted),
            setup,
            active,
            n_diverted: 0,
            n_undiverted: 0,
            current_prep_hints: None,
        }))
    }

    fn capabilities(&self) -> FilterCaps {
        FilterCaps::STMT_INPUT
    }

    fn diagnostics(&self) -> serde_json::Value {
        let setup = self.snapshot();
        json!({
            "queries_diverted": self.total_diverted.load(Ordering::Relaxed),
            "queries_undiverted": self.total_undiverted.load(Ordering::Relaxed),
            "mappings": setup.mapping.iter().map(|m| json!({
                "match": m.match_str,
                "targets": m.hints.iter().map(|h| format!("{h:?}")).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "sources": setup.sources.iter().map(|s| match s {
                SourceAddr::V4Pattern { address, .. } => address.clone(),
                SourceAddr::Exact(ip) => ip.to_string(),
            }).collect::<Vec<_>>(),
            "user": setup.user,
        })
    }

    fn post_configure(&self, params: &HashMap<String, String>) -> io::Result<()> {
        let setup = build_setup(params)?;
        self.setup.publish(Arc::new(setup));
        Ok(())
    }
}

pub struct NamedServerSession {
    setup: Arc<Setup>,
    active: bool,
    n_diverted: u64,
    n_undiverted: u64,
    filter_diverted: Arc<AtomicU64>,
    filter_undiverted: Arc<AtomicU64>,
    /// Hints matched for an in-flight COM_STMT_PREPARE, keyed to the
    /// statement id once the prepare OK reveals it.
    current_prep_hints: Option<Vec<Hint>>,
}

impl NamedServerSession {
    fn find_hints(&self, sql: &[u8]) -> Option<&RegexToTargets> {
        let text = String::from_utf8_lossy(sql);
        self.setup.mapping.iter().find(|m| m.regex.is_match(&text))
    }

    fn inc_diverted(&mut self, diverted: bool) {
        if diverted {
            self.n_diverted += 1;
            self.filter_diverted.fetch_add(1, Ordering::Relaxed);
            counter_inc(FILTER_DIVERTED, 1, Some(common_labels()));
        } else {
            self.n_undiverted += 1;
            self.filter_undiverted.fetch_add(1, Ordering::Relaxed);
            counter_inc(FILTER_UNDIVERTED, 1, Some(common_labels()));
        }
    }
}

impl FilterSession for NamedServerSession {
    fn route_query(&mut self, ctx: &mut SessionCtx, mut buf: BufChain) -> FilterAction {
        if !self.active || buf.props.contains(crate::buffer::BufProps::STREAM_DATA) {
            return FilterAction::Forward(buf);
        }
        let com = get_command(&buf);
        match com {
            Some(CommandCode::ComQuery) if buf.buf_type == BufType::SingleStatement => {
                let sql = buf.copy_to_vec(1, buf.len().saturating_sub(1));
                let matched = self.find_hints(&sql).map(|m| m.hints.clone());
                self.inc_diverted(matched.is_some());
                if let Some(hints) = matched {
                    for hint in hints {
                        buf.add_hint(hint);
                    }
                }
            }
            Some(CommandCode::ComStmtPrepare) => {
                // The prepare itself routes normally; remember the hints so
                // executions of the statement can be hinted once the id is
                // known.
                let sql = buf.copy_to_vec(1, buf.len().saturating_sub(1));
                self.current_prep_hints = self.find_hints(&sql).map(|m| m.hints.clone());
            }
            Some(
                CommandCode::ComStmtExecute
                | CommandCode::ComStmtBulkExecute
                | CommandCode::ComStmtSendLongData
                | CommandCode::ComStmtFetch,
            ) => {
                let remembered = buf
                    .ps_id
                    .and_then(|id| ctx.statements.get(id))
                    .map(|entry| entry.hints.clone())
                    .unwrap_or_default();
                self.inc_diverted(!remembered.is_empty());
                for hint in remembered {
                    buf.add_hint(hint);
                }
            }
            _ => {}
        }
        FilterAction::Forward(buf)
    }

    fn client_reply(
        &mut self,
        ctx: &mut SessionCtx,
        buf: BufChain,
        _route: &RouteInfo,
        summary: &ReplySummary,
    ) -> ReplyAction {
        if let Some(hints) = self.current_prep_hints.take() {
            match summary.generated_ps_id {
                Some(ps_id) if !summary.is_error() => {
                    ctx.statements.set_hints(ps_id, hints);
                }
                _ if summary.is_error() => {
                    // preparation failed; the remembered hints die here
                }
                _ => {
                    // mid-response packet of something else; keep waiting
                    self.current_prep_hints = Some(hints);
                }
            }
        }
        ReplyAction::Forward(buf)
    }

    fn diagnostics(&self) -> serde_json::Value {
        json!({
            "session_queries_diverted": self.n_diverted,
            "session_queries_undiverted": self.n_undiverted,
            "active": self.active,
        })
    }
}
