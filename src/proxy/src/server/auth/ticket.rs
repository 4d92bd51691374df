//! The external-ticket mechanism. The server answers the client's handshake
//! response with an AuthSwitchRequest naming the mechanism and a service
//! principal identifier; the client replies with an opaque token which is
//! validated against an external authority. On success the authenticated
//! identity is compared to the user table entry (or an operator-supplied
//! override). The raw token stays on the session so a backend authenticator
//! can re-present it end to end.

use crate::buffer::BufChain;
use crate::protocol::mysql::constants::AuthPluginName;
use crate::server::auth::{
    new_user_table_cell, AuthDecision, AuthOptions, AuthResult, Authenticator, ClientAuthState,
    UserEntry, UserTable, UserTableCell,
};
use crate::server::listener::ListenerConfig;
use crate::worker::current_worker_id;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const DEFAULT_PRINCIPAL: &str = "mariadb/localhost.localdomain";

/// Validates opaque tokens and names the identity they belong to.
pub trait TicketAuthority: Send + Sync {
    fn validate(&self, token: &[u8]) -> Result<String, String>;
}

/// Reference authority backed by a static `identity -> secret` map. Real
/// deployments plug in a KDC or token-service client here.
#[derive(Default)]
pub struct StaticTicketAuthority {
    secrets: RwLock<HashMap<String, Vec<u8>>>,
}

impl StaticTicketAuthority {
    pub fn with_secret(identity: &str, secret: &[u8]) -> Self {
        let authority = Self::default();
        authority
            .secrets
            .write()
            .expect("authority map poisoned")
            .insert(identity.to_string(), secret.to_vec());
        authority
    }
}

impl TicketAuthority for StaticTicketAuthority {
    /// Token format: `identity 0x00 secret`.
    fn validate(&self, token: &[u8]) -> Result<String, String> {
        let sep = token
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| "malformed ticket token".to_string())?;
        let identity = String::from_utf8_lossy(&token[..sep]).to_string();
        let secrets = self.secrets.read().expect("authority map poisoned");
        match secrets.get(&identity) {
            Some(secret) if secret.as_slice() == &token[sep + 1..] => Ok(identity),
            Some(_) => Err(format!("ticket for {identity:?} failed validation")),
            None => Err(format!("no such identity {identity:?}")),
        }
    }
}

pub struct TicketAuth {
    principal: String,
    /// When set, every authenticated identity must equal this string instead
    /// of the per-user table entry.
    expected_identity: Option<String>,
    authority: Arc<dyn TicketAuthority>,
    users: UserTableCell,
}

impl TicketAuth {
    pub fn create(options: &AuthOptions) -> std::io::Result<Arc<dyn Authenticator>> {
        let principal = options
            .get("principal")
            .unwrap_or(DEFAULT_PRINCIPAL)
            .to_string();
        let users = new_user_table_cell(options.workers);
        if let Some(raw) = options.get("users") {
            users.publish(Arc::new(parse_identity_users(raw)));
        }
        let authority: Arc<dyn TicketAuthority> = match options.get("authority_secrets") {
            // "identity=secret,identity=secret" for the static authority.
            Some(raw) => {
                let authority = StaticTicketAuthority::default();
                {
                    let mut secrets = authority.secrets.write().expect("authority map poisoned");
                    for pair in raw.split(',').filter(|s| !s.is_empty()) {
                        if let Some((identity, secret)) = pair.split_once('=') {
                            secrets.insert(identity.to_string(), secret.as_bytes().to_vec());
                        }
                    }
                }
                Arc::new(authority)
            }
            None => Arc::new(StaticTicketAuthority::default()),
        };
        Ok(Arc::new(Self {
            principal,
            expected_identity: options.get("expected_identity").map(str::to_string),
            authority,
            users,
        }))
    }

    pub fn with_authority(
        principal: &str,
        expected_identity: Option<String>,
        authority: Arc<dyn TicketAuthority>,
        workers: usize,
    ) -> Self {
        Self {
            principal: principal.to_string(),
            expected_identity,
            authority,
            users: new_user_table_cell(workers),
        }
    }

    pub fn publish_users(&self, table: UserTable) {
        self.users.publish(Arc::new(table));
    }

    fn table(&self) -> Arc<UserTable> {
        self.users.get(current_worker_id().unwrap_or(0))
    }
}

fn parse_identity_users(raw: &str) -> UserTable {
    let mut table = UserTable::default();
    for item in raw.split(',').filter(|s| !s.is_empty()) {
        let (user, identity) = item.split_once(':').unwrap_or((item, item));
        table.insert(
            user.to_string(),
            UserEntry {
                double_sha1: None,
                external_identity: Some(identity.to_string()),
            },
        );
    }
    table
}

impl Authenticator for TicketAuth {
    fn name(&self) -> &'static str {
        AuthPluginName::AuthTicket.into()
    }

    fn extract(&self, state: &mut ClientAuthState, packet: &BufChain) -> AuthResult {
        if !state.switch_sent {
            // Nothing usable before the switch; the handshake response's auth
            // data belongs to whatever plugin the client guessed.
            return AuthResult::Incomplete;
        }
        let token = packet.contiguous().to_vec();
        if token.is_empty() {
            return AuthResult::Fail("empty ticket token".to_string());
        }
        state.auth_token = token;
        AuthResult::Ok
    }

    fn authenticate(&self, state: &mut ClientAuthState) -> AuthDecision {
        if !state.switch_sent {
            state.switch_sent = true;
            let mut payload = Vec::with_capacity(2 + self.name().len() + self.principal.len() + 1);
            payload.push(crate::protocol::mysql::constants::AUTH_SWITCH_REQUEST);
            payload.extend_from_slice(self.name().as_bytes());
            payload.push(0);
            payload.extend_from_slice(self.principal.as_bytes());
            payload.push(0);
            return AuthDecision::Exchange(payload);
        }

        let identity = match self.authority.validate(&state.auth_token) {
            Ok(identity) => identity,
            Err(reason) => {
                warn!(
                    "ticket auth: token for user {:?} rejected: {reason}",
                    state.user_str()
                );
                return AuthDecision::Reject(reason);
            }
        };
        debug!(
            "ticket auth: token validated for identity {identity:?} (token digest {})",
            hex::encode(crate::server::auth::sha1_1(&state.auth_token))
        );

        let accepted = match &self.expected_identity {
            Some(expected) => *expected == identity,
            None => {
                let user = state.user_str().to_string();
                let table = self.table();
                match table.get(&user).and_then(|e| e.external_identity.as_ref()) {
                    Some(mapped) => *mapped == identity,
                    // No mapping configured: the identity must match the
                    // MySQL user name itself.
                    None => user == identity,
                }
            }
        };
        if accepted {
            state.external_identity = Some(identity);
            AuthDecision::Accept
        } else {
            AuthDecision::Reject(format!(
                "identity {identity:?} does not match user {:?}",
                state.user_str()
            ))
        }
    }

    fn load_users(&self, listener: &ListenerConfig) -> std::io::Result<usize> {
        let raw = listener
            .authenticator_options
            .get("users")
            .unwrap_or_default();
        let table = Arc::new(parse_identity_users(raw));
        let count = table.len();
        self.users.publish(table);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::default_salt;
    use crate::server::ClientAddr;

    fn token(identity: &str, secret: &[u8]) -> Vec<u8> {
        let mut t = identity.as_bytes().to_vec();
        t.push(0);
        t.extend_from_slice(secret);
        t
    }

    fn fresh_state(user: &str) -> ClientAuthState {
        let mut state = ClientAuthState::new(default_salt(), ClientAddr::Local);
        state.user = Some(user.to_string());
        state
    }

    #[test]
    fn test_switch_request_names_mechanism_and_principal() {
        let auth = TicketAuth::with_authority(
            "mariadb/gate.example.com",
            None,
            Arc::new(StaticTicketAuthority::default()),
            1,
        );
        let mut state = fresh_state("alice");
        let AuthDecision::Exchange(payload) = auth.authenticate(&mut state) else {
            panic!("expected AuthSwitchRequest");
        };
        assert_eq!(payload[0], 0xfe);
        let text = String::from_utf8_lossy(&payload[1..]);
        assert!(text.contains("auth_ticket_client"));
        assert!(text.contains("mariadb/gate.example.com"));
    }

    #[test]
    fn test_token_validated_and_preserved_for_backend() {
        let authority = Arc::new(StaticTicketAuthority::with_secret("alice", b"s3cret"));
        let auth = TicketAuth::with_authority("mariadb/gate", None, authority, 1);
        let mut state = fresh_state("alice");
        assert!(matches!(
            auth.authenticate(&mut state),
            AuthDecision::Exchange(_)
        ));

        let raw = token("alice", b"s3cret");
        let packet = BufChain::from_vec(raw.clone());
        assert_eq!(auth.extract(&mut state, &packet), AuthResult::Ok);
        assert_eq!(auth.authenticate(&mut state), AuthDecision::Accept);
        // end-to-end pass-through: the raw token must survive on the session
        assert_eq!(state.auth_token, raw);
        assert_eq!(state.external_identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let authority = Arc::new(StaticTicketAuthority::with_secret("bob", b"pw"));
        let auth = TicketAuth::with_authority("mariadb/gate", None, authority, 1);
        let mut state = fresh_state("alice");
        let _ = auth.authenticate(&mut state);
        let packet = BufChain::from_vec(token("bob", b"pw"));
        assert_eq!(auth.extract(&mut state, &packet), AuthResult::Ok);
        assert!(matches!(
            auth.authenticate(&mut state),
            AuthDecision::Reject(_)
        ));
    }

    #[test]
    fn test_admin_override_identity() {
        let authority = Arc::new(StaticTicketAuthority::with_secret("svc", b"pw"));
        let auth =
            TicketAuth::with_authority("mariadb/gate", Some("svc".to_string()), authority, 1);
        let mut state = fresh_state("any_user_at_all");
        let _ = auth.authenticate(&mut state);
        let packet = BufChain::from_vec(token("svc", b"pw"));
        assert_eq!(auth.extract(&mut state, &packet), AuthResult::Ok);
        assert_eq!(auth.authenticate(&mut state), AuthDecision::Accept);
    }
}
