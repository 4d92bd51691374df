//! `mysql_native_password`: the scramble challenge/response mechanism. The
//! server issues a 20-byte random scramble; the client answers with
//! `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`. Verification
//! reconstructs the XOR mask from the stored double hash, so plaintext
//! passwords never live in the user table.

use crate::buffer::BufChain;
use crate::protocol::mysql::constants::{AuthPluginName, SCRAMBLE_SIZE};
use crate::server::auth::{
    new_user_table_cell, sha1_1, sha1_2, xor, AuthDecision, AuthOptions, AuthResult, Authenticator,
    ClientAuthState, UserTable, UserTableCell,
};
use crate::server::listener::ListenerConfig;
use crate::worker::current_worker_id;

use std::sync::Arc;
use tracing::{debug, warn};

pub struct NativePasswordAuth {
    users: UserTableCell,
}

impl NativePasswordAuth {
    pub fn create(options: &AuthOptions) -> std::io::Result<Arc<dyn Authenticator>> {
        let users = new_user_table_cell(options.workers);
        if let Some(raw) = options.get("users") {
            users.publish(Arc::new(UserTable::parse_users_option(raw)?));
        }
        Ok(Arc::new(Self { users }))
    }

    fn table(&self) -> Arc<UserTable> {
        self.users.get(current_worker_id().unwrap_or(0))
    }

    /// Token check against the stored double hash:
    /// `SHA1(token XOR SHA1(scramble || stored)) == stored`.
    fn verify(scramble: &[u8; SCRAMBLE_SIZE], stored: &[u8; SCRAMBLE_SIZE], token: &[u8]) -> bool {
        if token.len() != SCRAMBLE_SIZE {
            return false;
        }
        let mask = sha1_2(scramble, stored);
        let mut candidate = [0u8; SCRAMBLE_SIZE];
        candidate.copy_from_slice(token);
        let sha1_password = xor(candidate, mask);
        sha1_1(sha1_password) == *stored
    }
}

impl Authenticator for NativePasswordAuth {
    fn name(&self) -> &'static str {
        AuthPluginName::AuthNativePassword.into()
    }

    fn extract(&self, state: &mut ClientAuthState, packet: &BufChain) -> AuthResult {
        // After an AuthSwitchRequest the next client packet is the bare
        // 20-byte token (or empty for passwordless users).
        if state.switch_sent {
            state.auth_token = packet.contiguous().to_vec();
        }
        match state.auth_token.len() {
            0 | SCRAMBLE_SIZE => AuthResult::Ok,
            n => AuthResult::Fail(format!("unexpected auth token length {n}")),
        }
    }

    fn authenticate(&self, state: &mut ClientAuthState) -> AuthDecision {
        // A client that negotiated another plugin must be switched to ours
        // before its token means anything against our scramble.
        if !state.switch_sent
            && !state.client_plugin.is_empty()
            && state.client_plugin != self.name().as_bytes()
        {
            state.switch_sent = true;
            let mut payload = Vec::with_capacity(2 + self.name().len() + SCRAMBLE_SIZE + 2);
            payload.push(crate::protocol::mysql::constants::AUTH_SWITCH_REQUEST);
            payload.extend_from_slice(self.name().as_bytes());
            payload.push(0);
            payload.extend_from_slice(&state.scramble);
            payload.push(0);
            return AuthDecision::Exchange(payload);
        }

        let user = state.user_str().to_string();
        let table = self.table();
        let Some(entry) = table.get(&user) else {
            warn!("auth: unknown user {user:?} from {}", state.remote);
            return AuthDecision::Reject(format!("unknown user {user:?}"));
        };
        match &entry.double_sha1 {
            None => {
                // Passwordless user: only the empty response is acceptable.
                if state.auth_token.is_empty() {
                    AuthDecision::Accept
                } else {
                    AuthDecision::Reject(format!("user {user:?} sent a password but has none"))
                }
            }
            Some(stored) => {
                if Self::verify(&state.scramble, stored, &state.auth_token) {
                    debug!("auth: user {user:?} verified");
                    AuthDecision::Accept
                } else {
                    AuthDecision::Reject(format!("bad password for user {user:?}"))
                }
            }
        }
    }

    fn load_users(&self, listener: &ListenerConfig) -> std::io::Result<usize> {
        let raw = listener
            .authenticator_options
            .get("users")
            .unwrap_or_default();
        let table = Arc::new(UserTable::parse_users_option(raw)?);
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
    use std::collections::HashMap;

    fn mechanism_with_users(users: &str) -> Arc<dyn Authenticator> {
        NativePasswordAuth::create(&AuthOptions {
            workers: 1,
            params: HashMap::from([("users".to_string(), users.to_string())]),
        })
        .unwrap()
    }

    fn client_token(password: &[u8], scramble: &[u8; SCRAMBLE_SIZE]) -> Vec<u8> {
        // What a real client computes:
        // SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))
        let sha1_pw = sha1_1(password);
        let double = sha1_1(sha1_pw);
        xor(sha1_pw, sha1_2(scramble, double)).to_vec()
    }

    fn state_for(user: &str, token: Vec<u8>) -> ClientAuthState {
        let mut state = ClientAuthState::new(default_salt(), ClientAddr::Local);
        state.user = Some(user.to_string());
        state.auth_token = token;
        state.client_plugin = b"mysql_native_password".to_vec();
        state
    }

    #[test]
    fn test_challenge_response_round_trip() {
        let auth = mechanism_with_users("alice:pw");
        let scramble = default_salt();
        let mut state = state_for("alice", client_token(b"pw", &scramble));
        assert_eq!(auth.authenticate(&mut state), AuthDecision::Accept);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = mechanism_with_users("alice:pw");
        let scramble = default_salt();
        let mut state = state_for("alice", client_token(b"wrong", &scramble));
        assert!(matches!(
            auth.authenticate(&mut state),
            AuthDecision::Reject(_)
        ));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let auth = mechanism_with_users("alice:pw");
        let mut state = state_for("mallory", vec![]);
        assert!(matches!(
            auth.authenticate(&mut state),
            AuthDecision::Reject(_)
        ));
    }

    #[test]
    fn test_empty_password_user_is_strict() {
        let auth = mechanism_with_users("nopw:");
        let scramble = default_salt();

        let mut state = state_for("nopw", vec![]);
        assert_eq!(auth.authenticate(&mut state), AuthDecision::Accept);

        // A non-empty response against an empty stored hash is refused, not
        // silently accepted.
        let mut state = state_for("nopw", client_token(b"anything", &scramble));
        assert!(matches!(
            auth.authenticate(&mut state),
            AuthDecision::Reject(_)
        ));
    }

    #[test]
    fn test_plugin_mismatch_triggers_auth_switch() {
        let auth = mechanism_with_users("alice:pw");
        let scramble = default_salt();
        let mut state = state_for("alice", vec![]);
        state.client_plugin = b"caching_sha2_password".to_vec();
        let decision = auth.authenticate(&mut state);
        let AuthDecision::Exchange(payload) = decision else {
            panic!("expected an AuthSwitchRequest exchange");
        };
        assert_eq!(payload[0], 0xfe);
        assert!(state.switch_sent);

        // Client answers the switch with a token computed over our scramble.
        let token = client_token(b"pw", &scramble);
        let packet = BufChain::from_vec(token);
        assert_eq!(auth.extract(&mut state, &packet), AuthResult::Ok);
        assert_eq!(auth.authenticate(&mut state), AuthDecision::Accept);
    }
}
