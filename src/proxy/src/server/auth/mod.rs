use crate::buffer::BufChain;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::server::listener::ListenerConfig;
use crate::server::ClientAddr;
use crate::worker::worker_local::WorkerLocal;
use std::io::ErrorKind;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

pub mod native;
pub mod ticket;

// Only for test purpose.
pub fn default_salt() -> [u8; SCRAMBLE_SIZE] {
    let bs = ";X,po_k}>o6^Wz!/kM}N".as_bytes();
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        salt[i] = bs[i];
        if salt[i] == b'\0' || salt[i] == b'$' {
            salt[i] += 1;
        }
    }
    salt
}

fn val(c: u8, idx: usize) -> Result<u8, std::io::Error> {
    match c {
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'0'..=b'9' => Ok(c - b'0'),
        _ => Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("Invalid hex character {}", idx),
        )),
    }
}

pub fn hex_string_decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, std::io::Error> {
    let data_ref = data.as_ref();
    if data_ref.len() % 2 != 0 {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "Input hex string's length needs to be even, as two digits correspond to one byte.",
        ));
    }

    data_ref
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            Ok::<u8, std::io::Error>(val(pair[0], 2 * i)? << 4 | val(pair[1], 2 * i + 1)?)
        })
        .try_collect()
}

/// Generate a random string user ASCII but avoid separator character.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

/// Result of the `extract` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Ok,
    /// More packets are needed before a decision can be made.
    Incomplete,
    Fail(String),
}

/// Result of the `authenticate` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    /// Send this intermediate packet payload (e.g. an AuthSwitchRequest) and
    /// feed the client's next packet back through `extract`.
    Exchange(Vec<u8>),
    Reject(String),
}

/// Per-connection authentication state the mechanism hooks read and update.
/// Whatever the mechanism stores here survives into the session: the raw
/// `auth_token` in particular is preserved so a backend authenticator can
/// re-present it when opening a backend connection.
#[derive(Debug, Clone)]
pub struct ClientAuthState {
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub user: Option<String>,
    pub database: Option<String>,
    pub auth_token: Vec<u8>,
    pub client_plugin: Vec<u8>,
    pub advertised_ssl: bool,
    pub remote: ClientAddr,
    /// Set once the mechanism has sent its AuthSwitchRequest.
    pub switch_sent: bool,
    /// Identity the external authority vouched for, once validated.
    pub external_identity: Option<String>,
}

impl ClientAuthState {
    pub fn new(scramble: [u8; SCRAMBLE_SIZE], remote: ClientAddr) -> Self {
        Self {
            scramble,
            user: None,
            database: None,
            auth_token: Vec::new(),
            client_plugin: Vec::new(),
            advertised_ssl: false,
            remote,
            switch_sent: false,
            external_identity: None,
        }
    }

    pub fn user_str(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }
}

/// A pluggable authentication mechanism. One instance serves a listener; all
/// per-connection state lives in [`ClientAuthState`]. Construction from
/// configuration happens through the factory registered in [`AuthRegistry`].
pub trait Authenticator: Send + Sync {
    /// Wire name of the mechanism, advertised in the handshake.
    fn name(&self) -> &'static str;

    /// Inspects a client packet received during the auth phase and stores
    /// whatever the mechanism needs on the connection state.
    fn extract(&self, state: &mut ClientAuthState, packet: &BufChain) -> AuthResult;

    /// Whether the client advertised TLS during the handshake.
    fn ssl_capable(&self, state: &ClientAuthState) -> bool {
        state.advertised_ssl
    }

    /// Decides success, failure, or another exchange round.
    fn authenticate(&self, state: &mut ClientAuthState) -> AuthDecision;

    /// Refreshes the backing user table for this listener, returning how many
    /// entries were loaded.
    fn load_users(&self, listener: &ListenerConfig) -> std::io::Result<usize>;
}

/// One user's stored credentials.
#[derive(Debug, Clone, Default)]
pub struct UserEntry {
    /// SHA1(SHA1(password)) for the native mechanism. `None` means the user
    /// has no password set.
    pub double_sha1: Option<[u8; SCRAMBLE_SIZE]>,
    /// Identity an external authority must vouch for (ticket mechanism).
    pub external_identity: Option<String>,
}

/// Immutable user-table snapshot. Replaced wholesale on reload, never edited
/// in place.
#[derive(Debug, Default)]
pub struct UserTable {
    users: hashbrown::HashMap<String, UserEntry>,
}

impl UserTable {
    pub fn get(&self, user: &str) -> Option<&UserEntry> {
        self.users.get(user)
    }

    pub fn insert(&mut self, user: String, entry: UserEntry) {
        self.users.insert(user, entry);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Parses `user:credential` pairs from the `users` option. A credential
    /// starting with `*` is a MySQL-style uppercase hex double-SHA1 hash;
    /// anything else is taken as a plaintext password and hashed. An empty
    /// credential means a passwordless user.
    pub fn parse_users_option(raw: &str) -> std::io::Result<UserTable> {
        let mut table = UserTable::default();
        for item in raw.split(',').filter(|s| !s.is_empty()) {
            let (user, cred) = item.split_once(':').unwrap_or((item, ""));
            let entry = if cred.is_empty() {
                UserEntry::default()
            } else if let Some(hash_hex) = cred.strip_prefix('*') {
                let decoded = hex_string_decode(hash_hex)?;
                let mut double_sha1 = [0u8; SCRAMBLE_SIZE];
                if decoded.len() != SCRAMBLE_SIZE {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("bad password hash length for user {user}"),
                    ));
                }
                double_sha1.copy_from_slice(&decoded);
                UserEntry {
                    double_sha1: Some(double_sha1),
                    external_identity: None,
                }
            } else {
                UserEntry {
                    double_sha1: Some(sha1_1(sha1_1(cred.as_bytes()))),
                    external_identity: None,
                }
            };
            table.insert(user.to_string(), entry);
        }
        Ok(table)
    }
}

/// Shared user-table cell: per-worker snapshot pointers, replaced by
/// publishing a new immutable table; readers never block.
pub type UserTableCell = Arc<WorkerLocal<UserTable>>;

pub fn new_user_table_cell(workers: usize) -> UserTableCell {
    Arc::new(WorkerLocal::new(workers, Arc::new(UserTable::default())))
}

/// Options handed to an authenticator factory: the listener's
/// `authenticator_options` key/value pairs plus the pool size for snapshot
/// cells.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AuthOptions {
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl AuthOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

pub type AuthFactory = fn(&AuthOptions) -> std::io::Result<Arc<dyn Authenticator>>;

/// Mechanism name to factory. Listeners resolve their configured
/// `authenticator` through this at startup.
pub struct AuthRegistry {
    factories: HashMap<&'static str, AuthFactory>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword.into(),
            native::NativePasswordAuth::create,
        );
        registry.register(
            crate::protocol::mysql::constants::AuthPluginName::AuthTicket.into(),
            ticket::TicketAuth::create,
        );
        registry
    }
}

impl AuthRegistry {
    pub fn register(&mut self, name: &'static str, factory: AuthFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(
        &self,
        name: &str,
        options: &AuthOptions,
    ) -> std::io::Result<Arc<dyn Authenticator>> {
        match self.factories.get(name) {
            Some(factory) => factory(options),
            None => Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("unknown authenticator {name}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_avoids_separators() {
        for _ in 0..32 {
            let salt = gen_user_salt();
            assert!(!salt.contains(&b'\0'));
            assert!(!salt.contains(&b'$'));
        }
    }

    #[test]
    fn test_parse_users_option() {
        let table =
            UserTable::parse_users_option("alice:pw,bob:,carol:*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19")
                .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.get("alice").unwrap().double_sha1,
            Some(sha1_1(sha1_1(b"pw")))
        );
        assert!(table.get("bob").unwrap().double_sha1.is_none());
        // "*2470..." is PASSWORD('password')
        assert_eq!(
            table.get("carol").unwrap().double_sha1,
            Some(sha1_1(sha1_1(b"password")))
        );
    }

    #[test]
    fn test_registry_resolves_mechanisms() {
        let registry = AuthRegistry::default();
        let options = AuthOptions {
            workers: 1,
            params: HashMap::from([("principal".to_string(), "mariadb/gate".to_string())]),
        };
        assert!(registry.create("mysql_native_password", &options).is_ok());
        assert!(registry.create("auth_ticket_client", &options).is_ok());
        assert!(registry.create("no_such_mechanism", &options).is_err());
    }
}
