use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const TOKEN_TTL_SECS: u64 = 5 * 60;

/// The "root" user and "root" role bypass every permission check, mirroring
/// etcd's own always-permitted superuser.
const ROOT: &str = "root";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user {0:?} not found")]
    UnknownUser(String),
    #[error("role {0:?} not found")]
    UnknownRole(String),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid or expired auth token")]
    InvalidToken,
    #[error("authentication is not enabled")]
    NotEnabled,
    #[error("permission denied for key range")]
    PermissionDenied,
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermType {
    Read,
    Write,
    ReadWrite,
}

impl PermType {
    fn grants(self, want: PermType) -> bool {
        match (self, want) {
            (PermType::ReadWrite, _) => true,
            (PermType::Read, PermType::Read) => true,
            (PermType::Write, PermType::Write) => true,
            _ => false,
        }
    }
}

/// A single `(read | write | read-write, key-range)` grant. `range_end`
/// empty means the grant covers exactly `key`; otherwise it covers the
/// half-open range `[key, range_end)`, the same convention Range/Put/
/// DeleteRange use for their own key-range arguments.
#[derive(Debug, Clone)]
pub struct Permission {
    pub perm: PermType,
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl Permission {
    /// Whether this grant fully covers the requested `[key, range_end)`
    /// (or single key, if `range_end` is empty) for `want`.
    fn covers(&self, key: &[u8], range_end: &[u8], want: PermType) -> bool {
        if !self.perm.grants(want) {
            return false;
        }
        let grant_is_point = self.range_end.is_empty();
        let req_is_point = range_end.is_empty();
        if grant_is_point {
            return req_is_point && key == self.key.as_slice();
        }
        if req_is_point {
            key >= self.key.as_slice() && key < self.range_end.as_slice()
        } else {
            key >= self.key.as_slice() && range_end <= self.range_end.as_slice()
        }
    }
}

#[derive(Debug, Default)]
struct Role {
    permissions: Vec<Permission>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

struct User {
    password_hash: String,
    roles: HashSet<String>,
}

struct TokenInfo {
    expires_at: u64,
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

/// In-memory user/role directory, JWT issuer/validator, and permission
/// enforcement point for the optional etcd v3 auth surface. Auth is off by
/// default, matching a fresh etcd cluster. Once enabled, every KV/Watch
/// operation must present a token from `Authenticate` and the token's user
/// must hold a role grant covering the key-range touched, unless the user
/// or one of its roles is `root`.
pub struct AuthState {
    enabled: bool,
    users: HashMap<String, User>,
    roles: HashMap<String, Role>,
    tokens: HashMap<String, TokenInfo>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthState {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            enabled: false,
            users: HashMap::new(),
            roles: HashMap::new(),
            tokens: HashMap::new(),
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn add_user(&mut self, name: String, password: String) {
        self.users.insert(name, User { password_hash: hash_password(&password), roles: HashSet::new() });
    }

    pub fn delete_user(&mut self, name: &str) -> AuthResult<()> {
        self.users.remove(name).map(|_| ()).ok_or_else(|| AuthError::UnknownUser(name.to_string()))
    }

    pub fn add_role(&mut self, name: String) {
        self.roles.entry(name).or_default();
    }

    pub fn delete_role(&mut self, name: &str) -> AuthResult<()> {
        if self.roles.remove(name).is_some() {
            for user in self.users.values_mut() {
                user.roles.remove(name);
            }
            Ok(())
        } else {
            Err(AuthError::UnknownRole(name.to_string()))
        }
    }

    pub fn grant_role(&mut self, user: &str, role: &str) -> AuthResult<()> {
        if !self.roles.contains_key(role) {
            return Err(AuthError::UnknownRole(role.to_string()));
        }
        let user =
            self.users.get_mut(user).ok_or_else(|| AuthError::UnknownUser(user.to_string()))?;
        user.roles.insert(role.to_string());
        Ok(())
    }

    /// Adds a `(perm, key-range)` grant to `role`.
    pub fn grant_permission(&mut self, role: &str, perm: Permission) -> AuthResult<()> {
        let role = self.roles.get_mut(role).ok_or_else(|| AuthError::UnknownRole(role.to_string()))?;
        role.permissions.push(perm);
        Ok(())
    }

    /// Checks the password and, if it matches, issues a signed token good
    /// for `TOKEN_TTL_SECS` and records it in the active-token store.
    pub fn authenticate(&mut self, name: &str, password: &str) -> AuthResult<String> {
        if !self.enabled {
            return Err(AuthError::NotEnabled);
        }
        let user = self.users.get(name).ok_or(AuthError::InvalidCredentials)?;
        if user.password_hash != hash_password(password) {
            return Err(AuthError::InvalidCredentials);
        }
        let expires_at = now_secs() + TOKEN_TTL_SECS;
        let claims = Claims { sub: name.to_string(), exp: expires_at };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::InvalidToken)?;
        self.tokens.insert(token.clone(), TokenInfo { expires_at });
        Ok(token)
    }

    /// Validates a token previously returned by `authenticate`, returning
    /// the username it was issued to. A token that decodes fine but was
    /// already removed by `sweep_expired` (or never issued by this process)
    /// is rejected, so a restarted signer or a swept token can't come back
    /// to life.
    pub fn validate(&self, token: &str) -> AuthResult<String> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| AuthError::InvalidToken)?;
        let info = self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        if info.expires_at <= now_secs() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims.sub)
    }

    /// Removes every token whose TTL has elapsed. Meant to be run on a
    /// periodic tick so long-lived servers don't accumulate expired tokens
    /// forever.
    pub fn sweep_expired_tokens(&mut self) -> usize {
        let now = now_secs();
        let before = self.tokens.len();
        self.tokens.retain(|_, info| info.expires_at > now);
        before - self.tokens.len()
    }

    /// Enforces that `token`'s user (or one of its roles) holds a grant
    /// covering `[key, range_end)` for `want`. A no-op returning `Ok(())`
    /// while auth is disabled, matching a fresh etcd cluster.
    pub fn check_permission(
        &self,
        token: &str,
        want: PermType,
        key: &[u8],
        range_end: &[u8],
    ) -> AuthResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let name = self.validate(token)?;
        if name == ROOT {
            return Ok(());
        }
        let user = self.users.get(&name).ok_or_else(|| AuthError::UnknownUser(name.clone()))?;
        if user.roles.contains(ROOT) {
            return Ok(());
        }
        let covered = user.roles.iter().filter_map(|r| self.roles.get(r)).any(|role| {
            role.permissions.iter().any(|perm| perm.covers(key, range_end, want))
        });
        if covered {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_rejects_wrong_password_and_disabled_auth() {
        let mut auth = AuthState::new();
        auth.add_user("root".to_string(), "secret".to_string());
        assert!(matches!(auth.authenticate("root", "secret"), Err(AuthError::NotEnabled)));

        auth.enable();
        assert!(matches!(auth.authenticate("root", "wrong"), Err(AuthError::InvalidCredentials)));
        assert!(auth.authenticate("root", "secret").is_ok());
    }

    #[test]
    fn issued_token_validates_back_to_the_same_user() {
        let mut auth = AuthState::new();
        auth.add_user("root".to_string(), "secret".to_string());
        auth.enable();

        let token = auth.authenticate("root", "secret").unwrap();
        assert_eq!(auth.validate(&token).unwrap(), "root");
    }

    #[test]
    fn grant_role_requires_both_to_exist() {
        let mut auth = AuthState::new();
        auth.add_user("root".to_string(), "secret".to_string());
        assert!(matches!(auth.grant_role("root", "admin"), Err(AuthError::UnknownRole(_))));

        auth.add_role("admin".to_string());
        assert!(auth.grant_role("root", "admin").is_ok());
    }

    #[test]
    fn delete_role_revokes_it_from_every_user() {
        let mut auth = AuthState::new();
        auth.add_role("admin".to_string());
        auth.add_user("root".to_string(), "secret".to_string());
        auth.grant_role("root", "admin").unwrap();

        auth.delete_role("admin").unwrap();
        assert!(matches!(auth.grant_role("root", "admin"), Err(AuthError::UnknownRole(_))));
    }

    #[test]
    fn root_user_bypasses_permission_checks() {
        let mut auth = AuthState::new();
        auth.add_user("root".to_string(), "secret".to_string());
        auth.enable();
        let token = auth.authenticate("root", "secret").unwrap();

        assert!(auth.check_permission(&token, PermType::Write, b"anything", b"").is_ok());
    }

    #[test]
    fn grant_covering_key_range_permits_and_excess_range_is_denied() {
        let mut auth = AuthState::new();
        auth.add_role("readers".to_string());
        auth.grant_permission(
            "readers",
            Permission { perm: PermType::Read, key: b"a".to_vec(), range_end: b"m".to_vec() },
        )
        .unwrap();
        auth.add_user("alice".to_string(), "secret".to_string());
        auth.grant_role("alice", "readers").unwrap();
        auth.enable();
        let token = auth.authenticate("alice", "secret").unwrap();

        assert!(auth.check_permission(&token, PermType::Read, b"b", b"").is_ok());
        assert!(matches!(
            auth.check_permission(&token, PermType::Write, b"b", b""),
            Err(AuthError::PermissionDenied)
        ));
        assert!(matches!(
            auth.check_permission(&token, PermType::Read, b"z", b""),
            Err(AuthError::PermissionDenied)
        ));
        assert!(matches!(
            auth.check_permission(&token, PermType::Read, b"a", b"z"),
            Err(AuthError::PermissionDenied)
        ));
    }

    #[test]
    fn disabled_auth_skips_permission_checks() {
        let auth = AuthState::new();
        assert!(auth.check_permission("whatever", PermType::Write, b"k", b"").is_ok());
    }

    #[test]
    fn sweep_removes_only_expired_tokens() {
        let mut auth = AuthState::new();
        auth.add_user("root".to_string(), "secret".to_string());
        auth.enable();
        let token = auth.authenticate("root", "secret").unwrap();

        assert_eq!(auth.sweep_expired_tokens(), 0);
        assert!(auth.validate(&token).is_ok());

        auth.tokens.get_mut(&token).unwrap().expires_at = now_secs() - 1;
        assert_eq!(auth.sweep_expired_tokens(), 1);
        assert!(matches!(auth.validate(&token), Err(AuthError::InvalidToken)));
    }
}
