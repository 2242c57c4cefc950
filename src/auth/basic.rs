//! Basic credential authentication.
//!
//! Credentials come from `Authorization: Basic base64(user:password)` or,
//! when that header is absent, from `login`/`password` query parameters.
//! The username is `account` or `account.device_id`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::{self, BoxFuture, FutureExt};
use subtle::ConstantTimeEq;

use crate::auth::{AuthError, Authenticator, HandshakeRequest};
use crate::config::AuthConfig;
use crate::session::context::Principal;

/// Device assumed when the username carries none.
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// Hot-swappable table of principal → password.
#[derive(Clone, Default)]
pub struct CredentialStore {
    inner: Arc<ArcSwap<HashMap<Principal, String>>>,
}

impl CredentialStore {
    pub fn from_config(config: &AuthConfig) -> Self {
        let store = Self::default();
        store.replace(config);
        store
    }

    /// Atomically replace the credential table.
    pub fn replace(&self, config: &AuthConfig) {
        let table: HashMap<Principal, String> = config
            .credentials
            .iter()
            .map(|c| (Principal::new(&c.account, c.device_id), c.password.clone()))
            .collect();
        tracing::info!(credentials = table.len(), "Credential table loaded");
        self.inner.store(Arc::new(table));
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constant-time password check. Unknown principals never verify.
    pub fn verify(&self, principal: &Principal, password: &str) -> bool {
        let table = self.inner.load();
        match table.get(principal) {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(password.as_bytes())),
            None => false,
        }
    }
}

/// [`Authenticator`] backed by a [`CredentialStore`].
#[derive(Clone)]
pub struct BasicAuthenticator {
    store: CredentialStore,
}

impl BasicAuthenticator {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    fn check(&self, handshake: &HandshakeRequest) -> Result<Option<Principal>, AuthError> {
        let Some((username, password)) = extract_credentials(handshake)? else {
            return Ok(None);
        };

        let principal = parse_username(&username)?;
        if self.store.verify(&principal, &password) {
            Ok(Some(principal))
        } else {
            tracing::debug!(principal = %principal, "Rejected credentials");
            Err(AuthError::InvalidCredentials)
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate<'a>(
        &'a self,
        handshake: &'a HandshakeRequest,
    ) -> BoxFuture<'a, Result<Option<Principal>, AuthError>> {
        future::ready(self.check(handshake)).boxed()
    }
}

fn extract_credentials(
    handshake: &HandshakeRequest,
) -> Result<Option<(String, String)>, AuthError> {
    if let Some(value) = handshake.header("authorization") {
        return parse_basic(value).map(Some);
    }

    match handshake.query_param("login") {
        Some(login) => {
            let password = handshake
                .query_param("password")
                .ok_or(AuthError::InvalidCredentials)?;
            Ok(Some((login, password)))
        }
        None => Ok(None),
    }
}

/// Decode a `Basic` authorization header into `(username, password)`.
pub fn parse_basic(value: &str) -> Result<(String, String), AuthError> {
    let (scheme, encoded) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidCredentials)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::InvalidCredentials);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(AuthError::InvalidCredentials)?;

    Ok((username.to_string(), password.to_string()))
}

/// Split `account.device` into a principal; a bare account means device 1.
pub fn parse_username(username: &str) -> Result<Principal, AuthError> {
    let (account, device_id) = match username.rsplit_once('.') {
        Some((account, device)) => match device.parse::<u32>() {
            Ok(device_id) => (account, device_id),
            Err(_) => (username, DEFAULT_DEVICE_ID),
        },
        None => (username, DEFAULT_DEVICE_ID),
    };

    if account.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(Principal::new(account, device_id))
}

/// Encode a `Basic` authorization header value.
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}
