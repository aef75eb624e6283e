//! Authentication token store for the Lumen client.
//!
//! Holds the current bearer token and answers validity questions for the
//! realtime and pub/sub channels. The token is shared between the HTTP
//! client and both connection managers, so it lives behind an `Arc`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared bearer-token store.
///
/// Channels read the token when (re)connecting: the realtime channel puts it
/// in an `Authorization` header, the pub/sub channel appends it as a `token`
/// query parameter (custom headers are not universally available to
/// WebSocket clients).
///
/// # Examples
///
/// ```rust
/// use lumen_link::AuthStore;
///
/// let auth = AuthStore::new();
/// assert!(!auth.is_valid());
///
/// auth.set_token("opaque-api-key");
/// assert!(auth.is_valid());
///
/// auth.clear();
/// assert!(auth.token().is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AuthStore {
    token: Arc<RwLock<Option<String>>>,
}

impl AuthStore {
    /// Create an empty store (no credentials).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with a token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set_token(token);
        store
    }

    /// Replace the current token.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token.into());
    }

    /// Remove the current token.
    pub fn clear(&self) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// The current bearer token, if any.
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the store holds a usable token.
    ///
    /// JWTs are inspected (without signature verification) and considered
    /// invalid once their `exp` claim has passed. Opaque non-JWT tokens are
    /// valid as long as they are non-empty.
    pub fn is_valid(&self) -> bool {
        match self.token() {
            None => false,
            Some(token) if token.is_empty() => false,
            Some(token) => match jwt_expiry(&token) {
                Some(exp) => exp > now_secs(),
                None => true,
            },
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extract the `exp` claim from a JWT without verifying the signature.
///
/// Returns `None` when the token is not a three-part JWT or carries no
/// numeric `exp` claim.
fn jwt_expiry(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_u64()
}
