//! Signed cookie sessions.
//!
//! Session data lives entirely in the client's cookies:
//!
//! - `session` holds the base64url-encoded JSON object
//! - `session.sig` holds a base64url Ed25519 signature over `session=<value>`
//!
//! Signing keys are derived from the two configured secrets. New cookies are
//! always signed with the first key; a cookie verifies if either key accepts
//! it, so the second secret can hold the previous key during rotation.
//!
//! A cookie that is missing, unsigned, tampered with, or undecodable yields an
//! empty session. Nothing is written back unless the handler changed the
//! session.
//!
//! # Example
//!
//! ```rust
//! use hestate_server::boundary::HandlerResult;
//! use hestate_server::session::Session;
//!
//! async fn login(session: Session) -> HandlerResult<&'static str> {
//!     session.insert("userId", "65f0c3")?;
//!     Ok("welcome")
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use base64::prelude::*;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;
use crate::error::AppError;
use crate::log_error;
use crate::logging::Logger;

const LOG: Logger = Logger::new("Session");

/// Name of the cookie carrying the session payload.
pub const SESSION_COOKIE: &str = "session";

/// Name of the cookie carrying the payload signature.
pub const SIGNATURE_COOKIE: &str = "session.sig";

/// Session lifetime (7 days).
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors raised by session key setup and cookie handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A signing secret was empty.
    #[error("session secret must not be empty")]
    EmptySecret,

    /// A cookie value was not valid base64url.
    #[error("invalid session cookie encoding")]
    InvalidEncoding,

    /// No configured key accepted the signature.
    #[error("invalid session signature")]
    InvalidSignature,

    /// The payload was not a JSON object, or a value could not be serialized.
    #[error("malformed session payload: {0}")]
    MalformedPayload(String),
}

/// Ed25519 keys derived from the session secrets.
pub struct SessionKeys {
    signing: SigningKey,
    verifying: [VerifyingKey; 2],
}

impl SessionKeys {
    /// Derives keys from the current and previous secrets.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmptySecret`] if either secret is empty.
    pub fn from_secrets(current: &str, previous: &str) -> Result<Self, SessionError> {
        let signing = derive_key(current)?;
        let previous = derive_key(previous)?;

        Ok(Self {
            verifying: [signing.verifying_key(), previous.verifying_key()],
            signing,
        })
    }

    /// Signs a cookie value with the current key.
    #[must_use]
    pub fn sign(&self, value: &str) -> String {
        let signature = self.signing.sign(signed_message(value).as_bytes());
        BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    /// Verifies a cookie value against either key.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidEncoding`] if the signature is not
    /// base64url, or [`SessionError::InvalidSignature`] if no key accepts it.
    pub fn verify(&self, value: &str, signature: &str) -> Result<(), SessionError> {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SessionError::InvalidEncoding)?;
        let bytes: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| SessionError::InvalidSignature)?;
        let signature = Signature::from_bytes(&bytes);
        let message = signed_message(value);

        if self
            .verifying
            .iter()
            .any(|key| key.verify_strict(message.as_bytes(), &signature).is_ok())
        {
            Ok(())
        } else {
            Err(SessionError::InvalidSignature)
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

fn derive_key(secret: &str) -> Result<SigningKey, SessionError> {
    if secret.is_empty() {
        return Err(SessionError::EmptySecret);
    }
    let seed: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
    Ok(SigningKey::from_bytes(&seed))
}

fn signed_message(value: &str) -> String {
    format!("{SESSION_COOKIE}={value}")
}

/// Settings for the session middleware.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    keys: Arc<SessionKeys>,
    secure: bool,
    max_age: Duration,
}

impl SessionConfig {
    /// Creates settings from explicit keys.
    #[must_use]
    pub fn new(keys: SessionKeys, secure: bool) -> Self {
        Self {
            keys: Arc::new(keys),
            secure,
            max_age: SESSION_MAX_AGE,
        }
    }

    /// Builds settings from server configuration.
    ///
    /// Cookies are marked `Secure` everywhere except development.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EmptySecret`] if a secret is empty.
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let [current, previous] = config.session_secrets();
        let keys = SessionKeys::from_secrets(current, previous)?;
        Ok(Self::new(keys, !config.is_development()))
    }

    /// Returns the signing keys.
    #[must_use]
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Decodes and verifies the session carried by request cookies.
    ///
    /// # Errors
    ///
    /// Returns the reason the cookies were rejected. Callers treat any error as
    /// an empty session.
    pub fn load(&self, headers: &HeaderMap) -> Result<Map<String, Value>, SessionError> {
        let (Some(value), Some(signature)) = (
            cookie_value(headers, SESSION_COOKIE),
            cookie_value(headers, SIGNATURE_COOKIE),
        ) else {
            return Ok(Map::new());
        };

        self.keys.verify(value, signature)?;

        let json = BASE64_URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| SessionError::InvalidEncoding)?;
        serde_json::from_slice(&json).map_err(|e| SessionError::MalformedPayload(e.to_string()))
    }

    /// Builds the `Set-Cookie` values that store `values`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MalformedPayload`] if the values cannot be
    /// encoded.
    pub fn store(&self, values: &Map<String, Value>) -> Result<[String; 2], SessionError> {
        let json =
            serde_json::to_vec(values).map_err(|e| SessionError::MalformedPayload(e.to_string()))?;
        let value = BASE64_URL_SAFE_NO_PAD.encode(json);
        let signature = self.keys.sign(&value);

        Ok([
            self.cookie(SESSION_COOKIE, &value, self.max_age),
            self.cookie(SIGNATURE_COOKIE, &signature, self.max_age),
        ])
    }

    /// Builds the `Set-Cookie` values that delete the session.
    #[must_use]
    pub fn expire(&self) -> [String; 2] {
        [
            self.cookie(SESSION_COOKIE, "", Duration::ZERO),
            self.cookie(SIGNATURE_COOKIE, "", Duration::ZERO),
        ]
    }

    fn cookie(&self, name: &str, value: &str, max_age: Duration) -> String {
        let seconds = max_age.as_secs();
        let expires = Utc::now() + chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(0));
        let mut cookie = format!(
            "{name}={value}; Path=/; Max-Age={seconds}; Expires={}; HttpOnly",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Finds a cookie by name across all `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find_map(|(key, value)| (key == name).then_some(value))
}

#[derive(Debug, Default)]
struct SessionState {
    values: Map<String, Value>,
    loaded_from_cookie: bool,
    changed: bool,
}

/// The current request's session.
///
/// Cloning yields another handle to the same session. Changes made through
/// any handle are written back when the response leaves the middleware.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn from_cookie(values: Map<String, Value>) -> Self {
        let loaded_from_cookie = !values.is_empty();
        Self {
            state: Arc::new(Mutex::new(SessionState {
                values,
                loaded_from_cookie,
                changed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value stored under `key`, deserialized into `T`.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().values.get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MalformedPayload`] if `value` cannot be
    /// represented as JSON.
    pub fn insert(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), SessionError> {
        let value =
            serde_json::to_value(value).map_err(|e| SessionError::MalformedPayload(e.to_string()))?;
        let mut state = self.lock();
        state.values.insert(key.into(), value);
        state.changed = true;
        Ok(())
    }

    /// Removes and returns the raw value stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut state = self.lock();
        let removed = state.values.remove(key);
        if removed.is_some() {
            state.changed = true;
        }
        removed
    }

    /// Removes every value.
    pub fn clear(&self) {
        let mut state = self.lock();
        if !state.values.is_empty() || state.loaded_from_cookie {
            state.values.clear();
            state.changed = true;
        }
    }

    /// Returns `true` if the session holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    fn pending_write(&self) -> Option<Map<String, Value>> {
        let state = self.lock();
        state.changed.then(|| state.values.clone())
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| AppError::server_unavailable("Sessions are not available"))
    }
}

/// Session middleware.
///
/// Install with `axum::middleware::from_fn_with_state(session_config,
/// session_layer)`.
pub async fn session_layer(
    State(config): State<SessionConfig>,
    mut request: Request,
    next: Next,
) -> Response {
    let values = config.load(request.headers()).unwrap_or_else(|err| {
        tracing::debug!(component = LOG.component(), error = %err, "Discarding session cookie");
        Map::new()
    });

    let session = Session::from_cookie(values);
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;

    if let Some(values) = session.pending_write() {
        let cookies = if values.is_empty() {
            Ok(config.expire())
        } else {
            config.store(&values)
        };

        match cookies {
            Ok(cookies) => {
                for cookie in cookies {
                    if let Ok(value) = HeaderValue::from_str(&cookie) {
                        response.headers_mut().append(SET_COOKIE, value);
                    }
                }
            }
            Err(err) => log_error!(LOG, details = %err, "Failed to write session"),
        }
    }

    response
}
