//! Session authentication for the viewer API.
//!
//! A successful login issues a bearer token bound to the user and an expiry:
//!
//! ```text
//! token     = "{user}.{expiry}.{signature}"
//! signature = hex(HMAC-SHA256(secret_key, "{user}.{expiry}"))
//! ```
//!
//! The token is returned in the login response body and set as the
//! `auth_token` cookie. Protected routes accept it either as
//! `Authorization: Bearer <token>` or through that cookie.
//!
//! # Security Properties
//!
//! - **Stateless verification**: the signature alone proves the token was issued here
//! - **Time-limited**: tokens expire after a configurable TTL
//! - **Revocable**: logout revokes the presented token until it would have expired
//! - **Constant-time comparison**: signatures and password digests are compared
//!   with `subtle`
//!
//! # Example
//!
//! ```rust
//! use cyto_viewer::server::auth::SessionAuth;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let auth = SessionAuth::new("my-secret-key").with_password("hunter2");
//!
//! let (token, _expiry) = auth.login("pathologist", "hunter2").unwrap();
//! assert_eq!(auth.verify(&token).await.unwrap(), "pathologist");
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::handlers::error_response;

/// Cookie carrying the session token.
pub const AUTH_COOKIE: &str = "auth_token";

/// Default session lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Types
// =============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Authentication error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer header or cookie
    MissingToken,

    /// Token is not `user.expiry.signature` or the signature is not hex
    MalformedToken,

    /// Token has expired
    Expired {
        /// When the token expired
        expired_at: u64,
        /// Current time
        current_time: u64,
    },

    /// Signature does not match
    InvalidSignature,

    /// Token was revoked by logout
    Revoked,

    /// Login with a wrong password or empty user name
    InvalidCredentials,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing session token"),
            AuthError::MalformedToken => write!(f, "Malformed session token"),
            AuthError::Expired {
                expired_at,
                current_time,
            } => write!(
                f,
                "Session expired at {} (current time: {})",
                expired_at, current_time
            ),
            AuthError::InvalidSignature => write!(f, "Invalid session signature"),
            AuthError::Revoked => write!(f, "Session has been revoked"),
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing_token"),
            AuthError::MalformedToken => (StatusCode::BAD_REQUEST, "malformed_token"),
            AuthError::Expired { .. } => (StatusCode::UNAUTHORIZED, "session_expired"),
            AuthError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            AuthError::Revoked => (StatusCode::UNAUTHORIZED, "session_revoked"),
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
        };

        // A forged signature or a password guess is worth a warning; expiry is routine
        match &self {
            AuthError::InvalidSignature | AuthError::InvalidCredentials => {
                warn!(
                    error_type = error_type,
                    status = status.as_u16(),
                    "Authentication failed: {}",
                    self
                );
            }
            _ => {
                debug!(
                    error_type = error_type,
                    status = status.as_u16(),
                    "Authentication failed: {}",
                    self
                );
            }
        }

        error_response(status, error_type, self.to_string())
    }
}

// =============================================================================
// Session Authentication
// =============================================================================

/// Issues and verifies HMAC-signed session tokens.
///
/// Clones share the revocation list.
#[derive(Clone)]
pub struct SessionAuth {
    /// Secret key for HMAC computation
    secret_key: Vec<u8>,

    /// SHA-256 of the login password; `None` accepts any password
    password_digest: Option<Vec<u8>>,

    ttl: Duration,

    /// Revoked tokens mapped to their expiry
    revoked: Arc<Mutex<HashMap<String, u64>>>,
}

impl SessionAuth {
    /// Create an authenticator that accepts any password.
    ///
    /// # Arguments
    ///
    /// * `secret_key` - The secret key used for HMAC computation. Should be
    ///   at least 32 bytes for security.
    pub fn new(secret_key: impl AsRef<[u8]>) -> Self {
        Self {
            secret_key: secret_key.as_ref().to_vec(),
            password_digest: None,
            ttl: DEFAULT_TOKEN_TTL,
            revoked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Require `password` at login.
    pub fn with_password(mut self, password: impl AsRef<[u8]>) -> Self {
        self.password_digest = Some(Sha256::digest(password.as_ref()).to_vec());
        self
    }

    /// Set how long issued tokens stay valid.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether login checks a password at all.
    pub fn requires_password(&self) -> bool {
        self.password_digest.is_some()
    }

    /// Check credentials and issue a token.
    ///
    /// Returns the token and its expiry (Unix epoch seconds).
    pub fn login(&self, user: &str, password: &str) -> Result<(String, u64), AuthError> {
        if user.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        if let Some(expected) = &self.password_digest {
            let provided = Sha256::digest(password.as_bytes());
            if !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
                return Err(AuthError::InvalidCredentials);
            }
        }
        Ok(self.issue(user))
    }

    /// Issue a token for `user` valid for the configured TTL.
    pub fn issue(&self, user: &str) -> (String, u64) {
        let expiry = unix_now() + self.ttl.as_secs();
        (self.issue_with_expiry(user, expiry), expiry)
    }

    /// Issue a token for `user` with a specific expiry timestamp.
    pub fn issue_with_expiry(&self, user: &str, expiry: u64) -> String {
        let signature = hex::encode(self.compute_signature(user, expiry));
        format!("{}.{}.{}", user, expiry, signature)
    }

    /// Verify a token and return the user it was issued to.
    pub async fn verify(&self, token: &str) -> Result<String, AuthError> {
        // The user name may contain dots; expiry and signature never do
        let mut parts = token.rsplitn(3, '.');
        let (Some(signature), Some(expiry), Some(user)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::MalformedToken);
        };
        let expiry: u64 = expiry.parse().map_err(|_| AuthError::MalformedToken)?;

        let current_time = unix_now();
        if current_time > expiry {
            return Err(AuthError::Expired {
                expired_at: expiry,
                current_time,
            });
        }

        let provided = hex::decode(signature).map_err(|_| AuthError::MalformedToken)?;
        let expected = self.compute_signature(user, expiry);
        if !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
            return Err(AuthError::InvalidSignature);
        }

        if self.revoked.lock().await.contains_key(token) {
            return Err(AuthError::Revoked);
        }

        Ok(user.to_string())
    }

    /// Revoke a token until its expiry. Unparseable tokens are ignored.
    pub async fn revoke(&self, token: &str) {
        let Some(expiry) = token
            .rsplitn(3, '.')
            .nth(1)
            .and_then(|e| e.parse::<u64>().ok())
        else {
            return;
        };

        let now = unix_now();
        let mut revoked = self.revoked.lock().await;
        revoked.retain(|_, until| *until >= now);
        revoked.insert(token.to_string(), expiry);
    }

    fn compute_signature(&self, user: &str, expiry: u64) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret_key).expect("HMAC can take key of any size");
        mac.update(user.as_bytes());
        mac.update(b".");
        mac.update(expiry.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuth")
            .field("requires_password", &self.requires_password())
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Extract the session token from `Authorization: Bearer` or the auth cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value carrying a fresh token.
pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={}",
        AUTH_COOKIE,
        token,
        ttl.as_secs()
    )
}

/// `Set-Cookie` value that clears the session cookie.
pub fn clear_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; Max-Age=0", AUTH_COOKIE)
}

// =============================================================================
// Axum Middleware
// =============================================================================

/// User name attached to authenticated requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser(pub String);

/// Axum middleware rejecting requests without a valid session token.
///
/// # Example
///
/// ```ignore
/// use axum::{Router, middleware};
/// use cyto_viewer::server::auth::{SessionAuth, session_middleware};
///
/// let auth = SessionAuth::new("secret-key");
/// let app = Router::new()
///     .route("/api/tiles/{slide_id}", get(tile_handler))
///     .layer(middleware::from_fn_with_state(auth, session_middleware));
/// ```
pub async fn session_middleware(
    State(auth): State<SessionAuth>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = token_from_headers(request.headers()).ok_or(AuthError::MissingToken)?;
    let user = auth.verify(&token).await?;
    request.extensions_mut().insert(SessionUser(user));
    Ok(next.run(request).await)
}

// =============================================================================
// Tests
// =============================================================================
