//! Sign-in for analysts.
//!
//! An ID token issued by the identity provider is verified once, at login,
//! and exchanged for an encrypted session cookie. Protected routes only
//! check that cookie.

use crate::server::WebError;
use crate::settings::AuthSettings;
use actix_web::cookie::{time::Duration as CookieDuration, Cookie, CookieJar, Key, SameSite};
use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the encrypted session cookie
pub const SESSION_COOKIE: &str = "milkscan_session";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No ID token provided")]
    MissingToken,

    #[error("Invalid ID token: {0}")]
    InvalidToken(String),

    #[error("identity provider request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("identity provider API key is not configured")]
    NotConfigured,

    #[error("Authentication required")]
    Unauthenticated,
}

/// The account behind a verified ID token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub uid: String,
    pub email: Option<String>,
}

/// Checks ID tokens with the identity provider
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Verifies tokens through the Identity Toolkit `accounts:lookup` endpoint
#[derive(Debug)]
pub struct IdentityToolkitVerifier {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    id_token: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct ProviderError {
    error: ProviderErrorBody,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    message: String,
}

impl LookupResponse {
    fn into_identity(self) -> Result<VerifiedIdentity, AuthError> {
        let user = self
            .users
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::InvalidToken("no account for token".into()))?;
        Ok(VerifiedIdentity {
            uid: user.local_id,
            email: user.email,
        })
    }
}

impl IdentityToolkitVerifier {
    pub fn new(settings: &AuthSettings) -> Result<Self, AuthError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(AuthError::NotConfigured)?;

        let client = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()?;

        Ok(IdentityToolkitVerifier {
            client,
            url: settings.verify_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl IdentityVerifier for IdentityToolkitVerifier {
    async fn verify(&self, id_token: &str) -> Result<VerifiedIdentity, AuthError> {
        let id_token = id_token.trim();
        if id_token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let response = self
            .client
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(&LookupRequest { id_token })
            .send()
            .await?;

        // the provider answers 400 for expired or forged tokens
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let reason = response
                .json::<ProviderError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "rejected by identity provider".into());
            return Err(AuthError::InvalidToken(reason));
        }

        let lookup: LookupResponse = response.error_for_status()?.json().await?;
        lookup.into_identity()
    }
}

/// What the session cookie carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub uid: String,
    pub email: Option<String>,
    /// Unix timestamp in seconds
    pub expires_at: i64,
}

impl UserSession {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Issues and reads encrypted session cookies
pub struct SessionManager {
    key: Key,
    lifetime_hours: i64,
    secure: bool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("lifetime_hours", &self.lifetime_hours)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Cookie key from a base64 secret, or a random one when the secret is
/// missing or unusable
pub fn session_key(secret: Option<&str>) -> Key {
    let Some(secret) = secret else {
        warn!("no session secret configured, sessions will not survive a restart");
        return Key::generate();
    };

    let bytes = match general_purpose::STANDARD.decode(secret.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("session secret is not valid base64 ({err}), using a random key");
            return Key::generate();
        }
    };

    Key::try_from(bytes.as_slice()).unwrap_or_else(|_| {
        warn!(
            "session secret is {} bytes, at least 64 are required; using a random key",
            bytes.len()
        );
        Key::generate()
    })
}

impl SessionManager {
    pub fn new(key: Key, settings: &AuthSettings) -> Self {
        SessionManager {
            key,
            lifetime_hours: settings.session_hours.max(1),
            secure: settings.secure_cookies,
        }
    }

    /// Build the encrypted cookie for a freshly verified identity
    pub fn start(&self, identity: VerifiedIdentity) -> Result<Cookie<'static>, WebError> {
        let session = UserSession {
            uid: identity.uid,
            email: identity.email,
            expires_at: Utc::now().timestamp() + self.lifetime_hours * 3600,
        };
        let value = serde_json::to_string(&session)?;

        let cookie = Cookie::build(SESSION_COOKIE, value)
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure)
            .max_age(CookieDuration::hours(self.lifetime_hours))
            .finish();

        let mut jar = CookieJar::new();
        jar.private_mut(&self.key).add(cookie);
        let encrypted = jar
            .get(SESSION_COOKIE)
            .cloned()
            .ok_or_else(|| WebError::internal("session cookie was not stored"))?;

        info!(uid = %session.uid, "session started");
        Ok(encrypted)
    }

    /// Decrypt and validate the session cookie of a request
    pub fn read(&self, req: &HttpRequest) -> Option<UserSession> {
        let cookie = req.cookie(SESSION_COOKIE)?;

        let mut jar = CookieJar::new();
        jar.add_original(cookie);
        let Some(plain) = jar.private(&self.key).get(SESSION_COOKIE) else {
            debug!("session cookie failed to decrypt");
            return None;
        };

        let session: UserSession = serde_json::from_str(plain.value()).ok()?;
        if session.is_expired() {
            debug!(uid = %session.uid, "session expired");
            return None;
        }
        Some(session)
    }

    /// A cookie that clears the session in the browser
    pub fn end(&self) -> Cookie<'static> {
        let mut cookie = Cookie::named(SESSION_COOKIE);
        cookie.set_path("/");
        cookie.make_removal();
        cookie
    }
}

/// Extractor for routes that require a signed-in analyst
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub UserSession);

impl FromRequest for AuthenticatedUser {
    type Error = WebError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let session = req
            .app_data::<web::Data<SessionManager>>()
            .and_then(|sessions| sessions.read(req));

        ready(match session {
            Some(session) => Ok(AuthenticatedUser(session)),
            None => Err(AuthError::Unauthenticated.into()),
        })
    }
}
