//! OAuth2 client-credentials authentication against the cloud ingestion
//! service, with token caching and refresh at 80% of the advertised
//! lifetime.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

/// Errors raised while authenticating against the sink.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The token endpoint could not be reached or returned a non-2xx
    /// response.
    #[error("oauth2 token request failed: {0}")]
    Request(String),

    /// The token endpoint's response body could not be parsed.
    #[error("oauth2 token response malformed: {0}")]
    MalformedResponse(String),
}

/// Client-credentials configuration. Secrets are resolved from the
/// environment at config-load time (see `config::SinkConfig`); this struct
/// holds them only in process memory.
#[derive(Clone)]
pub struct OAuth2Config {
    /// The token endpoint URL.
    pub token_url: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Optional audience/resource/scope, passed through verbatim if set.
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: u64,
}

/// Some token endpoints omit `expires_in` and issue a JWT access token
/// instead; fall back to its `exp` claim. The signature is not verified
/// here — the token is only ever sent back to the same sink it was issued
/// by, never trusted as an authorization decision locally.
fn jwt_remaining_lifetime(access_token: &str) -> Option<Duration> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;

    let claims = jsonwebtoken::decode::<JwtClaims>(access_token, &jsonwebtoken::DecodingKey::from_secret(&[]), &validation)
        .ok()?
        .claims;

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).ok()?.as_secs();
    claims.exp.checked_sub(now).map(Duration::from_secs)
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
    refresh_at: Instant,
}

/// Caches and refreshes the access token used to authenticate ingestion
/// requests.
pub struct AuthManager {
    http: reqwest::Client,
    config: OAuth2Config,
    cached: Mutex<Option<CachedToken>>,
}

/// Default assumed token lifetime when the token endpoint omits
/// `expires_in`, chosen conservatively short so a missing field degrades to
/// frequent refreshes rather than stale-token failures.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

impl AuthManager {
    /// Creates a new auth manager for the given client-credentials config.
    pub fn new(http: reqwest::Client, config: OAuth2Config) -> Self {
        Self {
            http,
            config,
            cached: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> Result<(String, Duration), Error> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if let Some(scope) = &self.config.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Request(format!("token endpoint returned {}", response.status())));
        }

        let body: TokenResponse = response.json().await.map_err(|e| Error::MalformedResponse(e.to_string()))?;
        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .or_else(|| jwt_remaining_lifetime(&body.access_token))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok((body.access_token, lifetime))
    }

    /// Returns a valid access token, fetching or refreshing it as needed.
    /// Refreshes proactively once 80% of the cached token's lifetime has
    /// elapsed.
    pub async fn token(&self) -> Result<String, Error> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.access_token.clone());
            }
        }

        let (access_token, lifetime) = self.request_token().await?;
        let now = Instant::now();
        let refresh_at = now + lifetime.mul_f64(0.8);
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: now + lifetime,
            refresh_at,
        });
        Ok(access_token)
    }

    /// Forces a refresh, discarding any cached token, and returns the new
    /// one. Used when the sink observes a 401/unauthenticated response.
    pub async fn force_refresh(&self) -> Result<String, Error> {
        {
            let mut guard = self.cached.lock().await;
            *guard = None;
        }
        self.token().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_lifetime_is_conservative() {
        assert!(DEFAULT_TOKEN_LIFETIME <= Duration::from_secs(600));
    }
}
