//! Client identification from a persisted token.
//!
//! Clients are anonymous. The first request without a usable token gets a
//! fresh UUID, handed back as a long-lived cookie; every later request carries
//! it in the `captcha_client` cookie or the `x-client-token` header.

use std::fmt;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const COOKIE_NAME: &str = "captcha_client";
pub const TOKEN_HEADER: &str = "x-client-token";

/// Stable identifier of one browser or agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of resolving a request's identity.
#[derive(Debug, Clone)]
pub struct ResolvedClient {
    pub client_id: ClientId,
    /// Set when a new token was issued and must be persisted by the client.
    pub issued_cookie: Option<HeaderValue>,
}

/// Issues and recognises client tokens.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    max_age: Duration,
}

impl IdentityResolver {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    /// Resolve the client behind a request, issuing a token if none is present.
    pub fn resolve(&self, headers: &HeaderMap) -> ResolvedClient {
        if let Some(client_id) = token_from_headers(headers) {
            return ResolvedClient {
                client_id,
                issued_cookie: None,
            };
        }

        let client_id = ClientId::generate();
        tracing::debug!(client_id = %client_id, "Issued new client token");
        ResolvedClient {
            issued_cookie: self.cookie_for(&client_id),
            client_id,
        }
    }

    /// `Set-Cookie` value persisting the token for the configured lifetime.
    pub fn cookie_for(&self, client_id: &ClientId) -> Option<HeaderValue> {
        let cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            COOKIE_NAME,
            client_id,
            self.max_age.as_secs()
        );
        HeaderValue::from_str(&cookie).ok()
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<ClientId> {
    let from_header = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_token);
    if from_header.is_some() {
        return from_header;
    }

    CookieJar::from_headers(headers)
        .get(COOKIE_NAME)
        .and_then(|cookie| parse_token(cookie.value()))
}

// Only tokens we could have issued are accepted.
fn parse_token(raw: &str) -> Option<ClientId> {
    Uuid::parse_str(raw.trim())
        .ok()
        .map(|uuid| ClientId(uuid.to_string()))
}
