// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Credential validation.
//!
//! A request is authenticated by trying a fixed, ordered list of strategies:
//!
//! 1. [`CredentialStrategy::ApiKey`]: an opaque key in a dedicated header, checked
//!    against a [`KeyAuthority`].
//! 2. [`CredentialStrategy::SignedToken`]: an HMAC-signed token taken from the
//!    `Authorization: Bearer` header or a session cookie.
//!
//! The first strategy that succeeds produces the [`Identity`]. If none succeeds the
//! request is rejected; there is no anonymous fallback. Lookup errors from the
//! authority are treated as an invalid key.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHasher;
use http::{header, HeaderMap, HeaderName};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AuthorityError, IngestError, RejectionReason};

/// Source of truth for which API keys are active.
#[async_trait]
pub trait KeyAuthority: Send + Sync {
    async fn lookup_active_key(&self, key: &str) -> Result<bool, AuthorityError>;
}

/// A fixed set of active keys, loaded once at startup.
#[derive(Clone, Default)]
pub struct StaticKeyAuthority {
    keys: HashSet<String>,
}

impl StaticKeyAuthority {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|key: &String| !key.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for StaticKeyAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticKeyAuthority({} keys)", self.keys.len())
    }
}

#[async_trait]
impl KeyAuthority for StaticKeyAuthority {
    async fn lookup_active_key(&self, key: &str) -> Result<bool, AuthorityError> {
        Ok(self.keys.contains(key))
    }
}

/// Claims carried by a verified session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user) id.
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration, seconds since the Unix epoch.
    pub exp: u64,
}

/// The authenticated caller, used for rate limiting and accounting.
#[derive(Clone, PartialEq, Eq)]
pub enum Identity {
    ApiKey(String),
    Session(SessionClaims),
}

impl Identity {
    /// Stable key identifying this caller for admission accounting. Sessions
    /// are keyed by subject, so a refreshed token keeps its bucket.
    #[must_use]
    pub fn accounting_key(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        match self {
            Self::ApiKey(key) => {
                hasher.write_u8(0);
                hasher.write(key.as_bytes());
            }
            Self::Session(claims) => {
                hasher.write_u8(1);
                hasher.write(claims.sub.as_bytes());
            }
        }
        hasher.finish()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "Identity::ApiKey(<redacted>)"),
            Self::Session(claims) => write!(f, "Identity::Session({})", claims.sub),
        }
    }
}

pub struct ApiKeyStrategy {
    header: HeaderName,
    authority: Arc<dyn KeyAuthority>,
}

pub struct SignedTokenStrategy {
    decoding_key: DecodingKey,
    validation: Validation,
    cookie: String,
}

/// A way of authenticating a request. Variants are tried in [`Self::priority`] order.
pub enum CredentialStrategy {
    ApiKey(ApiKeyStrategy),
    SignedToken(SignedTokenStrategy),
}

impl CredentialStrategy {
    pub fn api_key(
        header_name: &str,
        authority: Arc<dyn KeyAuthority>,
    ) -> Result<Self, IngestError> {
        let header = HeaderName::from_bytes(header_name.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                IngestError::Configuration(format!("invalid API key header '{header_name}': {e}"))
            })?;
        Ok(Self::ApiKey(ApiKeyStrategy { header, authority }))
    }

    /// Accepts tokens signed with any HMAC-SHA2 variant using `secret`.
    pub fn signed_token(
        secret: &[u8],
        cookie: &str,
        leeway_secs: u64,
    ) -> Result<Self, IngestError> {
        if secret.is_empty() {
            return Err(IngestError::Configuration(
                "token signing secret must not be empty".to_string(),
            ));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self::SignedToken(SignedTokenStrategy {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            cookie: cookie.to_string(),
        }))
    }

    /// Lower runs first. Adding a strategy means adding a variant and a slot here.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::ApiKey(_) => 0,
            Self::SignedToken(_) => 1,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::SignedToken(_) => "signed_token",
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, RejectionReason> {
        match self {
            Self::ApiKey(strategy) => strategy.authenticate(headers).await,
            Self::SignedToken(strategy) => strategy.authenticate(headers),
        }
    }
}

impl fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialStrategy::{}", self.name())
    }
}

impl ApiKeyStrategy {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, RejectionReason> {
        let Some(value) = headers.get(&self.header) else {
            return Err(RejectionReason::Missing);
        };
        let key = value
            .to_str()
            .map_err(|_| RejectionReason::Malformed)?
            .trim();
        if key.is_empty() {
            return Err(RejectionReason::Missing);
        }

        match self.authority.lookup_active_key(key).await {
            Ok(true) => Ok(Identity::ApiKey(key.to_string())),
            Ok(false) => Err(RejectionReason::Invalid),
            Err(e) => {
                warn!("Rejecting API key, authority unavailable: {e}");
                Err(RejectionReason::Invalid)
            }
        }
    }
}

impl SignedTokenStrategy {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, RejectionReason> {
        let token = self.extract(headers)?.ok_or(RejectionReason::Missing)?;
        decode::<SessionClaims>(&token, &self.decoding_key, &self.validation)
            .map(|data| Identity::Session(data.claims))
            .map_err(|e| classify_token_error(e.kind()))
    }

    /// The `Authorization` header wins over the cookie when both are present.
    fn extract(&self, headers: &HeaderMap) -> Result<Option<String>, RejectionReason> {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let value = value.to_str().map_err(|_| RejectionReason::Malformed)?;
            let (scheme, token) = value
                .trim()
                .split_once(' ')
                .ok_or(RejectionReason::Malformed)?;
            let token = token.trim();
            if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
                return Err(RejectionReason::Malformed);
            }
            return Ok(Some(token.to_string()));
        }

        for value in headers.get_all(header::COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for pair in value.split(';') {
                if let Some((name, token)) = pair.trim().split_once('=') {
                    if name == self.cookie && !token.is_empty() {
                        return Ok(Some(token.to_string()));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn classify_token_error(kind: &ErrorKind) -> RejectionReason {
    match kind {
        ErrorKind::ExpiredSignature => RejectionReason::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => RejectionReason::Malformed,
        _ => RejectionReason::Invalid,
    }
}

/// Authenticates requests against an ordered list of strategies.
#[derive(Debug)]
pub struct CredentialValidator {
    strategies: Vec<CredentialStrategy>,
}

impl CredentialValidator {
    pub fn new(mut strategies: Vec<CredentialStrategy>) -> Result<Self, IngestError> {
        if strategies.is_empty() {
            return Err(IngestError::Configuration(
                "at least one credential strategy is required".to_string(),
            ));
        }
        strategies.sort_by_key(CredentialStrategy::priority);
        Ok(Self { strategies })
    }

    #[must_use]
    pub fn strategies(&self) -> &[CredentialStrategy] {
        &self.strategies
    }

    /// Returns the identity from the first strategy that accepts the request.
    ///
    /// On failure the most specific reason across all strategies is kept for
    /// logging; callers only ever see [`IngestError::AuthRejected`].
    pub async fn validate(&self, headers: &HeaderMap) -> Result<Identity, IngestError> {
        let mut reason = RejectionReason::Missing;
        for strategy in &self.strategies {
            match strategy.authenticate(headers).await {
                Ok(identity) => return Ok(identity),
                Err(rejected) => {
                    debug!(strategy = strategy.name(), %rejected, "Credential rejected");
                    reason = reason.max(rejected);
                }
            }
        }
        debug!(%reason, "Request rejected, no strategy accepted its credentials");
        Err(IngestError::AuthRejected(reason))
    }
}
