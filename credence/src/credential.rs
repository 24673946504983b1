use credence_clock::{DurationMillis, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, Endpoint, EndpointRef};

/// A credential as produced by a loader
///
/// Credentials handed out by the cache have had their expiry adjusted by the
/// cache's [`CacheConfig`][crate::CacheConfig], so `expires_at()` reflects how
/// long the cache is willing to trust the credential rather than what the
/// issuer claimed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    access_token: AccessToken,
    endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<UnixTime>,
}

impl Credential {
    /// Constructs a credential that does not expire
    pub fn new(access_token: impl Into<AccessToken>, endpoint: impl Into<Endpoint>) -> Self {
        Self {
            access_token: access_token.into(),
            endpoint: endpoint.into(),
            expires_at: None,
        }
    }

    /// Sets the time at which the credential stops being valid
    #[must_use]
    pub fn with_expiry(mut self, expires_at: UnixTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the endpoint the access token is valid for
    #[inline]
    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    /// Gets the time at which the credential expires, if it expires at all
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Gets a duration for how much longer the credential would be valid as of
    /// the provided time, ignoring any expiration buffer
    ///
    /// Returns `None` for credentials that do not expire.
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Option<DurationMillis> {
        self.expires_at.map(|expiry| expiry - time)
    }
}
