use credence_clock::{DurationMillis, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ConfigError, Credential};

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential is valid and will be handed out
    Valid,
    /// The credential has not yet expired, but is inside the expiration buffer
    /// and will no longer be handed out
    Expiring,
    /// The credential is no longer valid
    Expired,
}

/// Configuration for deciding whether a credential may be handed out
///
/// Deserializes from the option names used by the storefront configuration:
///
/// ```
/// # use credence::CacheConfig;
/// # use credence_clock::DurationMillis;
/// let config: CacheConfig = serde_json::from_str(
///     r#"{ "expirationBufferMillis": 10, "maxValidityMillis": 1000, "minValidityMillis": 5 }"#,
/// ).unwrap();
///
/// assert_eq!(config.expiration_buffer(), DurationMillis(10));
/// ```
///
/// Inconsistent combinations are rejected while deserializing:
///
/// ```
/// # use credence::CacheConfig;
/// let result = serde_json::from_str::<CacheConfig>(
///     r#"{ "expirationBufferMillis": 10, "maxValidityMillis": 5 }"#,
/// );
///
/// assert!(result.is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CacheOptions")]
pub struct CacheConfig {
    #[serde(rename = "expirationBufferMillis")]
    expiration_buffer: DurationMillis,
    #[serde(rename = "maxValidityMillis")]
    max_validity: Option<DurationMillis>,
    #[serde(rename = "minValidityMillis")]
    min_validity: DurationMillis,
}

/// The options as they appear in configuration files, before validation
#[derive(Deserialize)]
#[serde(default)]
struct CacheOptions {
    #[serde(rename = "expirationBufferMillis")]
    expiration_buffer: DurationMillis,
    #[serde(rename = "maxValidityMillis")]
    max_validity: Option<DurationMillis>,
    #[serde(rename = "minValidityMillis")]
    min_validity: DurationMillis,
}

impl Default for CacheOptions {
    fn default() -> Self {
        let CacheConfig {
            expiration_buffer,
            max_validity,
            min_validity,
        } = CacheConfig::default();

        Self {
            expiration_buffer,
            max_validity,
            min_validity,
        }
    }
}

impl TryFrom<CacheOptions> for CacheConfig {
    type Error = ConfigError;

    fn try_from(options: CacheOptions) -> Result<Self, Self::Error> {
        let config = Self {
            expiration_buffer: options.expiration_buffer,
            max_validity: options.max_validity,
            min_validity: options.min_validity,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for CacheConfig {
    /// Default cache configuration
    ///
    /// Treats credentials as expired 10 seconds before their stated expiry, trusts
    /// any stated expiry and accepts credentials with any remaining lifetime.
    fn default() -> Self {
        Self {
            expiration_buffer: DurationMillis(10_000),
            max_validity: None,
            min_validity: DurationMillis(0),
        }
    }
}

/// Why a freshly loaded credential was not accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub(crate) enum Rejection {
    #[error("credential expired at {}", .expires_at.0)]
    Expired { expires_at: UnixTime },
    #[error("credential only valid for {}ms", .remaining.0)]
    TooShortLived { remaining: DurationMillis },
}

impl CacheConfig {
    /// Sets how long before its stated expiry a credential is treated as expired
    #[must_use]
    pub fn with_expiration_buffer(mut self, buffer: DurationMillis) -> Self {
        self.expiration_buffer = buffer;
        self
    }

    /// Caps how far into the future a loaded credential's expiry is trusted
    ///
    /// Useful when the issuer's clock cannot be relied upon.
    #[must_use]
    pub fn with_max_validity(mut self, max_validity: DurationMillis) -> Self {
        self.max_validity = Some(max_validity);
        self
    }

    /// Sets the minimum remaining lifetime a loaded credential must have to be
    /// accepted at all
    #[must_use]
    pub fn with_min_validity(mut self, min_validity: DurationMillis) -> Self {
        self.min_validity = min_validity;
        self
    }

    /// The expiration buffer
    #[inline]
    pub fn expiration_buffer(&self) -> DurationMillis {
        self.expiration_buffer
    }

    /// The maximum trusted validity, if any
    #[inline]
    pub fn max_validity(&self) -> Option<DurationMillis> {
        self.max_validity
    }

    /// The minimum validity required for acceptance
    #[inline]
    pub fn min_validity(&self) -> DurationMillis {
        self.min_validity
    }

    /// Checks that the options can be satisfied together
    ///
    /// A maximum validity at or below the expiration buffer would make every
    /// credential expired the moment it is accepted, and one below the minimum
    /// validity would let credentials through with less trusted life than
    /// required.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_validity = match self.max_validity {
            Some(max_validity) => max_validity,
            None => return Ok(()),
        };

        if max_validity <= self.expiration_buffer {
            return Err(ConfigError::MaxValidityWithinBuffer {
                max_validity,
                expiration_buffer: self.expiration_buffer,
            });
        }

        if max_validity < self.min_validity {
            return Err(ConfigError::MaxValidityBelowMinValidity {
                max_validity,
                min_validity: self.min_validity,
            });
        }

        Ok(())
    }

    /// Gets a credential's lifetime status as of the provided time
    pub fn status_at(&self, credential: &Credential, time: UnixTime) -> CredentialStatus {
        match credential.expires_at() {
            None => CredentialStatus::Valid,
            Some(expiry) if expiry <= time => CredentialStatus::Expired,
            Some(expiry) if expiry - self.expiration_buffer <= time => CredentialStatus::Expiring,
            Some(_) => CredentialStatus::Valid,
        }
    }

    /// Whether the credential may no longer be handed out as of the provided time
    #[inline]
    pub fn is_expired_at(&self, credential: &Credential, time: UnixTime) -> bool {
        self.status_at(credential, time) != CredentialStatus::Valid
    }

    /// Decides whether a credential fresh from the loader is usable
    ///
    /// Accepted credentials come back with their expiry clamped to the maximum
    /// trusted validity.
    pub(crate) fn admit(&self, credential: Credential, now: UnixTime) -> Result<Credential, Rejection> {
        let expires_at = match credential.expires_at() {
            Some(expires_at) => expires_at,
            None => return Ok(credential),
        };

        let remaining = expires_at - now;
        let trusted = self
            .max_validity
            .map_or(remaining, |max_validity| remaining.min(max_validity));
        let credential = credential.with_expiry(now + trusted);

        if self.is_expired_at(&credential, now) {
            return Err(Rejection::Expired { expires_at });
        }

        if trusted < self.min_validity {
            return Err(Rejection::TooShortLived { remaining: trusted });
        }

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{credential, test_config, NOW};

    #[test]
    fn credential_without_expiry_is_always_valid() {
        let config = test_config();
        let c = credential("forever", None);

        assert_eq!(config.status_at(&c, UnixTime(u64::MAX)), CredentialStatus::Valid);
        assert_eq!(config.admit(c.clone(), NOW), Ok(c));
    }

    #[test]
    fn status_accounts_for_buffer() {
        let config = test_config();
        let c = credential("soon", Some(NOW + DurationMillis(20)));

        assert_eq!(config.status_at(&c, NOW), CredentialStatus::Valid);
        assert_eq!(
            config.status_at(&c, NOW + DurationMillis(9)),
            CredentialStatus::Valid
        );
        assert_eq!(
            config.status_at(&c, NOW + DurationMillis(10)),
            CredentialStatus::Expiring
        );
        assert_eq!(
            config.status_at(&c, NOW + DurationMillis(20)),
            CredentialStatus::Expired
        );
    }

    #[test]
    fn accepts_credential_expiring_just_beyond_buffer() {
        let config = test_config();
        let c = credential("soon", Some(NOW + DurationMillis(20)));

        let admitted = config.admit(c, NOW).unwrap();
        assert_eq!(admitted.expires_at(), Some(NOW + DurationMillis(20)));
    }

    #[test]
    fn rejects_expired_credential() {
        let config = test_config();
        let expired = NOW - DurationMillis(60_000);

        assert_eq!(
            config.admit(credential("expired", Some(expired)), NOW),
            Err(Rejection::Expired {
                expires_at: expired
            })
        );
    }

    #[test]
    fn rejects_credential_inside_buffer() {
        let config = test_config();
        let expiry = NOW + DurationMillis(10);

        assert_eq!(
            config.admit(credential("buffered", Some(expiry)), NOW),
            Err(Rejection::Expired { expires_at: expiry })
        );
    }

    #[test]
    fn rejects_credential_below_min_validity() {
        let config = CacheConfig::default()
            .with_expiration_buffer(DurationMillis(0))
            .with_min_validity(DurationMillis(50));

        assert_eq!(
            config.admit(credential("short", Some(NOW + DurationMillis(30))), NOW),
            Err(Rejection::TooShortLived {
                remaining: DurationMillis(30)
            })
        );
    }

    #[test]
    fn clamps_far_future_expiry_to_max_validity() {
        let config = test_config();
        let c = credential("long", Some(NOW + DurationMillis(3_600_000)));

        let admitted = config.admit(c, NOW).unwrap();
        assert_eq!(admitted.expires_at(), Some(NOW + DurationMillis(1_000)));
        assert_eq!(admitted.access_token().as_str(), "long");
    }

    #[test]
    fn defaults_apply_to_missing_options() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "maxValidityMillis": 600000 }"#).unwrap();

        assert_eq!(config.expiration_buffer(), DurationMillis(10_000));
        assert_eq!(config.max_validity(), Some(DurationMillis(600_000)));
        assert_eq!(config.min_validity(), DurationMillis(0));
    }

    #[test]
    fn max_validity_within_buffer_is_inconsistent() {
        let config = CacheConfig::default()
            .with_expiration_buffer(DurationMillis(10))
            .with_max_validity(DurationMillis(5));

        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxValidityWithinBuffer {
                max_validity: DurationMillis(5),
                expiration_buffer: DurationMillis(10),
            })
        );
    }

    #[test]
    fn max_validity_below_min_validity_is_inconsistent() {
        let config = CacheConfig::default()
            .with_expiration_buffer(DurationMillis(0))
            .with_min_validity(DurationMillis(100))
            .with_max_validity(DurationMillis(50));

        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxValidityBelowMinValidity {
                max_validity: DurationMillis(50),
                min_validity: DurationMillis(100),
            })
        );
    }

    #[test]
    fn min_validity_applies_to_clamped_lifetime() {
        // validate() refuses this combination
        let config = CacheConfig {
            expiration_buffer: DurationMillis(0),
            max_validity: Some(DurationMillis(50)),
            min_validity: DurationMillis(100),
        };

        assert_eq!(
            config.admit(credential("long", Some(NOW + DurationMillis(60_000))), NOW),
            Err(Rejection::TooShortLived {
                remaining: DurationMillis(50)
            })
        );
    }

    #[test]
    fn deserializing_rejects_inconsistent_options() {
        let err = serde_json::from_str::<CacheConfig>(
            r#"{ "expirationBufferMillis": 10, "maxValidityMillis": 10 }"#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("expiration buffer"));
    }
}
