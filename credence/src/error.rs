use std::{error, sync::Arc};

use credence_clock::DurationMillis;
use thiserror::Error;

/// An error delivered to subscribers of a credential cache
///
/// Errors are tied to a single fetch cycle. They are not cached, and the next
/// subscription or renewal starts a new attempt.
#[derive(Clone, Debug, Error)]
pub enum CacheError {
    /// The loader was unable to produce a credential
    #[error("credential loader failed")]
    Load(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The loader panicked while producing a credential
    #[error("credential loader panicked")]
    LoaderPanicked,
    /// The cache has been shut down and will not produce any more credentials
    #[error("credential cache has shut down")]
    Closed,
}

impl CacheError {
    pub(crate) fn load<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Load(Arc::new(error))
    }
}

/// A [`CacheConfig`][crate::CacheConfig] whose options contradict each other
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Credentials would be expired as soon as they were accepted
    #[error(
        "max validity of {}ms does not exceed the expiration buffer of {}ms",
        .max_validity.0,
        .expiration_buffer.0
    )]
    MaxValidityWithinBuffer {
        /// The configured maximum validity
        max_validity: DurationMillis,
        /// The configured expiration buffer
        expiration_buffer: DurationMillis,
    },
    /// No credential could ever satisfy the minimum validity
    #[error(
        "max validity of {}ms is shorter than the min validity of {}ms",
        .max_validity.0,
        .min_validity.0
    )]
    MaxValidityBelowMinValidity {
        /// The configured maximum validity
        max_validity: DurationMillis,
        /// The configured minimum validity
        min_validity: DurationMillis,
    },
}
