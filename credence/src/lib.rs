//! A shared, expiry-aware, single-flight credential cache
//!
//! Many parts of an application need the same short-lived credential: an access
//! token plus the endpoint it is good for. Fetching one per caller wastes round
//! trips and, worse, lets callers race each other into using tokens that were
//! already replaced. This crate places a [`CredentialCache`] between those callers
//! and whatever actually produces credentials (a [`CredentialLoader`]).
//!
//! The cache guarantees that:
//!
//! * concurrent subscribers share exactly one outstanding fetch;
//! * a credential that is expired (after accounting for a configurable buffer)
//!   is never handed out, and a loader that answers with one is simply asked
//!   again;
//! * expiry is checked lazily when a credential is consumed, so no background
//!   timers are involved;
//! * [`renew()`][CredentialCache::renew] invalidates the held credential and
//!   supersedes any fetch that was already underway;
//! * an optional authentication signal suppresses all fetching while the user is
//!   logged out and resumes deferred refreshes once they log back in.
//!
//! All state transitions are evaluated by a single driver task, so callers only
//! ever observe fully applied state.
//!
//! ```
//! use credence::{loader, CacheConfig, Credential, CredentialCache};
//! use credence_clock::DurationMillis;
//! use std::convert::Infallible;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), credence::CacheError> {
//! let loader = loader::from_fn(|| async {
//!     Ok::<_, Infallible>(Credential::new("token", "https://cpq.example.com"))
//! });
//!
//! let config = CacheConfig::default()
//!     .with_expiration_buffer(DurationMillis(10_000))
//!     .with_max_validity(DurationMillis(3_600_000));
//!
//! let cache = CredentialCache::builder(loader)
//!     .with_config(config)
//!     .expect("max validity exceeds the buffer")
//!     .spawn();
//!
//! let credential = cache.credential().await?;
//! assert_eq!(credential.endpoint().as_str(), "https://cpq.example.com");
//!
//! // Something rejected the token: throw it away and fetch another one.
//! cache.renew();
//! # Ok(())
//! # }
//! ```
//!
//! Callers that want to follow every replacement of the credential instead of
//! asking for one at a time can hold on to a [`CredentialStream`] obtained from
//! [`observe()`][CredentialCache::observe].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
mod config;
mod credential;
mod error;
mod fetch;
pub mod loader;
mod stream;

#[cfg(test)]
mod test_support;

pub use braids::*;
pub use cache::{CredentialCache, CredentialCacheBuilder};
pub use config::{CacheConfig, CredentialStatus};
pub use credential::Credential;
pub use error::{CacheError, ConfigError};
pub use loader::CredentialLoader;
pub use stream::CredentialStream;
