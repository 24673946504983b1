//! Credential loaders
//!
//! A loader is whatever actually obtains a credential: typically an HTTP call
//! to an authorization backend. The cache only cares about the contract below;
//! retries, backoff and timeouts for the underlying call are the loader's own
//! business.

use std::{convert::Infallible, error, fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use crate::Credential;

/// An asynchronous source of credentials
///
/// Any authentication context the loader needs is part of its own
/// configuration; nothing is passed per call.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    /// The error type returned in the event that loading a credential fails
    type Error: error::Error + Send + Sync + 'static;

    /// Loads a fresh credential
    async fn load_credential(&self) -> Result<Credential, Self::Error>;
}

#[async_trait]
impl<L> CredentialLoader for Arc<L>
where
    L: CredentialLoader + ?Sized,
{
    type Error = L::Error;

    async fn load_credential(&self) -> Result<Credential, Self::Error> {
        (**self).load_credential().await
    }
}

/// A loader that always produces the same credential
#[derive(Clone, Debug)]
pub struct ConstCredentialLoader {
    credential: Credential,
}

impl ConstCredentialLoader {
    /// Constructs a loader that hands out `credential` on every call
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialLoader for ConstCredentialLoader {
    type Error = Infallible;

    async fn load_credential(&self) -> Result<Credential, Self::Error> {
        Ok(self.credential.clone())
    }
}

/// A loader backed by an asynchronous closure
///
/// Constructed with [`from_fn()`].
pub struct FnLoader<F> {
    load: F,
}

impl<F> fmt::Debug for FnLoader<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnLoader").finish_non_exhaustive()
    }
}

/// Wraps a closure returning a future into a [`CredentialLoader`]
pub fn from_fn<F, Fut, E>(load: F) -> FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Credential, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    FnLoader { load }
}

#[async_trait]
impl<F, Fut, E> CredentialLoader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Credential, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn load_credential(&self) -> Result<Credential, Self::Error> {
        (self.load)().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn const_loader_repeats_its_credential() {
        let loader = ConstCredentialLoader::new(Credential::new("abc", "https://cpq"));

        let first = loader.load_credential().await.unwrap();
        let second = loader.load_credential().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.access_token().as_str(), "abc");
    }

    #[tokio::test]
    async fn closure_loader_is_invoked_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = Arc::new(from_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, Infallible>(Credential::new(format!("token-{}", n), "https://cpq")) }
        }));

        assert_eq!(
            loader.load_credential().await.unwrap().access_token().as_str(),
            "token-1"
        );
        assert_eq!(
            loader.load_credential().await.unwrap().access_token().as_str(),
            "token-2"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
