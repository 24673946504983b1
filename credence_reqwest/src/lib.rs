//! Middleware to automatically attach cached credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to authorize
//! each outbound request with the access token currently held by a
//! [`CredentialCache`].
//!
//! If a request already has an `Authorization` header by the time the
//! middleware executes, the existing value is left in place and the cache is
//! not consulted.
//!
//! When the remote side answers `401 Unauthorized` to a request the middleware
//! authorized, the token is assumed to have been revoked or expired early,
//! unless the bearer challenge in `WWW-Authenticate` names some other error.
//! The middleware asks the cache to [`renew()`](CredentialCache::renew) and,
//! if the request can be cloned, sends it once more with the renewed token.
//!
//! ```
//! use credence::{loader::ConstCredentialLoader, Credential, CredentialCache};
//! use credence_reqwest::AccessTokenMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let cache = CredentialCache::new(ConstCredentialLoader::new(Credential::new(
//!     "token",
//!     "https://example.com",
//! )));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(cache))
//!     .build();
//!
//! let req = client.get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! Which requests receive a token can be narrowed with predicates, which
//! compose with the combinators from the [`predicates`] crate. A middleware can
//! also be restricted to requests aimed at the endpoint named by the credential
//! itself, or to requests that opt in by carrying a marker header.
//!
//! ```
//! use credence_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//! # use credence::{loader::ConstCredentialLoader, Credential, CredentialCache};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let cache = CredentialCache::new(ConstCredentialLoader::new(Credential::new("token", "https://example.com")));
//!
//! AccessTokenMiddleware::new(cache)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")))
//!     .restricted_to_endpoint()
//!     .with_marker(reqwest::header::HeaderName::from_static("x-use-access-token"));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use credence::{CacheError, Credential, CredentialCache};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;

/// Reasons the middleware could not authorize a request
#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// The cache could not provide a credential
    #[error("unable to obtain a credential")]
    Credential(#[from] CacheError),
    /// The access token contains bytes that are not allowed in a header
    #[error("access token cannot be used as a header value")]
    InvalidToken(#[from] header::InvalidHeaderValue),
}

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    cache: CredentialCache,
    predicate: P,
    retry_unauthorized: bool,
    endpoint_only: bool,
    marker: Option<header::HeaderName>,
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a credential cache
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(cache: CredentialCache) -> Self {
        Self {
            cache,
            predicate: HttpsOnly,
            retry_unauthorized: true,
            endpoint_only: false,
            marker: None,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            cache: self.cache,
            predicate,
            retry_unauthorized: self.retry_unauthorized,
            endpoint_only: self.endpoint_only,
            marker: self.marker,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Only attach the token to requests whose URL starts with the
    /// credential's endpoint
    #[must_use]
    pub fn restricted_to_endpoint(mut self) -> Self {
        self.endpoint_only = true;
        self
    }

    /// Only attach the token to requests that carry the `marker` header
    ///
    /// The marker never leaves the client: it is removed from every request
    /// passing through the middleware.
    #[must_use]
    pub fn with_marker(mut self, marker: header::HeaderName) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Renew the credential on `401 Unauthorized`, but do not resend the
    /// request
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry_unauthorized = false;
        self
    }

    fn authorization(&self, credential: &Credential) -> std::result::Result<header::HeaderValue, AuthorizationError> {
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                credential.status = ?self.cache.status(credential),
                credential.endpoint = %credential.endpoint(),
                credential.expires_at = credential.expires_at().map(|t| t.0),
                "obtained credential"
            );
        }

        let token = credential.access_token().as_str();
        let mut header_value = BytesMut::with_capacity(token.len() + 7);
        header_value.put_slice(b"Bearer ");
        header_value.put_slice(token.as_bytes());
        let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn authorize(&self, req: &mut Request) -> std::result::Result<bool, AuthorizationError> {
        let credential = self.cache.credential().await?;

        if self.endpoint_only && !req.url().as_str().starts_with(credential.endpoint().as_str()) {
            tracing::trace!(
                url = %req.url(),
                endpoint = %credential.endpoint(),
                "request is not aimed at the credential's endpoint"
            );
            return Ok(false);
        }

        let value = self.authorization(&credential)?;
        req.headers_mut().insert(header::AUTHORIZATION, value);
        Ok(true)
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let marked = match &self.marker {
            Some(marker) => req.headers_mut().remove(marker).is_some(),
            None => true,
        };

        if !marked
            || !self.predicate.eval(&req)
            || req.headers().contains_key(header::AUTHORIZATION)
        {
            return next.run(req, extensions).await;
        }

        let retry = if self.retry_unauthorized {
            req.try_clone()
        } else {
            None
        };

        if !self
            .authorize(&mut req)
            .await
            .map_err(reqwest_middleware::Error::middleware)?
        {
            return next.run(req, extensions).await;
        }

        let response = next.clone().run(req, extensions).await?;
        if !token_rejected(&response) {
            return Ok(response);
        }

        tracing::debug!(url = %response.url(), "access token rejected, renewing credential");
        self.cache.renew();

        let mut retry = match retry {
            Some(retry) => retry,
            None => return Ok(response),
        };

        self.authorize(&mut retry)
            .await
            .map_err(reqwest_middleware::Error::middleware)?;
        next.run(retry, extensions).await
    }
}

/// Whether the server refused the access token itself
///
/// A `401` whose bearer challenge names an error other than `invalid_token`
/// (for example `insufficient_scope`) will not be cured by a new token.
fn token_rejected(response: &Response) -> bool {
    if response.status() != StatusCode::UNAUTHORIZED {
        return false;
    }

    response
        .headers()
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|challenge| challenge.to_str().ok())
        .all(|challenge| challenge_error(challenge).map_or(true, |error| error == "invalid_token"))
}

/// Extracts the `error` parameter of a bearer challenge
fn challenge_error(challenge: &str) -> Option<&str> {
    let start = challenge.find("error=")? + "error=".len();
    challenge[start..]
        .trim_start_matches('"')
        .split(|c| c == '"' || c == ',')
        .next()
}

fn explain<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    expected: bool,
    result: bool,
    observed: &'static str,
    value: &str,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(observed, value.to_owned()))
    })
}

/// Matches requests sent over HTTPS
///
/// This is the default for [`AccessTokenMiddleware`], so that tokens are never
/// sent in the clear.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case<'_>> {
        explain(self, expected, self.eval(req), "url.scheme", req.url().scheme())
    }
}

impl reflection::PredicateReflection for HttpsOnly {}

impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request uses https")
    }
}

/// Matches requests addressed to one host, compared exactly
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Matches requests whose URL host is `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&*self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case<'_>> {
        let host = req.url().host_str().unwrap_or("<none>");
        explain(self, expected, self.eval(req), "url.host", host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}

impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request host is {}", self.host)
    }
}
