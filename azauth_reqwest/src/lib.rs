//! Middleware to authorize outgoing requests with cached access tokens
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach a
//! bearer token obtained from a [`TokenCache`](azauth_tokens::TokenCache) to
//! each outbound request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use azauth_reqwest::AccessTokenMiddleware;
//! use azauth_tokens::{
//!     sources::ConstTokenSource, TokenCache, TokenCacheConfig, TokenRequestContext,
//! };
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let cache = TokenCache::new(ConstTokenSource::new("token"), TokenCacheConfig::default());
//! let context = TokenRequestContext::new(["https://vault.azure.net/.default"]);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(cache, context))
//!     .build();
//!
//! let req = client
//!     .get("https://example.vault.azure.net/secrets/name");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! ```
//! use azauth_reqwest::{AccessTokenMiddleware, ExactHostMatch};
//! use predicates::prelude::PredicateBooleanExt;
//! # use azauth_tokens::{
//! #     sources::ConstTokenSource, TokenCache, TokenCacheConfig, TokenRequestContext,
//! # };
//! # let cache = TokenCache::new(ConstTokenSource::new("token"), TokenCacheConfig::default());
//! # let context = TokenRequestContext::new(["https://vault.azure.net/.default"]);
//!
//! AccessTokenMiddleware::new(cache, context).with_predicate(
//!     ExactHostMatch::new("a.vault.azure.net").or(ExactHostMatch::new("b.vault.azure.net")),
//! );
//! ```
//!
//! Services that require proof-of-possession tokens use the
//! [`PopTokenMiddleware`] instead, which learns the server's nonce from its
//! `WWW-Authenticate` challenges and binds each token to the request it is
//! sent with.
//!
//! Both middlewares refuse to send credentials over anything but HTTPS.

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

use std::{error, fmt};

use azauth_clock::{Clock, DurationSecs};
use azauth_tokens::{AccessTokenRef, TokenCacheError, TokenWithExpiry};
use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use thiserror::Error;

mod bearer;
mod challenge;
mod pop;

pub use bearer::AccessTokenMiddleware;
pub use challenge::{parse_challenge_parameter, parse_challenges, Challenge, ChallengeParseError};
pub use pop::PopTokenMiddleware;

/// An error raised by an authorization middleware
#[derive(Debug, Error)]
pub enum AuthPolicyError {
    /// The request would have sent credentials over an insecure transport
    #[error("refusing to send credentials over insecure `{scheme}` transport")]
    InsecureTransport {
        /// The URL scheme of the rejected request
        scheme: String,
    },
    /// An access token could not be obtained
    #[error("unable to obtain an access token")]
    Token(#[source] Box<dyn error::Error + Send + Sync>),
    /// The access token cannot be carried in a header
    #[error("access token is not a valid header value")]
    InvalidHeaderValue(#[from] header::InvalidHeaderValue),
}

impl<E> From<TokenCacheError<E>> for AuthPolicyError
where
    E: error::Error + Send + Sync + 'static,
{
    fn from(error: TokenCacheError<E>) -> Self {
        Self::Token(Box::new(error))
    }
}

impl From<AuthPolicyError> for reqwest_middleware::Error {
    fn from(error: AuthPolicyError) -> Self {
        reqwest_middleware::Error::middleware(error)
    }
}

fn ensure_secure_transport(req: &Request) -> Result<(), AuthPolicyError> {
    match req.url().scheme() {
        "https" => Ok(()),
        scheme => Err(AuthPolicyError::InsecureTransport {
            scheme: scheme.to_owned(),
        }),
    }
}

fn authorization_value(
    scheme: &str,
    token: &AccessTokenRef,
) -> Result<header::HeaderValue, AuthPolicyError> {
    let token = token.as_str();
    let mut header_value = BytesMut::with_capacity(scheme.len() + 1 + token.len());
    header_value.put_slice(scheme.as_bytes());
    header_value.put_u8(b' ');
    header_value.put_slice(token.as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

/// Finds a challenge parameter across every `WWW-Authenticate` header of a response
fn challenge_parameter(resp: &Response, scheme: &str, parameter: &str) -> Option<String> {
    resp.headers()
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| parse_challenge_parameter(value, scheme, parameter))
}

fn trace_token(token: &TokenWithExpiry, refresh_offset: DurationSecs) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let now = azauth_clock::System.now();

        tracing::trace!(
            token.status = ?token.token_status_at(now, refresh_offset),
            token.expiry = token.expiry().0,
            token.until_expired = token.until_expired_at(now).0,
            "obtained access token"
        );
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<none>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod test_util;
