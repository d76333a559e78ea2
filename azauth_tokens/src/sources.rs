//! Token sources

use std::{convert::Infallible, error, sync::Arc};

use async_trait::async_trait;
use azauth_clock::{Clock, DurationSecs, System};

use crate::{AccessToken, TokenRequestContext, TokenWithExpiry};

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// An asynchronous source for tokens
///
/// Implementations may be slow or fail; retry and backoff policy belongs to
/// the source itself. A [`TokenCache`](crate::TokenCache) calls
/// [`request_token()`][Self::request_token()] at most once per refresh.
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token satisfying `context` from an asynchronous source
    async fn request_token(
        &self,
        context: &TokenRequestContext,
    ) -> Result<TokenWithExpiry, Self::Error>;
}

#[async_trait]
impl<S: AsyncTokenSource + ?Sized> AsyncTokenSource for Arc<S> {
    type Error = S::Error;

    async fn request_token(
        &self,
        context: &TokenRequestContext,
    ) -> Result<TokenWithExpiry, Self::Error> {
        (**self).request_token(context).await
    }
}

/// A token source that always returns the same access token
///
/// Each token handed out expires `lifetime` after it was requested.
#[derive(Debug)]
pub struct ConstTokenSource<C = System> {
    token: AccessToken,
    lifetime: DurationSecs,
    clock: C,
}

impl ConstTokenSource {
    /// Constructs a source handing out `token` with a lifetime of one hour
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: token.into(),
            lifetime: DurationSecs::from_mins(60),
            clock: System,
        }
    }
}

impl<C> ConstTokenSource<C> {
    /// Sets the lifetime of tokens handed out
    pub fn with_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ConstTokenSource<D> {
        ConstTokenSource {
            token: self.token,
            lifetime: self.lifetime,
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> AsyncTokenSource for ConstTokenSource<C> {
    type Error = Infallible;

    async fn request_token(&self, _: &TokenRequestContext) -> Result<TokenWithExpiry, Self::Error> {
        Ok(TokenWithExpiry::expiring_in(
            self.token.clone(),
            self.lifetime,
            &self.clock,
        ))
    }
}

#[cfg(test)]
mod tests {
    use azauth_clock::{TestClock, UnixTime};

    use super::*;

    #[tokio::test]
    async fn const_source_expires_relative_to_its_clock() {
        let clock = TestClock::new(UnixTime(1_000));
        let source = ConstTokenSource::new(AccessToken::from_static("fixed"))
            .with_lifetime(DurationSecs(120))
            .with_clock(clock.clone());
        let context = TokenRequestContext::new(["api://test/.default"]);

        let first = source.request_token(&context).await.unwrap();
        clock.advance(DurationSecs(60));
        let second = Arc::new(source).request_token(&context).await.unwrap();

        assert_eq!(first.access_token().as_str(), "fixed");
        assert_eq!(first.expiry(), UnixTime(1_120));
        assert_eq!(second.expiry(), UnixTime(1_180));
    }
}
