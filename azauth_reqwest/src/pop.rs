use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use azauth_clock::{Clock, System};
use azauth_tokens::{AsyncTokenSource, TokenCache, TokenRequestContext};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};

use crate::{
    authorization_value, challenge_parameter, ensure_secure_transport, trace_token,
    AuthPolicyError,
};

const POP_SCHEME: &str = "PoP";

/// A middleware that authorizes requests with proof-of-possession tokens
///
/// The server dictates a nonce through `WWW-Authenticate: PoP nonce="..."`
/// challenges, which this middleware remembers and binds, along with the
/// request's method and URL, into the token context for every subsequent
/// request. Until a nonce has been observed, requests are sent without
/// authorization so that the server can issue its first challenge.
///
/// A `401 Unauthorized` response carrying a new nonce causes exactly one retry
/// with a freshly requested token. Requests whose body cannot be replayed are
/// not retried.
///
/// The token cache is keyed on scopes and claims only. A token bound to one
/// method and URL is reused for later requests to other targets until the
/// server rejects it with a new nonce, at the cost of one extra round trip per
/// such rejection.
pub struct PopTokenMiddleware<S: AsyncTokenSource, C = System> {
    cache: TokenCache<S, C>,
    context: TokenRequestContext,
    nonce: ArcSwapOption<String>,
}

impl<S: AsyncTokenSource, C> PopTokenMiddleware<S, C> {
    /// Construct a new middleware requesting tokens for `context`
    ///
    /// Any proof-of-possession binding already present on `context` is
    /// replaced on each request.
    pub fn new(cache: TokenCache<S, C>, context: TokenRequestContext) -> Self {
        Self {
            cache,
            context,
            nonce: ArcSwapOption::empty(),
        }
    }

    /// The nonce most recently issued by the server, if any
    pub fn current_nonce(&self) -> Option<Arc<String>> {
        self.nonce.load_full()
    }

    /// The cache tokens are obtained from
    pub fn token_cache(&self) -> &TokenCache<S, C> {
        &self.cache
    }

    fn record_nonce(&self, nonce: String) {
        tracing::debug!(nonce = %nonce, "server issued a new proof-of-possession nonce");
        self.nonce.store(Some(Arc::new(nonce)));
    }
}

impl<S, C> PopTokenMiddleware<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn authorize(
        &self,
        req: &mut Request,
        nonce: &str,
        force_refresh: bool,
    ) -> std::result::Result<(), AuthPolicyError> {
        let context = self.context.clone().with_proof_of_possession(
            nonce,
            req.method().as_str(),
            req.url().as_str(),
        );

        let token = self.cache.get_token(&context, force_refresh).await?;
        trace_token(&token, self.cache.config().refresh_offset());

        req.headers_mut().insert(
            header::AUTHORIZATION,
            authorization_value(POP_SCHEME, token.access_token())?,
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S, C> Middleware for PopTokenMiddleware<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        ensure_secure_transport(&req)?;
        let retry = req.try_clone();

        match self.nonce.load_full() {
            Some(nonce) => self.authorize(&mut req, &nonce, false).await?,
            None => tracing::trace!("no nonce observed yet, sending request without a token"),
        }

        let resp = next.clone().run(req, extensions).await?;
        let issued_nonce = challenge_parameter(&resp, POP_SCHEME, "nonce");

        if resp.status() != StatusCode::UNAUTHORIZED {
            if let Some(nonce) = issued_nonce {
                self.record_nonce(nonce);
            }
            return Ok(resp);
        }

        let Some(nonce) = issued_nonce else {
            return Ok(resp);
        };
        self.record_nonce(nonce.clone());

        let Some(mut retry) = retry else {
            tracing::debug!("nonce challenge received, but request cannot be replayed");
            return Ok(resp);
        };

        self.authorize(&mut retry, &nonce, true).await?;
        let resp = next.run(retry, extensions).await?;

        if let Some(nonce) = challenge_parameter(&resp, POP_SCHEME, "nonce") {
            self.record_nonce(nonce);
        }

        Ok(resp)
    }
}

impl<S, C> fmt::Debug for PopTokenMiddleware<S, C>
where
    S: AsyncTokenSource + fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopTokenMiddleware")
            .field("cache", &self.cache)
            .field("context", &self.context)
            .field("nonce", &self.nonce.load_full())
            .finish()
    }
}
