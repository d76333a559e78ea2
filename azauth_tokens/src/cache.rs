use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use azauth_clock::{Clock, DurationSecs, System, UnixTime};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    context::{InvalidRequest, RequestKey},
    sources::AsyncTokenSource,
    TokenCacheConfig, TokenRequestContext, TokenStatus, TokenWithExpiry,
};

/// The published result of a single fetch
type Outcome<E> = Result<TokenWithExpiry, Arc<E>>;

/// An error obtaining a token from a [`TokenCache`]
#[derive(Debug, Error)]
pub enum TokenCacheError<E: error::Error + 'static> {
    /// The token request was malformed
    #[error("invalid token request")]
    InvalidRequest(#[from] InvalidRequest),
    /// The credential source failed to produce a token
    ///
    /// Every caller waiting on the same fetch receives the same error.
    #[error("credential source failed to produce a token")]
    CredentialFailure(#[source] Arc<E>),
    /// The fetch ended without publishing a result, such as when its task was cancelled
    #[error("token refresh ended before publishing a result")]
    RefreshAbandoned,
    /// The credential source produced a token that had already expired
    #[error("credential source returned a token that expired at {}", expiry.0)]
    ExpiredToken {
        /// The expiry of the rejected token
        expiry: UnixTime,
    },
}

/// A single-flight cache in front of a credential source
///
/// The cache holds at most one token. Concurrent callers that need a new token
/// share one fetch from the source; a fresh token is served without contacting
/// the source at all, and a token nearing expiry is refreshed proactively while
/// remaining usable if that refresh fails. Outside of forced refreshes, the
/// source is contacted at most once per configured cooldown.
///
/// Clones share the same cached state.
pub struct TokenCache<S: AsyncTokenSource, C = System> {
    shared: Arc<Shared<S, C>>,
}

struct Shared<S: AsyncTokenSource, C> {
    source: S,
    clock: C,
    config: TokenCacheConfig,
    state: Mutex<CacheState<S::Error>>,
}

struct CacheState<E> {
    cached: Option<CachedToken>,
    next_allowed_refresh: UnixTime,
    in_flight: Option<InFlight<E>>,
    next_fetch_id: u64,
}

struct CachedToken {
    token: TokenWithExpiry,
    key: RequestKey,
}

struct InFlight<E> {
    id: u64,
    forced: bool,
    key: RequestKey,
    outcome: watch::Receiver<Option<Outcome<E>>>,
}

impl<E> InFlight<E> {
    /// The fetch task went away without clearing its slot
    fn is_abandoned(&self) -> bool {
        self.outcome.has_changed().is_err()
    }

    /// Whether this fetch produces what the caller asked for
    fn satisfies(&self, key: &RequestKey, forced: bool) -> bool {
        self.key == *key && (self.forced || !forced)
    }
}

enum Step<E> {
    /// Hand out this token immediately
    Serve(TokenWithExpiry),
    /// Wait for the fetch and report its outcome
    Await(watch::Receiver<Option<Outcome<E>>>),
    /// Wait a bounded time for the fetch, otherwise keep using the still-valid token
    Fallback {
        outcome: watch::Receiver<Option<Outcome<E>>>,
        cached: TokenWithExpiry,
    },
    /// Wait for an unsuitable fetch to finish, then decide again
    Reevaluate(watch::Receiver<Option<Outcome<E>>>),
}

impl<S: AsyncTokenSource + 'static> TokenCache<S, System> {
    /// Constructs a new cache in front of `source`
    pub fn new(source: S, config: TokenCacheConfig) -> Self {
        Self::new_with_clock(source, config, System)
    }
}

impl<S, C> TokenCache<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new cache using the given clock
    pub fn new_with_clock(source: S, config: TokenCacheConfig, clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                clock,
                config,
                state: Mutex::new(CacheState {
                    cached: None,
                    next_allowed_refresh: UnixTime::default(),
                    in_flight: None,
                    next_fetch_id: 0,
                }),
            }),
        }
    }

    /// Obtains a valid token for `context`
    ///
    /// With `force_refresh`, a new token is requested from the source even if
    /// the cached token is still fresh; use this after the server rejects a
    /// token with an authentication challenge. Errors from a forced refresh are
    /// returned to the caller, but never evict the cached token.
    ///
    /// Must be called within a Tokio runtime, as fetches run on spawned tasks.
    /// Dropping the returned future does not cancel a fetch that other callers
    /// may be waiting on.
    pub async fn get_token(
        &self,
        context: &TokenRequestContext,
        force_refresh: bool,
    ) -> Result<TokenWithExpiry, TokenCacheError<S::Error>> {
        context.validate()?;
        let key = context.key();

        loop {
            match self.evaluate(context, &key, force_refresh) {
                Step::Serve(token) => return Ok(token),
                Step::Await(outcome) => {
                    let token = wait_for_outcome(outcome)
                        .await?
                        .map_err(TokenCacheError::CredentialFailure)?;

                    if token.is_expired_at(self.shared.clock.now()) {
                        return Err(TokenCacheError::ExpiredToken {
                            expiry: token.expiry(),
                        });
                    }
                    return Ok(token);
                }
                Step::Fallback { outcome, cached } => {
                    return Ok(self.await_or_fall_back(outcome, cached).await);
                }
                Step::Reevaluate(outcome) => {
                    let _ = wait_for_outcome(outcome).await;
                    tracing::trace!("in-flight refresh completed, re-evaluating");
                }
            }
        }
    }

    /// Gets the most recently obtained token without contacting the source
    ///
    /// The token may be stale or expired.
    pub fn cached_token(&self) -> Option<TokenWithExpiry> {
        self.shared
            .lock_state()
            .cached
            .as_ref()
            .map(|c| c.token.clone())
    }

    /// The configuration used by this cache
    pub fn config(&self) -> &TokenCacheConfig {
        &self.shared.config
    }

    fn evaluate(
        &self,
        context: &TokenRequestContext,
        key: &RequestKey,
        force_refresh: bool,
    ) -> Step<S::Error> {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        let now = shared.clock.now();
        let refresh_offset = shared.config.refresh_offset();

        let (cached, key_changed) = match &state.cached {
            Some(c) if c.key == *key => (Some(c.token.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        let forced = force_refresh || key_changed;

        if let Some(token) = cached.as_ref().filter(|_| !forced) {
            if token.token_status_at(now, refresh_offset) == TokenStatus::Fresh {
                tracing::trace!(expiry = token.expiry().0, "serving cached token");
                return Step::Serve(token.clone());
            }
        }

        if state.in_flight.as_ref().is_some_and(InFlight::is_abandoned) {
            state.in_flight = None;
            state.next_allowed_refresh = state
                .next_allowed_refresh
                .max(now + shared.config.cooldown());
            tracing::warn!(
                next_allowed_refresh = state.next_allowed_refresh.0,
                "previous token refresh was abandoned, clearing"
            );
        }

        if let Some(flight) = &state.in_flight {
            let outcome = flight.outcome.clone();

            if !flight.satisfies(key, forced) {
                tracing::debug!(
                    in_flight.forced = flight.forced,
                    forced,
                    "in-flight refresh does not satisfy request, waiting to re-evaluate"
                );
                return Step::Reevaluate(outcome);
            }

            tracing::trace!(in_flight.forced = flight.forced, "joining in-flight refresh");
            return match cached {
                Some(cached) if !forced && !cached.is_expired_at(now) => {
                    Step::Fallback { outcome, cached }
                }
                _ => Step::Await(outcome),
            };
        }

        if forced {
            tracing::debug!(force_refresh, key_changed, "forcing token refresh");
            return Step::Await(self.start_fetch(&mut state, context, key, true, None));
        }

        match cached {
            Some(cached) if !cached.is_expired_at(now) => {
                if now >= state.next_allowed_refresh {
                    tracing::debug!(
                        expiry = cached.expiry().0,
                        until_expired = cached.until_expired_at(now).0,
                        "token inside refresh window, refreshing"
                    );
                    let outcome = self.start_fetch(&mut state, context, key, false, None);
                    Step::Fallback { outcome, cached }
                } else {
                    tracing::trace!(
                        next_allowed_refresh = state.next_allowed_refresh.0,
                        "token inside refresh window, but refresh is cooling down"
                    );
                    Step::Serve(cached)
                }
            }
            _ => {
                let delay = if now < state.next_allowed_refresh {
                    Some(state.next_allowed_refresh - now)
                } else {
                    None
                };
                tracing::debug!(
                    has_expired_token = cached.is_some(),
                    delay = delay.map(|d| d.0),
                    "no usable token, fetching"
                );
                Step::Await(self.start_fetch(&mut state, context, key, false, delay))
            }
        }
    }

    /// Claims the in-flight slot and spawns the fetch
    ///
    /// Must be called with the state lock held so that no other caller can claim
    /// the slot between the decision to fetch and the claim.
    fn start_fetch(
        &self,
        state: &mut CacheState<S::Error>,
        context: &TokenRequestContext,
        key: &RequestKey,
        forced: bool,
        delay: Option<DurationSecs>,
    ) -> watch::Receiver<Option<Outcome<S::Error>>> {
        let (tx, rx) = watch::channel(None);

        let id = state.next_fetch_id;
        state.next_fetch_id = state.next_fetch_id.wrapping_add(1);
        state.in_flight = Some(InFlight {
            id,
            forced,
            key: key.clone(),
            outcome: rx.clone(),
        });

        let shared = Arc::clone(&self.shared);
        let context = context.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let outcome = shared.fetch(id, &context, key, delay).await;
            tx.send_replace(Some(outcome));
        });

        rx
    }

    async fn await_or_fall_back(
        &self,
        outcome: watch::Receiver<Option<Outcome<S::Error>>>,
        cached: TokenWithExpiry,
    ) -> TokenWithExpiry {
        let max_wait = self.shared.config.max_stale_wait();

        match tokio::time::timeout(max_wait, wait_for_outcome(outcome)).await {
            Ok(Ok(Ok(token))) if !token.is_expired_at(self.shared.clock.now()) => token,
            Ok(Ok(Ok(token))) => {
                tracing::warn!(
                    expiry = token.expiry().0,
                    "proactive token refresh produced an expired token, using cached token"
                );
                cached
            }
            Ok(Ok(Err(error))) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    expiry = cached.expiry().0,
                    "proactive token refresh failed, using cached token"
                );
                cached
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "proactive token refresh abandoned, using cached token"
                );
                cached
            }
            Err(_) => {
                tracing::debug!(
                    max_wait_ms = max_wait.as_millis() as u64,
                    "proactive token refresh still in flight, using cached token"
                );
                cached
            }
        }
    }
}

impl<S: AsyncTokenSource, C: Clock> Shared<S, C> {
    fn lock_state(&self) -> MutexGuard<'_, CacheState<S::Error>> {
        // The state is consistent at every unlock, so a panic elsewhere cannot corrupt it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(
        &self,
        id: u64,
        context: &TokenRequestContext,
        key: RequestKey,
        delay: Option<DurationSecs>,
    ) -> Outcome<S::Error> {
        if let Some(delay) = delay {
            tracing::debug!(delay = delay.0, "waiting out refresh cooldown");
            tokio::time::sleep(delay.into()).await;
        }

        tracing::debug!("requesting new token");
        let result = self.source.request_token(context).await.map_err(Arc::new);
        let now = self.clock.now();

        let mut state = self.lock_state();
        state.next_allowed_refresh = state
            .next_allowed_refresh
            .max(now + self.config.cooldown());

        match &result {
            Ok(token) if token.is_expired_at(now) => {
                tracing::warn!(
                    expiry = token.expiry().0,
                    "credential source returned an expired token, not caching"
                );
            }
            Ok(token) => {
                tracing::debug!(
                    expiry = token.expiry().0,
                    next_allowed_refresh = state.next_allowed_refresh.0,
                    "obtained new token"
                );
                state.cached = Some(CachedToken {
                    token: token.clone(),
                    key,
                });
            }
            Err(error) => {
                tracing::warn!(
                    error = (&**error as &dyn error::Error),
                    next_allowed_refresh = state.next_allowed_refresh.0,
                    "error requesting token"
                );
            }
        }

        if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
        }

        result
    }
}

async fn wait_for_outcome<E: error::Error + 'static>(
    mut outcome: watch::Receiver<Option<Outcome<E>>>,
) -> Result<Outcome<E>, TokenCacheError<E>> {
    let published = match outcome.wait_for(Option::is_some).await {
        Ok(published) => (*published).clone(),
        Err(_) => None,
    };

    published.ok_or(TokenCacheError::RefreshAbandoned)
}

impl<S: AsyncTokenSource, C> Clone for TokenCache<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, C> fmt::Debug for TokenCache<S, C>
where
    S: AsyncTokenSource + fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("source", &self.shared.source)
            .field("clock", &self.shared.clock)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
