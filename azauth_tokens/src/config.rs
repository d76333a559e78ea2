//! Tuning for when cached tokens are refreshed

use std::time::Duration;

use azauth_clock::DurationSecs;

/// Configuration for how a [`TokenCache`](crate::TokenCache) schedules refreshes
#[derive(Clone, Debug)]
pub struct TokenCacheConfig {
    refresh_offset: DurationSecs,
    cooldown: DurationSecs,
    max_stale_wait: Duration,
}

impl Default for TokenCacheConfig {
    /// Default refresh configuration
    ///
    /// Tokens enter their refresh window 5 minutes before expiry, and the
    /// credential source is contacted at most once every 30 seconds outside of
    /// forced refreshes. A caller holding a valid but stale token waits up to
    /// 5 seconds for the background refresh before using the stale token.
    fn default() -> Self {
        Self {
            refresh_offset: DurationSecs::from_mins(5),
            cooldown: DurationSecs(30),
            max_stale_wait: Duration::from_secs(5),
        }
    }
}

impl TokenCacheConfig {
    /// Constructs a new refresh configuration
    pub fn new(
        refresh_offset: DurationSecs,
        cooldown: DurationSecs,
        max_stale_wait: Duration,
    ) -> Self {
        Self {
            refresh_offset,
            cooldown,
            max_stale_wait,
        }
    }

    /// Sets how long before expiry a token becomes eligible for a proactive refresh
    pub fn with_refresh_offset(mut self, refresh_offset: DurationSecs) -> Self {
        self.refresh_offset = refresh_offset;
        self
    }

    /// Sets the minimum interval between refresh attempts
    pub fn with_cooldown(mut self, cooldown: DurationSecs) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets how long a caller holding a still-valid token waits on a proactive refresh
    ///
    /// A zero wait makes proactive refreshes purely background work.
    pub fn with_max_stale_wait(mut self, max_stale_wait: Duration) -> Self {
        self.max_stale_wait = max_stale_wait;
        self
    }

    /// How long before expiry a token becomes eligible for a proactive refresh
    #[inline]
    pub fn refresh_offset(&self) -> DurationSecs {
        self.refresh_offset
    }

    /// The minimum interval between refresh attempts
    #[inline]
    pub fn cooldown(&self) -> DurationSecs {
        self.cooldown
    }

    /// The longest a caller holding a still-valid token waits on a proactive refresh
    #[inline]
    pub fn max_stale_wait(&self) -> Duration {
        self.max_stale_wait
    }
}
