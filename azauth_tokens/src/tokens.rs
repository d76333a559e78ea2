use azauth_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};

use super::{AccessToken, AccessTokenRef};

/// An access token as issued by a credential source, with its absolute expiry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenWithExpiry {
    access_token: AccessToken,
    expiry: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but inside its refresh window and should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenWithExpiry {
    /// Constructs a token that expires at `expiry`
    pub fn new(access_token: impl Into<AccessToken>, expiry: UnixTime) -> Self {
        Self {
            access_token: access_token.into(),
            expiry,
        }
    }

    /// Constructs a token that expires `lifetime` from the current time according to `clock`
    pub fn expiring_in<C: Clock>(
        access_token: impl Into<AccessToken>,
        lifetime: DurationSecs,
        clock: &C,
    ) -> Self {
        Self::new(access_token, clock.now() + lifetime)
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the time at which the token enters its refresh window
    #[inline]
    pub fn refresh_at(&self, refresh_offset: DurationSecs) -> UnixTime {
        self.expiry - refresh_offset
    }

    /// Whether the token has expired as of `time`
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        time >= self.expiry
    }

    /// Gets the token's lifetime status according to the system clock
    #[inline]
    pub fn token_status(&self, refresh_offset: DurationSecs) -> TokenStatus {
        self.token_status_at(System.now(), refresh_offset)
    }

    /// Gets the token's lifetime status as of the provided time
    ///
    /// The token is stale once `time` is within `refresh_offset` of its expiry.
    #[inline]
    pub fn token_status_at(&self, time: UnixTime, refresh_offset: DurationSecs) -> TokenStatus {
        if self.is_expired_at(time) {
            TokenStatus::Expired
        } else if time < self.refresh_at(refresh_offset) {
            TokenStatus::Fresh
        } else {
            TokenStatus::Stale
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry - time
    }
}
