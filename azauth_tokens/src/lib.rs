//! Single-flight caching and proactive refresh of access tokens
//!
//! Client libraries authenticate every outbound request, but the identity
//! authority behind them is comparatively slow and rate limited. This crate
//! places a [`TokenCache`] in front of any [`AsyncTokenSource`] so that:
//!
//! * a fresh token is handed out without contacting the source;
//! * concurrent callers needing a new token share a single fetch;
//! * a token nearing expiry is refreshed proactively, and remains in use if
//!   that refresh fails;
//! * the source is contacted at most once per cooldown period, even when it is
//!   failing;
//! * callers can force a new token after the server rejects the current one.
//!
//! The decision of when a token is stale and how long to cool down after an
//! attempt is controlled by a [`TokenCacheConfig`].
//!
//! ```
//! use azauth_tokens::{
//!     sources::ConstTokenSource, TokenCache, TokenCacheConfig, TokenRequestContext,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let cache = TokenCache::new(ConstTokenSource::new("token"), TokenCacheConfig::default());
//! let context = TokenRequestContext::new(["https://vault.azure.net/.default"]);
//!
//! let token = cache.get_token(&context, false).await.unwrap();
//! assert_eq!(token.access_token().as_str(), "token");
//! # }
//! ```
//!
//! For a complete client credentials flow, refer to the `client_credentials`
//! example in this crate.
//!
//! # Features
//!
//! * `oauth2` (default): Provides a token source performing the OAuth2 _client
//!   credentials_ flow against an Entra ID (Azure AD) tenant.

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
pub mod config;
mod context;
pub mod sources;
mod tokens;

pub use braids::*;
pub use cache::{TokenCache, TokenCacheError};
pub use config::TokenCacheConfig;
pub use context::{InvalidRequest, PopBinding, TokenRequestContext};
pub use sources::AsyncTokenSource;
pub use tokens::{TokenStatus, TokenWithExpiry};
