use std::fmt;

use azauth_clock::{Clock, System};
use azauth_tokens::{AsyncTokenSource, TokenCache, TokenRequestContext};
use base64::{engine::general_purpose::STANDARD, Engine};
use predicates::{constant::BooleanPredicate, prelude::*};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};

use crate::{
    authorization_value, challenge_parameter, ensure_secure_transport, trace_token,
    AuthPolicyError,
};

/// A middleware that injects a bearer access token into outgoing requests
///
/// Tokens are obtained from a shared [`TokenCache`] for a fixed request
/// context. When the server rejects a token with a `Bearer` challenge that
/// carries a `claims` parameter, as issued under continuous access evaluation,
/// the request is retried once with a token that satisfies those claims.
/// Requests whose body cannot be replayed are never retried.
pub struct AccessTokenMiddleware<S: AsyncTokenSource, C = System, P = BooleanPredicate> {
    cache: TokenCache<S, C>,
    context: TokenRequestContext,
    predicate: P,
}

impl<S: AsyncTokenSource, C> AccessTokenMiddleware<S, C> {
    /// Construct a new middleware requesting tokens for `context`
    ///
    /// By default, a token is attached to every request. To change this
    /// behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(cache: TokenCache<S, C>, context: TokenRequestContext) -> Self {
        Self {
            cache,
            context,
            predicate: predicate::always(),
        }
    }
}

impl<S: AsyncTokenSource, C, P> AccessTokenMiddleware<S, C, P> {
    /// Replaces the current predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<S, C, Q> {
        AccessTokenMiddleware {
            cache: self.cache,
            context: self.context,
            predicate,
        }
    }

    /// The cache tokens are obtained from
    pub fn token_cache(&self) -> &TokenCache<S, C> {
        &self.cache
    }
}

impl<S, C, P> AccessTokenMiddleware<S, C, P>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn authorize(
        &self,
        req: &mut Request,
        context: &TokenRequestContext,
        force_refresh: bool,
    ) -> std::result::Result<(), AuthPolicyError> {
        let token = self.cache.get_token(context, force_refresh).await?;
        trace_token(&token, self.cache.config().refresh_offset());

        req.headers_mut().insert(
            header::AUTHORIZATION,
            authorization_value("Bearer", token.access_token())?,
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S, C, P> Middleware for AccessTokenMiddleware<S, C, P>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        ensure_secure_transport(&req)?;
        let retry = req.try_clone();

        self.authorize(&mut req, &self.context, false).await?;
        let resp = next.clone().run(req, extensions).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(claims) = challenge_parameter(&resp, "Bearer", "claims").and_then(decode_claims)
        else {
            return Ok(resp);
        };

        let Some(mut retry) = retry else {
            tracing::debug!("claims challenge received, but request cannot be replayed");
            return Ok(resp);
        };

        tracing::debug!("claims challenge received, retrying with a new token");
        let context = self.context.clone().with_claims(claims);
        self.authorize(&mut retry, &context, true).await?;

        next.run(retry, extensions).await
    }
}

fn decode_claims(encoded: String) -> Option<String> {
    let decoded = STANDARD
        .decode(&encoded)
        .map_err(|error| tracing::debug!(%error, "claims challenge is not valid base64"))
        .ok()?;

    String::from_utf8(decoded)
        .map_err(|error| tracing::debug!(%error, "claims challenge is not valid UTF-8"))
        .ok()
}

impl<S, C, P> Clone for AccessTokenMiddleware<S, C, P>
where
    S: AsyncTokenSource,
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            context: self.context.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S, C, P> fmt::Debug for AccessTokenMiddleware<S, C, P>
where
    S: AsyncTokenSource + fmt::Debug,
    C: fmt::Debug,
    P: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("cache", &self.cache)
            .field("context", &self.context)
            .field("predicate", &self.predicate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use azauth_tokens::{sources::ConstTokenSource, TokenCacheConfig};
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;
    use crate::test_util::{RecordingSource, ScriptedServer};

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";
    const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

    const CLAIMS: &str = r#"{"access_token":{"nbf":{"essential":true,"value":"1726258122"}}}"#;
    const CLAIMS_CHALLENGE: &str = r#"Bearer realm="", authorization_uri="https://login.microsoftonline.com/common/oauth2/authorize", error="insufficient_claims", claims="eyJhY2Nlc3NfdG9rZW4iOnsibmJmIjp7ImVzc2VudGlhbCI6dHJ1ZSwidmFsdWUiOiIxNzI2MjU4MTIyIn19fQ==""#;

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    fn prepare_middleware() -> AccessTokenMiddleware<ConstTokenSource> {
        let cache = TokenCache::new(
            ConstTokenSource::new(TEST_TOKEN),
            TokenCacheConfig::default(),
        );

        AccessTokenMiddleware::new(cache, TokenRequestContext::new([VAULT_SCOPE]))
    }

    #[test]
    fn claims_constant_matches_challenge() {
        let encoded = crate::parse_challenge_parameter(CLAIMS_CHALLENGE, "Bearer", "claims");
        assert_eq!(encoded.and_then(decode_claims).as_deref(), Some(CLAIMS));
    }

    #[test]
    fn invalid_base64_claims_are_ignored() {
        assert_eq!(decode_claims("not base64!".to_owned()), None);
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_on_https_request() {
            let middleware = prepare_middleware();
            let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn middleware_rejects_plain_http_request() {
            let middleware = prepare_middleware();
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let err = client.get("http://example.com").send().await.unwrap_err();

            match err {
                reqwest_middleware::Error::Middleware(err) => assert!(matches!(
                    err.downcast_ref::<AuthPolicyError>(),
                    Some(AuthPolicyError::InsecureTransport { .. })
                )),
                other => panic!("expected middleware error, got {:?}", other),
            }
            assert!(!auth_checker.checked.load(Ordering::Acquire));
        }

        mod and_predicate_evaluates_to_attach {
            use super::*;

            #[tokio::test]
            async fn middleware_attaches_access_token() {
                let middleware =
                    prepare_middleware().with_predicate(crate::ExactHostMatch::new("example.com"));
                let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let middleware = prepare_middleware().with_predicate(predicate::never());
                let auth_checker = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("http://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            const OVERRIDE_TOKEN: &str = "overridden!";
            // Reqwest uses a capital `B` bearer
            const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

            let middleware = prepare_middleware();
            let auth_checker = Arc::new(AuthChecker::new(BEARER_OVERRIDE_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth(OVERRIDE_TOKEN)
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }
    }

    mod when_server_responds_with_a_challenge {
        use super::*;

        fn client_for(
            source: Arc<RecordingSource>,
            server: Arc<ScriptedServer>,
        ) -> reqwest_middleware::ClientWithMiddleware {
            let cache = TokenCache::new(source, TokenCacheConfig::default());
            ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(
                    cache,
                    TokenRequestContext::new([VAULT_SCOPE]),
                ))
                .with_arc(server)
                .build()
        }

        #[tokio::test]
        async fn claims_challenge_is_retried_once_with_forced_token() {
            let source = Arc::new(RecordingSource::default());
            let server = Arc::new(ScriptedServer::new([(401, Some(CLAIMS_CHALLENGE))]));
            let client = client_for(source.clone(), server.clone());

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(
                server.authorizations(),
                [
                    Some("Bearer token-1".to_owned()),
                    Some("Bearer token-2".to_owned())
                ]
            );

            let contexts = source.contexts();
            assert_eq!(contexts.len(), 2);
            assert_eq!(contexts[0].claims(), None);
            assert_eq!(contexts[1].claims(), Some(CLAIMS));
            assert_eq!(contexts[1].scopes(), [VAULT_SCOPE]);
        }

        #[tokio::test]
        async fn repeated_claims_challenge_is_returned() {
            let source = Arc::new(RecordingSource::default());
            let server = Arc::new(ScriptedServer::new([
                (401, Some(CLAIMS_CHALLENGE)),
                (401, Some(CLAIMS_CHALLENGE)),
            ]));
            let client = client_for(source.clone(), server.clone());

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert_eq!(server.authorizations().len(), 2);
            assert_eq!(source.calls(), 2);
        }

        #[tokio::test]
        async fn challenge_without_claims_is_returned() {
            let source = Arc::new(RecordingSource::default());
            let server = Arc::new(ScriptedServer::new([(
                401,
                Some(r#"Bearer error="invalid_token""#),
            )]));
            let client = client_for(source.clone(), server.clone());

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert_eq!(server.authorizations().len(), 1);
            assert_eq!(source.calls(), 1);
        }
    }
}
