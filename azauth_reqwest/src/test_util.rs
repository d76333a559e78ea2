use std::{
    collections::VecDeque,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use azauth_clock::{Clock, DurationSecs, System};
use azauth_tokens::{AsyncTokenSource, TokenRequestContext, TokenWithExpiry};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

/// A token source that issues numbered tokens and records every request
#[derive(Debug, Default)]
pub struct RecordingSource {
    calls: AtomicUsize,
    contexts: Mutex<Vec<TokenRequestContext>>,
}

impl RecordingSource {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    pub fn contexts(&self) -> Vec<TokenRequestContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AsyncTokenSource for RecordingSource {
    type Error = Infallible;

    async fn request_token(
        &self,
        context: &TokenRequestContext,
    ) -> std::result::Result<TokenWithExpiry, Self::Error> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        self.contexts.lock().unwrap().push(context.clone());

        let token = match context.proof_of_possession() {
            Some(binding) => format!("pop-{}-{}", binding.nonce(), call),
            None => format!("token-{}", call),
        };

        Ok(TokenWithExpiry::new(
            token,
            System.now() + DurationSecs::from_mins(60),
        ))
    }
}

/// A terminal middleware that replays canned responses and records what it received
#[derive(Debug)]
pub struct ScriptedServer {
    responses: Mutex<VecDeque<(u16, Option<&'static str>)>>,
    authorizations: Mutex<Vec<Option<String>>>,
}

impl ScriptedServer {
    /// Responses given as status codes with an optional `WWW-Authenticate` value
    ///
    /// Once the script runs out, every request receives `200 OK`.
    pub fn new(responses: impl IntoIterator<Item = (u16, Option<&'static str>)>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            authorizations: Mutex::new(Vec::new()),
        }
    }

    /// The `Authorization` header of each request received, in order
    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.authorizations.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Middleware for ScriptedServer {
    async fn handle(
        &self,
        req: Request,
        _: &mut http::Extensions,
        _: Next<'_>,
    ) -> Result<Response> {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .map(|value| value.to_str().unwrap().to_owned());
        self.authorizations.lock().unwrap().push(authorization);

        let (status, challenge) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((200, None));

        let mut resp = http::Response::builder().status(status);
        if let Some(challenge) = challenge {
            resp = resp.header(header::WWW_AUTHENTICATE, challenge);
        }

        Ok(resp.body("").unwrap().into())
    }
}
