//! A token source that uses an Entra ID (Azure AD) tenant as an authority

use azauth_clock::{Clock, System};
use async_trait::async_trait;
use thiserror::Error;

use super::AsyncTokenSource;
use crate::{
    ClientId, ClientSecret, TenantId, TenantIdRef, TokenRequestContext, TokenWithExpiry,
};

pub mod dto;

/// The authority host of the Azure public cloud
pub const AZURE_PUBLIC_CLOUD: &str = "https://login.microsoftonline.com/";

/// A token source that performs the OAuth2 client credentials flow
///
/// Tokens are requested from `{authority}/{tenant}/oauth2/v2.0/token`. A tenant
/// carried by the request context takes precedence over the configured tenant.
#[derive(Debug)]
pub struct ClientCredentialsTokenSource<C = System> {
    client: reqwest::Client,
    authority: reqwest::Url,
    tenant_id: TenantId,
    credentials: dto::ClientCredentials,
    clock: C,
}

impl ClientCredentialsTokenSource {
    /// Constructs a new client credentials source
    pub fn new(
        client: reqwest::Client,
        authority: reqwest::Url,
        tenant_id: TenantId,
        client_id: ClientId,
        client_secret: ClientSecret,
    ) -> Self {
        Self {
            client,
            authority,
            tenant_id,
            credentials: dto::ClientCredentials {
                client_id,
                client_secret,
            },
            clock: System,
        }
    }
}

impl<C> ClientCredentialsTokenSource<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ClientCredentialsTokenSource<D> {
        ClientCredentialsTokenSource {
            client: self.client,
            authority: self.authority,
            tenant_id: self.tenant_id,
            credentials: self.credentials,
            clock,
        }
    }

    fn token_url(&self, context: &TokenRequestContext) -> Result<reqwest::Url, TokenRequestError> {
        let tenant = context.tenant_id().unwrap_or(&self.tenant_id);

        if !is_valid_tenant(tenant) {
            return Err(TokenRequestError::InvalidTenant(tenant.to_owned()));
        }

        self.authority
            .join(&format!("{}/oauth2/v2.0/token", tenant))
            .map_err(|_| TokenRequestError::InvalidTenant(tenant.to_owned()))
    }
}

fn is_valid_tenant(tenant: &TenantIdRef) -> bool {
    !tenant.as_str().is_empty()
        && tenant
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[async_trait]
impl<C: Clock + Send + Sync> AsyncTokenSource for ClientCredentialsTokenSource<C> {
    type Error = TokenRequestError;

    async fn request_token(
        &self,
        context: &TokenRequestContext,
    ) -> Result<TokenWithExpiry, Self::Error> {
        if context.proof_of_possession().is_some() {
            return Err(TokenRequestError::ProofOfPossessionUnsupported);
        }

        let token_url = self.token_url(context)?;
        let grant = dto::ClientCredentialsGrant {
            credentials: &self.credentials,
            context,
        };

        request_token(&self.client, token_url, &grant, &self.clock).await
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
    /// The tenant cannot be used to address the authority
    #[error("invalid tenant id: {0}")]
    InvalidTenant(TenantId),
    /// The client credentials flow cannot issue proof-of-possession tokens
    #[error("client credentials flow does not support proof-of-possession tokens")]
    ProofOfPossessionUnsupported,
}

#[tracing::instrument(
    err,
    skip(client, token_url, grant, clock),
    fields(
        token_url = %token_url,
        credentials.client_id = %grant.credentials.client_id,
        scope = %grant.context.scopes().join(" "),
        has_claims = grant.context.claims().is_some(),
    ),
)]
async fn request_token<C: Clock>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    grant: &dto::ClientCredentialsGrant<'_>,
    clock: &C,
) -> Result<TokenWithExpiry, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url)
        .form(grant)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    let token = TokenWithExpiry::expiring_in(resp.access_token.to_owned(), resp.expires_in, clock);

    tracing::info!(
        token_type = resp.token_type.as_deref().unwrap_or("Bearer"),
        lifetime = resp.expires_in.0,
        expiry = token.expiry().0,
        "received new token"
    );

    Ok(token)
}
