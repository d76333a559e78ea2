//! Describing the token a caller needs

use thiserror::Error;

use crate::{TenantId, TenantIdRef};

/// The parameters of a token request
///
/// Scopes are semantically a set, but their order is preserved because some
/// credential back-ends are sensitive to it. Two contexts describe the same
/// logical request when their scopes and claims match; the tenant and any
/// proof-of-possession binding are passed through to the credential source but
/// do not affect whether a cached token can be reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRequestContext {
    scopes: Vec<String>,
    claims: Option<String>,
    tenant_id: Option<TenantId>,
    proof_of_possession: Option<PopBinding>,
}

/// Binds a proof-of-possession token to a single HTTP request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopBinding {
    nonce: String,
    method: String,
    url: String,
}

/// A malformed token request
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    /// No scopes were requested
    #[error("at least one scope must be requested")]
    EmptyScopes,
    /// One of the requested scopes was blank
    #[error("requested scopes must not be blank")]
    BlankScope,
}

/// The part of a request that decides whether a cached token may be reused
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RequestKey {
    scopes: Vec<String>,
    claims: Option<String>,
}

impl TokenRequestContext {
    /// Constructs a new request for the given scopes
    pub fn new<I>(scopes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            claims: None,
            tenant_id: None,
            proof_of_possession: None,
        }
    }

    /// Requests additional claims, such as those demanded by a claims challenge
    pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
        self.claims = Some(claims.into());
        self
    }

    /// Requests the token from a specific tenant
    pub fn with_tenant_id(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Binds the requested token to `method` and `url` using a server-issued nonce
    pub fn with_proof_of_possession(
        mut self,
        nonce: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        self.proof_of_possession = Some(PopBinding {
            nonce: nonce.into(),
            method: method.into(),
            url: url.into(),
        });
        self
    }

    /// The requested scopes, in order
    #[inline]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Additional claims requested, if any
    #[inline]
    pub fn claims(&self) -> Option<&str> {
        self.claims.as_deref()
    }

    /// The tenant to request the token from, if overridden
    #[inline]
    pub fn tenant_id(&self) -> Option<&TenantIdRef> {
        self.tenant_id.as_deref()
    }

    /// The proof-of-possession binding, if any
    #[inline]
    pub fn proof_of_possession(&self) -> Option<&PopBinding> {
        self.proof_of_possession.as_ref()
    }

    /// Whether `other` asks for the same token, ignoring tenant and binding
    pub fn is_same_request(&self, other: &Self) -> bool {
        self.scopes == other.scopes && self.claims == other.claims
    }

    /// Checks that the request can be sent to a credential source
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if self.scopes.is_empty() {
            Err(InvalidRequest::EmptyScopes)
        } else if self.scopes.iter().any(|s| s.trim().is_empty()) {
            Err(InvalidRequest::BlankScope)
        } else {
            Ok(())
        }
    }

    pub(crate) fn key(&self) -> RequestKey {
        RequestKey {
            scopes: self.scopes.clone(),
            claims: self.claims.clone(),
        }
    }
}

impl PopBinding {
    /// The server-issued nonce
    #[inline]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The HTTP method of the bound request
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The URL of the bound request
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: &str = "https://vault.azure.net/.default";

    #[test]
    fn nonce_and_tenant_do_not_change_the_logical_request() {
        let plain = TokenRequestContext::new([VAULT]);
        let bound = TokenRequestContext::new([VAULT])
            .with_tenant_id(TenantId::from_static("contoso"))
            .with_proof_of_possession("n1", "GET", "https://example.com/items");

        assert!(plain.is_same_request(&bound));
        assert_eq!(plain.key(), bound.key());
        assert_ne!(plain, bound);
    }

    #[test]
    fn claims_change_the_logical_request() {
        let plain = TokenRequestContext::new([VAULT]);
        let with_claims = plain.clone().with_claims(r#"{"access_token":{}}"#);

        assert!(!plain.is_same_request(&with_claims));
    }

    #[test]
    fn scope_order_is_preserved() {
        let ctx = TokenRequestContext::new(["b", "a"]);
        assert_eq!(ctx.scopes(), ["b", "a"]);
        assert!(!ctx.is_same_request(&TokenRequestContext::new(["a", "b"])));
    }

    #[test]
    fn empty_scopes_are_invalid() {
        let ctx = TokenRequestContext::new(Vec::<String>::new());
        assert_eq!(ctx.validate(), Err(InvalidRequest::EmptyScopes));
    }

    #[test]
    fn blank_scope_is_invalid() {
        let ctx = TokenRequestContext::new([VAULT, "  "]);
        assert_eq!(ctx.validate(), Err(InvalidRequest::BlankScope));
    }

    #[test]
    fn binding_exposes_method_url_and_nonce() {
        let ctx = TokenRequestContext::new([VAULT]).with_proof_of_possession(
            "abc123",
            "POST",
            "https://example.com/",
        );
        let pop = ctx.proof_of_possession().unwrap();

        assert_eq!(pop.nonce(), "abc123");
        assert_eq!(pop.method(), "POST");
        assert_eq!(pop.url(), "https://example.com/");
    }
}
