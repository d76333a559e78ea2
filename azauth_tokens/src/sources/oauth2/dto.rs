//! DTOs for interacting with Entra ID (Azure AD) token endpoints

use azauth_clock::DurationSecs;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{AccessTokenRef, ClientId, ClientSecret, TokenRequestContext};

/// Client credentials
#[derive(Debug)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// A client credentials grant for a specific token request
#[derive(Debug)]
pub(super) struct ClientCredentialsGrant<'a> {
    pub credentials: &'a ClientCredentials,
    pub context: &'a TokenRequestContext,
}

impl Serialize for ClientCredentialsGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsGrant", 5)?;
        ser.serialize_field("grant_type", "client_credentials")?;
        ser.serialize_field("client_id", self.credentials.client_id.as_str())?;
        ser.serialize_field("client_secret", self.credentials.client_secret.as_str())?;
        ser.serialize_field("scope", &self.context.scopes().join(" "))?;
        if let Some(claims) = self.context.claims() {
            ser.serialize_field("claims", claims)?;
        } else {
            ser.skip_field("claims")?;
        }
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse<'a> {
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(deserialize_with = "number_or_string")]
    pub expires_in: DurationSecs,
}

/// v1 endpoints report `expires_in` as a string, v2 endpoints as a number
fn number_or_string<'de, D>(deserializer: D) -> Result<DurationSecs, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lifetime {
        Number(u64),
        Text(String),
    }

    match Lifetime::deserialize(deserializer)? {
        Lifetime::Number(secs) => Ok(DurationSecs(secs)),
        Lifetime::Text(text) => text
            .trim()
            .parse()
            .map(DurationSecs)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&text), &"seconds")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_response_with_numeric_lifetime() {
        let body = r#"{"token_type":"Bearer","expires_in":3599,"ext_expires_in":3599,"access_token":"eyJ0eXAi"}"#;
        let resp: TokenResponse = serde_json::from_str(body).unwrap();

        assert_eq!(resp.access_token.as_str(), "eyJ0eXAi");
        assert_eq!(resp.token_type.as_deref(), Some("Bearer"));
        assert_eq!(resp.expires_in, DurationSecs(3599));
    }

    #[test]
    fn v1_response_with_string_lifetime() {
        let body = r#"{"token_type":"Bearer","expires_in":"3600","resource":"https://vault.azure.net","access_token":"abc"}"#;
        let resp: TokenResponse = serde_json::from_str(body).unwrap();

        assert_eq!(resp.expires_in, DurationSecs(3600));
    }

    #[test]
    fn non_numeric_lifetime_is_rejected() {
        let body = r#"{"expires_in":"soon","access_token":"abc"}"#;
        assert!(serde_json::from_str::<TokenResponse>(body).is_err());
    }

    #[test]
    fn grant_joins_scopes_and_includes_claims_only_when_present() {
        let credentials = ClientCredentials {
            client_id: ClientId::from_static("app"),
            client_secret: ClientSecret::from_static("secret"),
        };
        let context = TokenRequestContext::new(["a/.default", "b/.default"]);

        let plain = serde_json::to_value(ClientCredentialsGrant {
            credentials: &credentials,
            context: &context,
        })
        .unwrap();
        assert_eq!(plain["grant_type"], "client_credentials");
        assert_eq!(plain["scope"], "a/.default b/.default");
        assert_eq!(plain["client_secret"], "secret");
        assert!(plain.get("claims").is_none());

        let context = context.with_claims("{}");
        let with_claims = serde_json::to_value(ClientCredentialsGrant {
            credentials: &credentials,
            context: &context,
        })
        .unwrap();
        assert_eq!(with_claims["claims"], "{}");
    }
}
