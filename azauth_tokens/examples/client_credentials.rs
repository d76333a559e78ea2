use std::time::Duration;

use azauth_clock::DurationSecs;
use azauth_tokens::{
    sources::oauth2::{ClientCredentialsTokenSource, AZURE_PUBLIC_CLOUD},
    ClientId, ClientSecret, TenantId, TokenCache, TokenCacheConfig, TokenRequestContext,
    TokenStatus,
};
use clap::Parser;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The directory (tenant) to request tokens from
    #[arg(short, long, env = "AZURE_TENANT_ID")]
    tenant_id: TenantId,

    /// The client ID of the application
    #[arg(short, long, env = "AZURE_CLIENT_ID")]
    client_id: ClientId,

    /// The client secret used to identify the application to the authority
    #[arg(short = 's', long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: ClientSecret,

    /// The scope to request a token for
    #[arg(long, env, default_value = "https://management.azure.com/.default")]
    scope: String,

    /// The authority host
    #[arg(long, env = "AZURE_AUTHORITY_HOST", default_value = AZURE_PUBLIC_CLOUD)]
    authority: reqwest::Url,

    /// How long before expiry a token is refreshed, in seconds
    #[arg(long, env, default_value_t = 300)]
    refresh_offset: u64,

    /// How often to request a token, in seconds
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;

    let source = ClientCredentialsTokenSource::new(
        client,
        opts.authority,
        opts.tenant_id,
        opts.client_id,
        opts.client_secret,
    );

    let refresh_offset = DurationSecs(opts.refresh_offset);
    let config = TokenCacheConfig::default().with_refresh_offset(refresh_offset);
    let cache = TokenCache::new(source, config);
    let context = TokenRequestContext::new([opts.scope]);

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let token = match cache.get_token(&context, false).await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(error = %color_eyre::Report::new(error), "unable to obtain token");
                continue;
            }
        };

        let status = token.token_status(refresh_offset);
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(
                    ?status,
                    token = format_args!("{:#?}", token.access_token()),
                    expiry = token.expiry().0,
                    "pulled token"
                )
            }
            TokenStatus::Stale => {
                tracing::warn!(
                    ?status,
                    token = format_args!("{:#?}", token.access_token()),
                    expiry = token.expiry().0,
                    "pulled token"
                )
            }
            TokenStatus::Expired => {
                tracing::error!(?status, expiry = token.expiry().0, "pulled token")
            }
        }
    }
}
