use std::time::Duration;

use clap::Parser;
use contxt_tokens::{
    AudienceName, Audiences, AuthConfig, ClientId, ClientSecret, SessionBuilder, SessionConfig,
    SessionKind, SessionStrategy, CONTXT_AUTH_AUDIENCE,
};
use tokio::time;
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// The Contxt authorization server's base URL
    #[clap(long, env)]
    auth_host: Url,

    /// The client ID of the Contxt authorization server
    #[clap(long, env)]
    auth_client_id: ClientId,

    /// The client ID of this machine
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify this machine
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The name of the audience to request API tokens for
    #[clap(short, long, env, default_value = "facilities")]
    audience: AudienceName,

    /// The audience's client ID
    #[clap(long, env)]
    audience_client_id: ClientId,

    /// The audience's base URL
    #[clap(long, env)]
    audience_host: Url,

    /// How often to ask for the audience's token, in seconds
    #[clap(short, long, env, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let audiences = Audiences::new()
        .with_audience(
            CONTXT_AUTH_AUDIENCE,
            Some(opts.auth_client_id),
            opts.auth_host,
        )
        .with_audience(
            opts.audience.clone(),
            Some(opts.audience_client_id),
            opts.audience_host,
        );

    let config = SessionConfig::new(SessionKind::MachineAuth)
        .with_audiences(audiences)
        .with_auth(
            AuthConfig::default()
                .with_client_id(opts.client_id)
                .with_client_secret(opts.client_secret),
        );

    let client = reqwest::Client::builder().https_only(true).build()?;

    let session = SessionBuilder::new(config)
        .with_http_client(client)
        .build()
        .await?;

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match session.get_current_api_token(&opts.audience).await {
            Ok(token) => tracing::info!(
                audience = %opts.audience,
                token = format_args!("{:#?}", token),
                "pulled api token"
            ),
            Err(error) if error.is_unauthorized() => {
                tracing::error!(%error, "session is no longer authenticated");
                break;
            }
            Err(error) => tracing::warn!(%error, "unable to get api token"),
        }
    }

    Ok(())
}
