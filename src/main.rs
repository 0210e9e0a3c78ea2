use clap::Parser;
use miette::Result;
use nightgate::email::DisabledEmailSender;
use nightgate::jwks::JwksManager;
use nightgate::local_identity::LocalIdentityProvider;
use nightgate::notifications::AdminNotifier;
use nightgate::oidc_discovery::DiscoveryCache;
use nightgate::revocation::RevocationCache;
use nightgate::roles::{self, DbRoleRepository};
use nightgate::settings::Settings;
use nightgate::token_codec::TokenCodec;
use nightgate::token_exchange::TokenService;
use nightgate::{jobs, storage, web};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "nightgate",
    version,
    about = "OAuth2 authorization server for Nightscout-compatible services"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(issuer = %settings.issuer(), "Loaded configuration");

    let db = storage::init(&settings.database).await?;

    let report = roles::seed_default_roles(&DbRoleRepository::new(db.clone())).await?;
    tracing::info!(
        created = ?report.created,
        updated = ?report.updated,
        "Default roles reconciled"
    );

    let jwks = JwksManager::new(settings.keys.clone()).await?;
    let codec = TokenCodec::new(jwks.clone(), settings.issuer(), &settings.tokens);
    let revocations = RevocationCache::new();
    let tokens = TokenService::new(
        db.clone(),
        codec,
        revocations.clone(),
        settings.tokens.clone(),
        settings.device.clone(),
    );

    let notifier = AdminNotifier::new();
    let local = LocalIdentityProvider::new(
        db.clone(),
        settings.local_identity.clone(),
        Arc::new(DisabledEmailSender),
        notifier,
    );

    let discovery = DiscoveryCache::new(settings.oidc.discovery_cache_ttl_secs)?;
    for provider in &settings.oidc.providers {
        if let Err(e) = discovery.get(&provider.issuer).await {
            tracing::warn!(provider = %provider.name, error = %e, "Discovery document unavailable");
        }
    }

    let _scheduler =
        jobs::init_scheduler(db.clone(), settings.cleanup.clone(), revocations).await?;

    let state = web::AppState {
        settings: Arc::new(settings),
        db,
        jwks,
        tokens,
        local,
        discovery,
    };
    web::serve(state).await
}
