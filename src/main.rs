use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use stagepass::api::{create_auth_router, create_health_router, AuthAppState};
use stagepass::config::{load_config, StagepassConfig};
use stagepass::handles::AccountHandleRegistry;
use stagepass::oauth::{run_state_prune, OAuthFlowManager, ProviderConfig, StateSigner};
use stagepass::store::IdentityStore;
use stagepass::vault::CredentialVault;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagepass=info".into()),
        )
        .init();

    info!("Stagepass starting...");

    // Load configuration
    let config_path =
        std::env::var("STAGEPASS_CONFIG").unwrap_or_else(|_| "stagepass.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        info!(path = %config_path, "Loading configuration");
        load_config(&config_path)?
    } else {
        info!(path = %config_path, "No config file found, using defaults");
        StagepassConfig::default()
    };

    // One secret drives both the credential vault and state signing
    let encryption_key = std::env::var("STAGEPASS_ENCRYPTION_KEY")
        .context("STAGEPASS_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    let vault = CredentialVault::new(&encryption_key)
        .context("STAGEPASS_ENCRYPTION_KEY is not a valid vault key")?;
    let signing_key = BASE64
        .decode(&encryption_key)
        .context("STAGEPASS_ENCRYPTION_KEY is not valid base64")?;

    let store = Arc::new(
        IdentityStore::open(&config.database.path, vault, config.refresh.clone())
            .context("Failed to open identity store")?,
    );
    info!(path = %config.database.path, "Identity store opened");

    let registry = Arc::new(AccountHandleRegistry::new(Arc::clone(&store)));

    let signer = StateSigner::new(&signing_key, config.state.ttl_secs)
        .context("Failed to initialize state signer")?;

    let provider = ProviderConfig::from_env(&config.provider, &config.server.public_base_url)
        .context(
            "Provider credentials missing: set STAGEPASS_PROVIDER_CLIENT_ID and \
             STAGEPASS_PROVIDER_CLIENT_SECRET",
        )?;
    info!(authorize_url = %provider.authorize_url, "Provider configured");

    let flow = Arc::new(OAuthFlowManager::new(
        provider,
        signer.clone(),
        Arc::clone(&store),
    ));

    // Background hygiene for consumed state nonces
    tokio::spawn(run_state_prune(signer, config.state.prune_interval_secs));

    // HTTP surface
    let auth_state = AuthAppState {
        flow,
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
    };
    let router = create_auth_router(auth_state)
        .merge(create_health_router())
        .layer(CorsLayer::permissive());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(
        addr = %bind_addr,
        public_base_url = %config.server.public_base_url,
        "HTTP server listening"
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Stagepass stopped");

    Ok(())
}
