use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_api::state::AppState;
use parley_call::{CallRegistry, ProviderKeys, VendorProviders};
use parley_config::Settings;
use parley_providers::stt::DeepgramBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let redis = match redis::Client::open(settings.redis_url.clone()) {
        Ok(client) => match redis::aio::ConnectionManager::new(client).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(%e, "Redis unreachable; transcript persistence disabled");
                None
            }
        },
        Err(e) => {
            warn!(%e, "Invalid Redis URL; transcript persistence disabled");
            None
        }
    };

    let providers = Arc::new(VendorProviders {
        keys: ProviderKeys {
            openai: settings.openai_token.clone(),
            azure: settings.azure_token.clone(),
            elevenlabs: settings.elevenlabs_token.clone(),
        },
        stt: Arc::new(DeepgramBackend::new(settings.deepgram_token.clone())),
    });

    let registry = CallRegistry::new(providers, redis);
    let state = AppState {
        registry: Arc::clone(&registry),
        settings: Arc::new(settings.clone()),
    };

    let app = parley_api::build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!(port = settings.port, "Starting REST API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            registry.shutdown();
        })
        .await?;

    Ok(())
}
