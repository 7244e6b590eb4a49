use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use taskstream_server::config::{generate_config_template, Config};
use taskstream_server::state::AppState;
use taskstream_server::ws::registry::Registry;
use taskstream_server::{auth, db, routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taskstream_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taskstream_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("taskstream server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate the JWT signing key
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // Process-wide stream registry, torn down only at shutdown
    let registry = Arc::new(Registry::new());

    let state = AppState {
        db,
        jwt_secret,
        registry,
    };

    let app = routes::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
