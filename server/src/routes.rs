use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::accounts;
use crate::auth::middleware::JwtSecret;
use crate::state::AppState;
use crate::tasks::crud;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 5 requests per minute per IP on the credential endpoints.
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5) // Allow burst of 5
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    // Account routes with rate limiting
    let account_routes = Router::new()
        .route("/api/register", axum::routing::post(accounts::register))
        .route("/api/login", axum::routing::post(accounts::login))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Task routes (JWT required — Claims extractor validates token)
    let task_routes = Router::new()
        .route("/api/tasks", axum::routing::get(crud::list_tasks))
        .route("/api/tasks", axum::routing::post(crud::create_task))
        .route("/api/tasks/{id}", axum::routing::put(crud::update_task))
        .route("/api/tasks/{id}", axum::routing::delete(crud::delete_task))
        .route(
            "/api/tasks/{id}/toggle",
            axum::routing::patch(crud::toggle_task),
        );

    // WebSocket endpoint (auth via in-band handshake, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(account_routes)
        .merge(task_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
