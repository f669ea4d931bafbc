use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::config_resolution::ConfigResolver;
use crate::redis::Client as RedisClient;
use crate::storage::Storage;
use crate::v0_endpoint;

#[derive(Clone)]
pub struct State {
    pub redis_client: Arc<dyn RedisClient + Send + Sync>,
    pub storage: Arc<dyn Storage + Send + Sync>,
    pub resolver: Arc<ConfigResolver>,
    pub config: Config,
}

pub fn router(
    redis_client: Arc<dyn RedisClient + Send + Sync>,
    storage: Arc<dyn Storage + Send + Sync>,
    config: Config,
) -> Router {
    let resolver = Arc::new(ConfigResolver::new(
        storage.clone(),
        redis_client.clone(),
        config.clone(),
    ));

    let state = State {
        redis_client,
        storage,
        resolver,
        config: config.clone(),
    };

    let status_router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index));

    let config_router = Router::new()
        .route("/config", any(v0_endpoint::config))
        .route("/config/", any(v0_endpoint::config))
        .route("/config/confirm", post(v0_endpoint::confirm))
        .route("/config/confirm/", post(v0_endpoint::confirm))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let admin_router = Router::new()
        .route("/flows", post(v0_endpoint::create_flow))
        .route("/experiments", post(v0_endpoint::create_experiment))
        .route("/winners", post(v0_endpoint::create_winner))
        .route("/experiments/:id/stats", get(v0_endpoint::experiment_stats))
        .route(
            "/experiments/:id/counters/reset",
            post(v0_endpoint::reset_counters),
        )
        .route(
            "/test-overrides",
            post(v0_endpoint::set_test_override).delete(v0_endpoint::clear_test_overrides),
        );

    Router::new()
        .merge(status_router)
        .merge(config_router)
        .merge(admin_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn index() -> &'static str {
    "remote config"
}
