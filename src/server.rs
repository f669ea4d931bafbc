use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::database::PgClient;
use crate::redis::RedisClient;
use crate::router;
use crate::storage::PgStorage;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client = match RedisClient::new(config.redis_url.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("Failed to create Redis client: {}", e);
            return;
        }
    };

    let read_client =
        match PgClient::new(config.read_database_url.clone(), config.max_pg_connections).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Failed to create read Postgres client: {}", e);
                return;
            }
        };

    let write_client =
        match PgClient::new(config.write_database_url.clone(), config.max_pg_connections).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Failed to create write Postgres client: {}", e);
                return;
            }
        };

    let storage = Arc::new(PgStorage::new(read_client, write_client));

    let app = router::router(redis_client, storage, config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("could not read local address: {}", e),
    }
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        tracing::error!("server exited with error: {}", e);
    }
}
