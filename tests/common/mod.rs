use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use remote_config::config::Config;
use remote_config::redis::MockRedisClient;
use remote_config::router;
use remote_config::test_utils::{MemoryStorage, PREFIX};

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| {
    let mut config = Config::default_test_config();
    config.counter_key_prefix = PREFIX.to_string();
    config
});

pub fn test_config() -> Config {
    DEFAULT_CONFIG.clone()
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    /// Serves the full router over in-memory storage and redis, so tests
    /// exercise the real HTTP surface without external services.
    pub async fn for_backends(
        storage: Arc<MemoryStorage>,
        redis: Arc<MockRedisClient>,
        config: Config,
    ) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let app = router::router(redis, storage, config);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { notify.notified().await })
            .await
            .unwrap()
        });
        ServerHandle { addr, shutdown }
    }

    pub async fn post_json<T: Into<reqwest::Body>>(&self, path: &str, body: T) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .post(format!("http://{:?}{}", self.addr, path))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .get(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn send_invalid_header_request<T: Into<reqwest::Body>>(
        &self,
        path: &str,
        body: T,
    ) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .post(format!("http://{:?}{}", self.addr, path))
            .body(body)
            .header(CONTENT_TYPE, "xyz")
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
