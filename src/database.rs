use std::time::Duration;

use async_trait::async_trait;
use sqlx::{pool::PoolConnection, postgres::PgPoolOptions, Postgres};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CustomDatabaseError {
    #[error("Not found in database")]
    NotFound,

    #[error("Pg error: {0}")]
    Other(#[from] sqlx::Error),

    #[error("Timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// A simple pg wrapper: hands out pooled connections so the storage layer
/// can run its own typed queries.
#[async_trait]
pub trait Client {
    async fn get_connection(&self) -> Result<PoolConnection<Postgres>, CustomDatabaseError>;
}

pub struct PgClient {
    pool: sqlx::PgPool,
}

impl PgClient {
    pub async fn new(addr: String, max_connections: u32) -> Result<PgClient, CustomDatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(1))
            .connect(&addr)
            .await?;

        Ok(PgClient { pool })
    }
}

#[async_trait]
impl Client for PgClient {
    async fn get_connection(&self) -> Result<PoolConnection<Postgres>, CustomDatabaseError> {
        Ok(self.pool.acquire().await?)
    }
}
