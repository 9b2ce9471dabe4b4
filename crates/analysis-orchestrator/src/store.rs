use analysis_core::{AnalysisError, CacheStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Redis-backed persistent cache store.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis cache store");
        Ok(Self {
            conn,
            prefix: "orchestrator:".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn store_error(e: redis::RedisError) -> AnalysisError {
    AnalysisError::CacheError(e.to_string())
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AnalysisError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(self.key(key))
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AnalysisError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.key(key), value, secs)
            .await
            .map_err(store_error)
    }

    async fn delete(&self, key: &str) -> Result<(), AnalysisError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await.map_err(store_error)
    }
}
