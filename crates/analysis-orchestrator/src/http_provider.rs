use analysis_core::SubScoreProvider;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct SubScoreResponse {
    score: Option<f64>,
}

/// Provider backed by a scoring microservice exposing `GET {base_url}/score/{symbol}`.
#[derive(Clone)]
pub struct HttpSubScoreProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
}

impl HttpSubScoreProvider {
    pub fn new(name: impl Into<String>, base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.into(),
        })
    }

    async fn request(&self, symbol: &str) -> Result<Option<f64>, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}/score/{}", self.base_url, symbol))
            .send()
            .await?
            .error_for_status()?;

        let body = response.json::<SubScoreResponse>().await?;
        Ok(body.score)
    }
}

#[async_trait]
impl SubScoreProvider for HttpSubScoreProvider {
    async fn fetch_sub_score(&self, symbol: &str) -> Option<f64> {
        match self.request(symbol).await {
            Ok(score) => score,
            Err(e) => {
                tracing::debug!("{} provider request for {} failed: {}", self.name, symbol, e);
                None
            }
        }
    }
}
