use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not reach server: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("server returned {status}: {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("malformed response body: {0}")]
    Body(String),
    #[error("no requests completed")]
    NoCompletedRequests,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() {
            ClientError::Connect(err.to_string())
        } else if err.is_decode() {
            ClientError::Body(err.to_string())
        } else {
            ClientError::Connect(err.to_string())
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Thin client for the OpenAI-compatible `/v1/embeddings` endpoint exposed by
/// vLLM and sglang embedding servers.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    embeddings_url: String,
    health_url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(
        base_url: &str,
        model: &str,
        concurrency: u32,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            // Keep a few spare connections beyond the worker pool
            .pool_max_idle_per_host(concurrency as usize + 4)
            .timeout(request_timeout)
            .build()
            .map_err(|err| ClientError::Connect(err.to_string()))?;
        Ok(Self {
            http,
            embeddings_url: format!("{base}/v1/embeddings"),
            health_url: format!("{base}/health"),
            model: model.to_string(),
        })
    }

    /// Post one embedding request and return its wall-clock latency.
    ///
    /// The body is fully read before the timer stops so that latency covers
    /// the complete exchange, not just the response headers.
    pub async fn embed(&self, texts: &[String]) -> Result<Duration, ClientError> {
        let payload = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let start = Instant::now();
        let response = self.http.post(&self.embeddings_url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, message });
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| ClientError::Body(err.to_string()))?;
        Ok(start.elapsed())
    }

    pub async fn health(&self) -> bool {
        match self.http.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_normalized() {
        let client =
            EmbeddingClient::new("http://localhost:8000/", "m", 4, Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.embeddings_url, "http://localhost:8000/v1/embeddings");
        assert_eq!(client.health_url, "http://localhost:8000/health");
    }

    #[test]
    fn request_payload_shape() {
        let input = vec!["a".to_string(), "b".to_string()];
        let payload = EmbeddingRequest {
            model: "org/model",
            input: &input,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["model"], "org/model");
        assert_eq!(value["input"].as_array().unwrap().len(), 2);
    }
}
