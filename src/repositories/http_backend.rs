use reqwest::{Client, Method, Response, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn, Instrument};

use crate::config::BackendConfig;
use crate::models::{RepositoryError, RepositoryResult};
use crate::observability::Metrics;

/// HTTP client for the cart backend, shared by all repository traits
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    metrics: Option<Arc<Metrics>>,
}

impl HttpBackend {
    /// Create a backend client with the configured request timeout
    pub fn new(config: &BackendConfig) -> RepositoryResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RepositoryError::Client {
                message: e.to_string(),
            })?;

        let base_url = Url::parse(&config.backend_url).map_err(|e| RepositoryError::Client {
            message: format!("Invalid backend URL {}: {}", config.backend_url, e),
        })?;

        Ok(Self {
            client,
            base_url,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Append `segments` to the base URL, percent-encoding each one so that ids
    /// can neither add path levels nor a query string
    pub(crate) fn url(&self, segments: &[&str]) -> RepositoryResult<Url> {
        if let Some(segment) = segments.iter().find(|s| matches!(**s, "." | "..")) {
            return Err(RepositoryError::Client {
                message: format!("Invalid path segment: {:?}", segment),
            });
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RepositoryError::Client {
                message: format!("Backend URL cannot have a path: {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        segments: &[&str],
    ) -> RepositoryResult<T> {
        let response = self.send::<()>(Method::GET, endpoint, segments, None).await?;
        decode_json(endpoint, response).await
    }

    pub(crate) async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        segments: &[&str],
        body: &B,
    ) -> RepositoryResult<T> {
        let response = self.send(Method::POST, endpoint, segments, Some(body)).await?;
        decode_json(endpoint, response).await
    }

    /// POST whose response body may be empty; an empty body yields `Value::Null`
    pub(crate) async fn post_for_value<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        segments: &[&str],
        body: &B,
    ) -> RepositoryResult<serde_json::Value> {
        let response = self.send(Method::POST, endpoint, segments, Some(body)).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RepositoryError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    /// Send one request; non-2xx statuses become `UnexpectedStatus`
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        segments: &[&str],
        body: Option<&B>,
    ) -> RepositoryResult<Response> {
        let url = self.url(segments)?;
        let span = tracing::info_span!(
            "backend",
            otel.kind = "client",
            http.method = %method.as_str(),
            http.route = endpoint,
            http.url = %url,
            http.status_code = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let mut request = self.client.request(method, url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let result = request.send().await;
            let elapsed = start.elapsed().as_secs_f64();

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Backend request failed");
                    self.record(endpoint, "error", elapsed);
                    return Err(RepositoryError::from(e));
                }
            };

            let status = response.status();
            tracing::Span::current().record("http.status_code", status.as_u16());
            self.record(endpoint, status.as_str(), elapsed);

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "Backend returned an error status");
                return Err(RepositoryError::UnexpectedStatus {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            debug!(status = status.as_u16(), "Backend request succeeded");
            Ok(response)
        }
        .instrument(span)
        .await
    }

    fn record(&self, endpoint: &str, status: &str, elapsed: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_request(endpoint, status, elapsed);
        }
    }
}

async fn decode_json<T: DeserializeOwned>(endpoint: &str, response: Response) -> RepositoryResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RepositoryError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}
