use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::observability::{Metrics, MetricsError};

/// Prometheus scrape of the gateway, backend and cart metrics
#[instrument(name = "metrics_handler", skip(metrics))]
pub async fn metrics_handler(
    State(metrics): State<Arc<Metrics>>,
) -> Result<Response, ScrapeError> {
    let exposition = metrics.encode()?;
    debug!(bytes = exposition.len(), "Metrics scraped");

    let mut response = exposition.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(prometheus::TEXT_FORMAT),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// A registry that could not be rendered; scrapers see a 500
#[derive(Debug)]
pub struct ScrapeError(MetricsError);

impl From<MetricsError> for ScrapeError {
    fn from(err: MetricsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Metrics scrape failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}
