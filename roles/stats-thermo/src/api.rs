use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use thermo_stats::{
    recent_readings, AggregateCoordinator, AggregateError, AggregateOutcome, KeyValueStore,
    ReadingSource, ThresholdConfig, ThresholdError, ThresholdStore, DEFAULT_RECENT_LIMIT,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::backend::Backend;

/// Header carrying a best-effort cache write failure.
pub const CACHE_WARNING_HEADER: &str = "x-cache-warning";

/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Everything the HTTP handlers read from or write to.
pub struct ApiState {
    pub coordinator: AggregateCoordinator,
    pub source: Arc<dyn ReadingSource>,
    pub thresholds: ThresholdStore<Arc<dyn KeyValueStore>>,
}

impl ApiState {
    pub fn new(coordinator: AggregateCoordinator, backend: &Backend) -> Self {
        Self {
            coordinator,
            source: backend.source.clone(),
            thresholds: ThresholdStore::new(backend.store.clone()),
        }
    }
}

pub async fn run_http_server(
    address: String,
    state: Arc<ApiState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&address).await?;
    info!("HTTP averages API listening on http://{}", address);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Rejected request body for {}: {}", path, e);
            return Ok(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "error": "request body too large" }),
            ));
        }
    };

    Ok(route(&method, &path, query.as_deref(), &body, &state).await)
}

/// Dispatch one request by method and path.
pub async fn route(
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
    state: &ApiState,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/api/averages") => serve_averages(&state.coordinator).await,
        (&Method::GET, "/api/readings/latest") => serve_latest(state, query).await,
        (&Method::GET, "/api/config") => serve_thresholds(state).await,
        (&Method::PUT, "/api/config") => update_thresholds(state, body).await,
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "healthy": true })),
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

async fn serve_averages(coordinator: &AggregateCoordinator) -> Response<Full<Bytes>> {
    match coordinator.get_aggregates().await {
        Ok(outcome) => averages_response(outcome),
        Err(e) => {
            let status = match e {
                AggregateError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                AggregateError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
                AggregateError::CacheUnavailable(_) | AggregateError::Cancelled { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error!("Error computing averages: {}", e);
            json_response(status, json!({ "error": e.to_string() }))
        }
    }
}

fn averages_response(outcome: AggregateOutcome) -> Response<Full<Bytes>> {
    let mut body = serde_json::to_value(&outcome.averages).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert("lastUpdated".to_string(), json!(outcome.last_updated));
        map.insert("origin".to_string(), json!(outcome.origin));
    }

    let mut response = json_response(StatusCode::OK, body);
    if let Some(warning) = outcome.persist_warning {
        warn!("Averages served uncached: {}", warning);
        if let Ok(value) = warning.to_string().parse() {
            response.headers_mut().insert(CACHE_WARNING_HEADER, value);
        }
    }
    response
}

/// `limit` from a query string such as `limit=10`.
fn parse_limit(query: Option<&str>) -> Result<usize, String> {
    let value = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "limit")
        .map(|(_, value)| value);

    match value {
        None => Ok(DEFAULT_RECENT_LIMIT),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("invalid limit {:?}", raw)),
    }
}

async fn serve_latest(state: &ApiState, query: Option<&str>) -> Response<Full<Bytes>> {
    let limit = match parse_limit(query) {
        Ok(limit) => limit,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, json!({ "error": e })),
    };

    match recent_readings(&*state.source, limit).await {
        Ok(readings) => json_response(StatusCode::OK, json!(readings)),
        Err(e) => {
            error!("Error fetching recent readings: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": e.to_string() }),
            )
        }
    }
}

async fn serve_thresholds(state: &ApiState) -> Response<Full<Bytes>> {
    match state.thresholds.load().await {
        Ok(Some(config)) => json_response(StatusCode::OK, json!(config)),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            json!({ "error": "no thresholds configured" }),
        ),
        Err(e) => {
            error!("Error loading thresholds: {}", e);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            )
        }
    }
}

async fn update_thresholds(state: &ApiState, body: &[u8]) -> Response<Full<Bytes>> {
    let config: ThresholdConfig = match serde_json::from_slice(body) {
        Ok(config) => config,
        Err(e) => {
            return json_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
        }
    };

    match state.thresholds.save(&config).await {
        Ok(()) => json_response(StatusCode::OK, json!(config)),
        Err(ThresholdError::Invalid(reason)) => {
            json_response(StatusCode::BAD_REQUEST, json!({ "error": reason }))
        }
        Err(e) => {
            error!("Error saving thresholds: {}", e);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            )
        }
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), Ok(DEFAULT_RECENT_LIMIT));
        assert_eq!(parse_limit(Some("limit=5")), Ok(5));
        assert_eq!(parse_limit(Some("x=1&limit=1")), Ok(1));
        assert!(parse_limit(Some("limit=-1")).is_err());
        assert!(parse_limit(Some("limit=many")).is_err());
    }
}
