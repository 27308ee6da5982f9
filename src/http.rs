use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::db::Pool;
use crate::metrics::Metrics;
use crate::model::{now_unix, Device, Network, Uptime};
use crate::scanner::Scanner;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub pool: Pool,
    pub scanner: Arc<Scanner>,
    /// Seconds a device may stay silent before it counts as offline.
    pub live_timeout: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiNetwork {
    pub id: i64,
    pub addr: String,
    pub desc: String,
    pub last_scan: i64,
    pub devices: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiScanProgress {
    pub scanned: u64,
    pub added: u64,
    pub active: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiDevice {
    pub id: i64,
    pub net_id: i64,
    pub name: String,
    pub addr: Vec<String>,
    pub os: String,
    pub bighead: bool,
    pub last_seen: i64,
    pub online: bool,
}

impl ApiDevice {
    fn from_device(dev: &Device, live_timeout: i64) -> Self {
        Self {
            id: dev.id,
            net_id: dev.net_id,
            name: dev.name.clone(),
            addr: dev.addr.iter().map(|a| a.to_string()).collect(),
            os: dev.os.clone(),
            bighead: dev.bighead,
            last_seen: dev.last_seen,
            online: now_unix() - dev.last_seen <= live_timeout,
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    pool: Pool,
    scanner: Arc<Scanner>,
    live_timeout: i64,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/networks", get(networks_handler))
        .route("/api/networks/{id}/progress", get(network_progress_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/{id}/uptime", get(device_uptime_handler))
        .with_state(HttpAppState {
            metrics,
            pool,
            scanner,
            live_timeout,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn networks_handler(State(state): State<HttpAppState>) -> Response {
    let result: Result<Vec<ApiNetwork>, String> = async {
        let mut store = state.pool.borrow().await.map_err(|e| e.to_string())?;
        let networks: Vec<Network> = store.network_get_all().map_err(|e| e.to_string())?;
        let counts = store.network_dev_cnt().map_err(|e| e.to_string())?;

        Ok(networks
            .iter()
            .map(|net| ApiNetwork {
                id: net.id,
                addr: net.addr.to_string(),
                desc: net.desc.clone(),
                last_scan: net.last_scan,
                devices: counts.get(&net.id).copied().unwrap_or(0),
            })
            .collect())
    }
    .await;

    match result {
        Ok(networks) => {
            state.metrics.fleet_networks.set(networks.len() as f64);
            Json(networks).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

/// Live counters of a running scan. `active: false` with zeroed counters
/// means no scan of that network is currently in flight.
async fn network_progress_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<i64>,
) -> Response {
    let progress = match state.scanner.progress(id).await {
        Some((scanned, added)) => ApiScanProgress {
            scanned,
            added,
            active: true,
        },
        None => ApiScanProgress {
            scanned: 0,
            added: 0,
            active: false,
        },
    };
    Json(progress).into_response()
}

async fn devices_handler(State(state): State<HttpAppState>) -> Response {
    let result: Result<Vec<ApiDevice>, String> = async {
        let mut store = state.pool.borrow().await.map_err(|e| e.to_string())?;
        let devices = store.device_get_all(false).map_err(|e| e.to_string())?;
        Ok(devices
            .iter()
            .map(|dev| ApiDevice::from_device(dev, state.live_timeout))
            .collect())
    }
    .await;

    match result {
        Ok(devices) => {
            state.metrics.fleet_devices.set(devices.len() as f64);
            Json(devices).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct UptimeQuery {
    limit: Option<i64>,
}

async fn device_uptime_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<i64>,
    Query(query): Query<UptimeQuery>,
) -> Response {
    let result: Result<Option<Vec<Uptime>>, String> = async {
        let mut store = state.pool.borrow().await.map_err(|e| e.to_string())?;
        let Some(dev) = store.device_get_by_id(id).map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        let samples = store
            .uptime_get_by_device(&dev, query.limit.unwrap_or(96))
            .map_err(|e| e.to_string())?;
        Ok(Some(samples))
    }
    .await;

    match result {
        Ok(Some(samples)) => Json(samples).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such device").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new().expect("инициализация метрик");
        let pool = Pool::new(dir.path().join("test.db"), 2, metrics.clone()).unwrap();
        let cfg: crate::config::Config =
            toml::from_str(crate::config::Config::example_toml()).unwrap();
        let scanner = Arc::new(Scanner::new(pool.clone(), &cfg, metrics.clone()).unwrap());
        let router = build_router(metrics, pool, scanner, 300);
        (dir, router)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (_dir, app) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_encodes() {
        let (_dir, app) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("fleet_scrape_count_total"));
    }

    #[tokio::test]
    async fn devices_endpoint_returns_json() {
        let (_dir, app) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn progress_without_scan_is_inactive() {
        let (_dir, app) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/networks/1/progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"active\":false"));
        assert!(text.contains("\"scanned\":0"));
    }

    #[tokio::test]
    async fn uptime_for_unknown_device_is_404() {
        let (_dir, app) = test_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/devices/4711/uptime")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
