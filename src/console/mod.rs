//! Operator console HTTP API.
//!
//! A thin warp boundary over [`FileService`]: dashboard, auto-upload
//! toggle, manual upload, runtime reconfiguration and health. All
//! routes except `/api/health` require the shared `X-API-Token` when
//! one is configured.

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ApiConfig;
use crate::service::{ConfigPatch, FileService};
use crate::state::dashboard::ConfigSnapshot;
use crate::utils::errors::AgentError;

/// Custom rejection for a bad or missing API token.
#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

pub struct ConsoleServer {
    service: Arc<FileService>,
    bind: String,
    auth_token: Option<String>,
    cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AutoUploadBody {
    path: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ManualUploadBody {
    path: String,
}

impl ConsoleServer {
    pub fn new(service: Arc<FileService>, api: &ApiConfig) -> Self {
        Self {
            service,
            bind: api.bind.clone(),
            auth_token: (!api.auth_token.is_empty()).then(|| api.auth_token.clone()),
            cors_origins: api.cors_origins.clone(),
        }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let addr = parse_bind(&self.bind)?;
        if self.auth_token.is_none() {
            warn!("API_AUTH_TOKEN not set - console endpoints are unauthenticated");
        }

        let routes = build_routes(
            Arc::clone(&self.service),
            self.auth_token.clone(),
        );

        let cors = if self.cors_origins.is_empty() {
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST"])
                .allow_headers(vec!["content-type", "x-api-token"])
        } else {
            warp::cors()
                .allow_origins(self.cors_origins.iter().map(String::as_str))
                .allow_methods(vec!["GET", "POST"])
                .allow_headers(vec!["content-type", "x-api-token"])
        };

        info!("Console API listening on {}", addr);
        warp::serve(routes.with(cors)).run(addr).await;
        Ok(())
    }
}

fn parse_bind(raw: &str) -> anyhow::Result<SocketAddr> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid API bind address {raw:?}: {e}"))
}

fn build_routes(
    service: Arc<FileService>,
    auth_token: Option<String>,
) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
    let with_service = {
        let service = Arc::clone(&service);
        warp::any().map(move || Arc::clone(&service))
    };

    let auth = warp::header::optional::<String>("x-api-token").and_then(
        move |header: Option<String>| {
            let expected = auth_token.clone();
            async move {
                match expected {
                    None => Ok(()),
                    Some(expected) => match header {
                        Some(presented) if presented == expected => Ok(()),
                        _ => {
                            warn!("Rejected console request with bad API token");
                            Err(warp::reject::custom(Unauthorized))
                        }
                    },
                }
            }
        },
    );

    let dashboard = warp::path!("api" / "dashboard")
        .and(warp::get())
        .and(auth.clone())
        .and(with_service.clone())
        .and(warp::query::<HashMap<String, String>>())
        .and_then(handle_dashboard);

    let auto_upload = warp::path!("api" / "auto-upload")
        .and(warp::post())
        .and(auth.clone())
        .and(with_service.clone())
        .and(warp::body::json())
        .and_then(handle_auto_upload);

    let manual_upload = warp::path!("api" / "manual-upload")
        .and(warp::post())
        .and(auth.clone())
        .and(with_service.clone())
        .and(warp::body::json())
        .and_then(handle_manual_upload);

    let config = warp::path!("api" / "config")
        .and(warp::post())
        .and(auth)
        .and(with_service.clone())
        .and(warp::body::json())
        .and_then(handle_config);

    // Health stays anonymous so probes keep working when the token
    // rotates.
    let health = warp::path!("api" / "health")
        .and(warp::get())
        .and(with_service)
        .and_then(handle_health);

    health
        .or(dashboard)
        .or(auto_upload)
        .or(manual_upload)
        .or(config)
        .recover(handle_rejection)
}

async fn handle_dashboard(
    _auth: (),
    service: Arc<FileService>,
    query: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let refresh = query
        .get("refresh")
        .map(|value| value == "true" || value == "1")
        .unwrap_or(false);
    let snapshot = service.dashboard(refresh).await;
    Ok(warp::reply::with_status(
        warp::reply::json(&snapshot),
        StatusCode::OK,
    ))
}

async fn handle_auto_upload(
    _auth: (),
    service: Arc<FileService>,
    body: AutoUploadBody,
) -> Result<impl Reply, Rejection> {
    match service.set_auto_upload(&body.path, body.enabled).await {
        Ok(()) => Ok(ok_reply()),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn handle_manual_upload(
    _auth: (),
    service: Arc<FileService>,
    body: ManualUploadBody,
) -> Result<impl Reply, Rejection> {
    match service.enqueue_manual(&body.path).await {
        Ok(()) => Ok(ok_reply()),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn handle_config(
    _auth: (),
    service: Arc<FileService>,
    patch: ConfigPatch,
) -> Result<impl Reply, Rejection> {
    match service.update_config(patch).await {
        Ok(config) => Ok(warp::reply::with_status(
            warp::reply::json(&json!({
                "ok": true,
                "config": ConfigSnapshot::from_config(&config),
            })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn handle_health(service: Arc<FileService>) -> Result<impl Reply, Rejection> {
    let health = service.health_snapshot().await;
    Ok(warp::reply::with_status(
        warp::reply::json(&health),
        StatusCode::OK,
    ))
}

fn ok_reply() -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&json!({"ok": true})), StatusCode::OK)
}

fn error_reply(error: &AgentError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match error {
        AgentError::Config(_) | AgentError::PathOutsideRoot(_) => StatusCode::BAD_REQUEST,
        AgentError::QueueFull | AgentError::QueueSaturated => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(
        warp::reply::json(&json!({"ok": false, "error": error.to_string()})),
        status,
    )
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (status, message) = if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "unauthorized")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else {
        (StatusCode::BAD_REQUEST, "bad request")
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({"ok": false, "error": message})),
        status,
    ))
}
