//! The HTTP/JSON surface.
//!
//! Thin request binding over the service layer: extract path parameters and
//! bodies, apply pull defaults, map service errors onto status codes. Errors
//! serialise as `{"reason": …}` — 404 for the per-entity not-found variants,
//! 400 for bind and validation failures, 500 for everything else.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics;
use crate::poll;
use crate::pubsub::{Snapshot, Subscription, Topic};
use crate::service::{PullRequest, Service, DEFAULT_PULL_LIMIT};
use crate::store::KvStore;

#[cfg(feature = "transport-tls")]
mod tls;

#[cfg(feature = "transport-tls")]
pub use tls::load_server_config;

/// TLS material for the API listener; `None` serves plain TCP.
#[cfg(feature = "transport-tls")]
pub type TlsConfig = Option<Arc<rustls::ServerConfig>>;

#[cfg(not(feature = "transport-tls"))]
#[derive(Debug, Clone, Default)]
pub struct TlsConfig();

/// Seconds a pull blocks when the request names no timeout.
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// The API router.
pub fn router<S: KvStore>(service: Arc<Service<S>>) -> Router {
    Router::new()
        .route(
            "/v1/topics/{topic}",
            put(create_topic::<S>)
                .get(get_topic::<S>)
                .delete(destroy::<S>),
        )
        .route("/v1/messages/topics/{topic}", post(publish::<S>))
        .route("/v1/messages/ack/{topic}/{subname}/{msgid}", post(ack::<S>))
        .route(
            "/v1/subscriptions/{topic}/{subname}",
            put(subscribe::<S>).delete(unsubscribe::<S>).post(pull::<S>),
        )
        .route(
            "/v1/snapshots/{topic}/{subname}/{name}",
            put(create_snapshot::<S>)
                .delete(delete_snapshot::<S>)
                .post(seek::<S>),
        )
        .fallback(not_found)
        .with_state(service)
}

/// The status router, served on its own listener.
pub fn status_router() -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
}

/// Serve `app` until `shutdown` resolves, speaking TLS when configured.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    tls: TlsConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    #[cfg(feature = "transport-tls")]
    if let Some(config) = tls {
        return tls::serve_tls(listener, app, config, shutdown).await;
    }

    #[cfg(not(feature = "transport-tls"))]
    let _ = tls;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Serialize)]
struct Reason {
    reason: String,
}

/// Service error with its HTTP rendering.
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if matches!(self.0, Error::InvalidArgument(_)) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (
            status,
            Json(Reason {
                reason: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn bad_request(reason: impl Into<String>) -> ApiError {
    ApiError(Error::InvalidArgument(reason.into()))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Reason {
            reason: "page not found".to_owned(),
        }),
    )
        .into_response()
}

async fn render_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

// === Topics ===

async fn create_topic<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path(topic): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    Ok(Json(service.create_topic(&topic).await?))
}

async fn get_topic<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path(topic): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    Ok(Json(service.topic(&topic).await?))
}

async fn destroy<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path(topic): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.destroy(&topic).await?;
    Ok(StatusCode::OK)
}

// === Messages ===

#[derive(Debug, Deserialize)]
struct PublishBody {
    messages: Vec<String>,
}

async fn publish<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<Json<Vec<String>>, ApiError> {
    let body: PublishBody =
        serde_json::from_slice(&body).map_err(|err| bad_request(err.to_string()))?;
    if body.messages.is_empty() {
        return Err(bad_request("messages must not be empty"));
    }

    let payloads = body.messages.into_iter().map(Bytes::from).collect();
    Ok(Json(service.publish(&topic, payloads).await?))
}

async fn ack<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname, msgid)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    service.ack(&topic, &subname, &msgid).await?;
    Ok(StatusCode::OK)
}

// === Subscriptions ===

async fn subscribe<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname)): Path<(String, String)>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(service.subscribe(&topic, &subname).await?))
}

async fn unsubscribe<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    service.unsubscribe(&topic, &subname).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PullBody {
    limit: i64,

    /// Long-poll timeout in seconds.
    timeout: u64,

    #[serde(rename = "autoACK")]
    auto_ack: bool,

    offset: String,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    payload: String,
    id: String,
}

async fn pull<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Vec<MessageBody>>, ApiError> {
    // An absent body means all-defaults; a present one must parse.
    let body: PullBody = if body.is_empty() {
        PullBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| bad_request(err.to_string()))?
    };

    let limit = if body.limit <= 0 {
        DEFAULT_PULL_LIMIT
    } else {
        body.limit as usize
    };
    let timeout = if body.timeout == 0 {
        DEFAULT_PULL_TIMEOUT
    } else {
        Duration::from_secs(body.timeout)
    };

    let req = PullRequest {
        topic,
        subscription: subname,
        limit,
        auto_ack: body.auto_ack,
        offset: (!body.offset.is_empty()).then_some(body.offset),
    };

    let messages = poll::pull_wait(&service, &req, timeout).await?;
    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageBody {
                payload: String::from_utf8_lossy(&m.payload).into_owned(),
                id: m.id.to_string(),
            })
            .collect(),
    ))
}

// === Snapshots ===

async fn create_snapshot<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname, name)): Path<(String, String, String)>,
) -> Result<Json<String>, ApiError> {
    let snapshot: Snapshot = service.create_snapshot(&topic, &subname, &name).await?;
    Ok(Json(snapshot.name))
}

async fn delete_snapshot<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname, name)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    service.delete_snapshot(&topic, &subname, &name).await?;
    Ok(StatusCode::OK)
}

async fn seek<S: KvStore>(
    State(service): State<Arc<Service<S>>>,
    Path((topic, subname, name)): Path<(String, String, String)>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(service.seek(&topic, &subname, &name).await?))
}
