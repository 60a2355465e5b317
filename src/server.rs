//! HTTP surface.
//!
//! Routes:
//! - `GET /api/v3/delta?src=&dest=[&wait=true]`: image-native deltas
//! - `GET /api/v2/delta?src=&dest=[&wait=true]`: patch-file deltas
//! - `GET /api/v2/delta/download?delta=<key>`: patch-file download
//! - `GET /health`

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::backend::Artifact;
use crate::context::{AppContext, DOWNLOAD_ROUTE};
use crate::coordinator::{BuildRequest, Coordinator, Outcome};
use crate::{Error, Result};

/// Grace period for running builds once the listener has closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(20 * 60);

type AppState = Arc<AppContext>;

#[derive(Debug, Default, Deserialize)]
pub struct DeltaQuery {
    pub src: Option<String>,
    pub dest: Option<String>,
    pub wait: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub delta: Option<String>,
}

pub fn router(ctx: AppState) -> Router {
    Router::new()
        .route("/api/v3/delta", get(image_delta))
        .route("/api/v2/delta", get(patch_delta))
        .route(DOWNLOAD_ROUTE, get(download))
        .route("/health", get(health))
        .with_state(ctx)
}

/// Bind `addr` and serve until Ctrl-C or SIGTERM, then wait for running
/// builds.
pub async fn serve(addr: SocketAddr, ctx: AppContext) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, auth = ctx.auth.mode(), "deltad listening");

    let ctx = Arc::new(ctx);
    serve_with_shutdown(listener, Arc::clone(&ctx), shutdown_signal()).await?;

    info!(active = ctx.active_builds(), "listener closed");
    ctx.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(listener: TcpListener, ctx: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn image_delta(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeltaQuery>,
) -> Response {
    handle_delta(&ctx.image, &headers, query).await
}

async fn patch_delta(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeltaQuery>,
) -> Response {
    handle_delta(&ctx.patch, &headers, query).await
}

async fn handle_delta(coordinator: &Coordinator, headers: &HeaderMap, query: DeltaQuery) -> Response {
    let wait = query
        .wait
        .as_deref()
        .is_some_and(|w| w.eq_ignore_ascii_case("true") || w == "1");
    let src = query.src.clone().unwrap_or_default();
    let dest = query.dest.clone().unwrap_or_default();

    let request = BuildRequest {
        src: query.src,
        dest: query.dest,
        authorization: authorization(headers),
        wait,
    };

    match coordinator.handle(request).await {
        Ok(Outcome::Ready(Artifact::Image { name })) => {
            info!(src = %src, dest = %dest, name = %name, "delta ready");
            (StatusCode::OK, Json(json!({ "success": true, "name": name }))).into_response()
        }
        Ok(Outcome::Ready(Artifact::Download { location })) => {
            info!(src = %src, dest = %dest, location = %location, "delta ready");
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Ok(Outcome::Pending) => {
            info!(src = %src, dest = %dest, "delta build in progress");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "success": false, "message": "delta build in progress" })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(
                format = coordinator.format().as_str(),
                src = %src,
                dest = %dest,
                error = %e,
                "delta request failed"
            );
            error_response(&e)
        }
    }
}

async fn download(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let auth = authorization(&headers);
    let stored = match ctx
        .patch
        .download(auth.as_deref(), query.delta.as_deref())
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            warn!(key = query.delta.as_deref().unwrap_or("-"), error = %e, "download failed");
            return error_response(&e);
        }
    };

    let len = stored.len;
    let body = Body::from_stream(ReaderStream::new(stored.file));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response()
}

async fn health(State(ctx): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "auth": ctx.auth.mode(),
        "active_builds": ctx.active_builds(),
    }))
    .into_response()
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(e: &Error) -> Response {
    (
        e.status_code(),
        Json(json!({ "success": false, "message": e.public_message() })),
    )
        .into_response()
}
