//! HTTP endpoints polled by the radar display.
//!
//! Routes:
//! - `GET /health`: `{"healthy":true}`
//! - `GET /radar`: `{"targets":[...]}`
//! - `GET /status`: mode, source, headers and playback position
//! - `GET /metrics`: Prometheus text format
//! - `OPTIONS *`: CORS preflight

use crate::metrics;
use crate::snapshot::SnapshotAccessor;
use crate::track::Target;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct Health {
    healthy: bool,
}

#[derive(Serialize)]
struct RadarSnapshot {
    targets: Vec<Target>,
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    accessor: Arc<SnapshotAccessor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!("radar feed listening on http://{}", addr);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("HTTP server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                        continue;
                    }
                };

                let accessor = accessor.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let accessor = accessor.clone();
                        async move {
                            Ok::<_, Infallible>(handle_request(req.method(), req.uri().path(), &accessor))
                        }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%peer, "Error serving connection: {}", err);
                    }
                });
            }
        }
    }

    Ok(())
}

pub fn handle_request(
    method: &Method,
    path: &str,
    accessor: &SnapshotAccessor,
) -> Response<Full<Bytes>> {
    if method == Method::OPTIONS {
        return respond(StatusCode::NO_CONTENT, None, Bytes::new());
    }
    if method != Method::GET {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            None,
            Bytes::from_static(b"Method Not Allowed"),
        );
    }

    match path {
        "/health" => json(&Health { healthy: true }),
        "/radar" => json(&RadarSnapshot {
            targets: accessor.current_targets(),
        }),
        "/status" => json(&accessor.status()),
        "/metrics" => match metrics::encode() {
            Ok((content_type, buffer)) => {
                respond(StatusCode::OK, Some(&content_type), Bytes::from(buffer))
            }
            Err(err) => internal_error(err),
        },
        _ => respond(
            StatusCode::NOT_FOUND,
            None,
            Bytes::from_static(b"Not Found"),
        ),
    }
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value).context("failed to serialize response") {
        Ok(body) => respond(StatusCode::OK, Some("application/json"), Bytes::from(body)),
        Err(err) => internal_error(err),
    }
}

fn internal_error(err: anyhow::Error) -> Response<Full<Bytes>> {
    error!(error = %err, "request failed");
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        None,
        Bytes::from_static(b"Internal Server Error"),
    )
}

fn respond(status: StatusCode, content_type: Option<&str>, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    response
}
