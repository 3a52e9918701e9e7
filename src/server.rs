use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::TunnelMetrics;
use crate::tunnel::{Liveness, TunnelManager};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// 在给定监听器上逐连接地服务 /metrics 与 /health，直到 shutdown 触发
pub async fn serve(
    listener: TcpListener,
    manager: Arc<TunnelManager>,
    metrics: Arc<TunnelMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "metrics server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("metrics server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let manager = manager.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, manager.clone(), metrics.clone())
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "connection error");
                    }
                });
            }
        }
    }
}

async fn handle(
    request: Request<Incoming>,
    manager: Arc<TunnelManager>,
    metrics: Arc<TunnelMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => match metrics.encode() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, METRICS_CONTENT_TYPE)
                .body(Full::new(Bytes::from(body))),
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from_static(b"encoding error")))
            }
        },
        (&Method::GET, "/health") => {
            let (status, body) = match manager.liveness().await {
                Liveness::Up => (StatusCode::OK, "OK"),
                Liveness::AllDown => (StatusCode::SERVICE_UNAVAILABLE, "all tunnels down"),
                Liveness::NoTunnels => (StatusCode::SERVICE_UNAVAILABLE, "no tunnels configured"),
            };
            Response::builder()
                .status(status)
                .body(Full::new(Bytes::from_static(body.as_bytes())))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found"))),
    }
}
