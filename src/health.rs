// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Liveness and readiness endpoints.
//!
//! Store calls report their outcome here. The process turns unhealthy only while store access
//! keeps failing: several failures in a row, the first of them older than the configured
//! window, the latest one still inside it. Ready once startup is done.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failures in a row before the window is considered at all
const FAILURE_THRESHOLD: u32 = 3;

/// Failure streak since the last successful store call
#[derive(Debug, Default)]
struct Streak {
    first: Option<Instant>,
    last: Option<Instant>,
    consecutive: u32,
}

pub struct Health {
    unhealthy_after: Duration,
    streak: Mutex<Streak>,
    ready: AtomicBool,
}

impl Health {
    pub fn new(unhealthy_after: Duration) -> Self {
        Self {
            unhealthy_after,
            streak: Mutex::new(Streak::default()),
            ready: AtomicBool::new(false),
        }
    }

    fn streak(&self) -> MutexGuard<'_, Streak> {
        self.streak.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_success(&self) {
        let mut streak = self.streak();
        if streak.consecutive > 0 {
            info!(failures = streak.consecutive, "Store access recovered");
        }
        *streak = Streak::default();
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut streak = self.streak();
        streak.first.get_or_insert(now);
        streak.last = Some(now);
        streak.consecutive = streak.consecutive.saturating_add(1);
    }

    pub fn is_healthy(&self) -> bool {
        let streak = self.streak();
        match (streak.first, streak.last) {
            (Some(first), Some(last)) if streak.consecutive >= FAILURE_THRESHOLD => {
                let sustained = first.elapsed() >= self.unhealthy_after;
                let recent = last.elapsed() < self.unhealthy_after;
                !(sustained && recent)
            }
            _ => true,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.is_healthy()
    }
}

/// Answer a health check request for `path`
pub fn respond(path: &str, health: &Health) -> Response<Full<Bytes>> {
    let ok = match path {
        "/healthz" | "/livez" => health.is_healthy(),
        "/readyz" => health.is_ready(),
        _ => return plain(StatusCode::NOT_FOUND, "not found"),
    };
    if ok {
        plain(StatusCode::OK, "ok")
    } else {
        plain(StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Serve the health endpoints on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    health: Arc<Health>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoints listening on {}", addr);
    serve_on(listener, health, shutdown).await
}

async fn serve_on(
    listener: TcpListener,
    health: Arc<Health>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!("Probe connection from {}", peer);

        let health = health.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = respond(req.uri().path(), &health);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                warn!("Probe connection failed: {}", e);
            }
        });
    }
    Ok(())
}
