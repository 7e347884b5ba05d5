//! WebSocket and health HTTP server
//!
//! Sessions connect over WebSocket at `/ws` (or `/`). Each session gets a
//! reader loop that dispatches client requests and a writer task that drains
//! the session's outbound queue onto the socket. The same server answers the
//! health probes.

use crate::error::RelayError;
use crate::relay::RelayContext;
use crate::session_span;
use crate::transport::Transport;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    phase: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: chrono::DateTime<chrono::Utc>,
}

fn with_context<T: Transport + 'static>(
    ctx: Arc<RelayContext<T>>,
) -> impl Filter<Extract = (Arc<RelayContext<T>>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Every route the relay serves
pub fn routes<T: Transport + 'static>(
    ctx: Arc<RelayContext<T>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .or(warp::path::end())
        .unify()
        .and(warp::ws())
        .and(with_context(ctx.clone()))
        .map(|ws: Ws, ctx: Arc<RelayContext<T>>| {
            ws.on_upgrade(move |socket| run_session(ctx, socket))
        });

    // GET /health - latest snapshot, 503 unless healthy
    let health_route = warp::path("health")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .map(|ctx: Arc<RelayContext<T>>| match ctx.latest_health() {
            Some(snapshot) => {
                let code = if snapshot.status.is_healthy() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&snapshot), code)
            }
            None => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "status": "starting" })),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        });

    // GET /ready - broker link is up
    let ready_route = warp::path("ready")
        .and(warp::get())
        .and(with_context(ctx.clone()))
        .map(|ctx: Arc<RelayContext<T>>| {
            let connection = ctx.transport.connection();
            let response = ReadinessResponse {
                ready: connection.connected,
                phase: connection.phase.label(),
                timestamp: chrono::Utc::now(),
            };
            let code = if response.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

    // GET /live - process is up
    let live_route = warp::path("live").and(warp::get()).map(|| {
        warp::reply::json(&LivenessResponse {
            alive: true,
            timestamp: chrono::Utc::now(),
        })
    });

    ws_route
        .or(health_route)
        .or(ready_route)
        .or(live_route)
        .with(warp::cors().allow_any_origin())
}

/// Bind the server; it runs until `shutdown` turns true
pub fn bind<T: Transport + 'static>(
    ctx: Arc<RelayContext<T>>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    let (bound, server) = warp::serve(routes(ctx)).try_bind_with_graceful_shutdown(
        addr,
        async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        },
    )?;
    info!(addr = %bound, "Session server listening");
    Ok((bound, server))
}

/// Serve one WebSocket session until either side closes it
async fn run_session<T: Transport + 'static>(ctx: Arc<RelayContext<T>>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let handle = match ctx.hub.accept().await {
        Ok(handle) => handle,
        Err(e) => {
            debug!(error = %e, "Session refused");
            let _ = sink.send(Message::close_with(1001u16, "shutting down")).await;
            return;
        }
    };
    ctx.metrics.session_accepted();
    let id = handle.id;
    let mut outbound = handle.outbound;

    let span = session_span!(session_id = %id);
    let writer = tokio::spawn(
        async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    debug!(error = %e, "Session write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .instrument(span.clone()),
    );

    async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) if message.is_text() => {
                    if let Ok(text) = message.to_str() {
                        ctx.handle_client_text(id, text).await;
                    }
                }
                Ok(message) if message.is_close() => break,
                Ok(_) => {}
                Err(e) => {
                    let err = RelayError::SessionIo {
                        session_id: id,
                        message: e.to_string(),
                    };
                    warn!(error = %err, "Session read failed");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await;

    if ctx.hub.remove(id).await {
        ctx.metrics.session_closed();
    }
    // The writer ends once the hub has dropped the session's sender
    if let Err(e) = writer.await {
        debug!(error = %e, "Session writer ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::testing::MockTransport;

    fn context(transport: MockTransport) -> Arc<RelayContext<MockTransport>> {
        Arc::new(RelayContext::new(
            RelayConfig::default(),
            Arc::new(transport),
        ))
    }

    #[tokio::test]
    async fn test_health_is_unavailable_before_first_cycle() {
        let ctx = context(MockTransport::connected());
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_reflects_latest_snapshot() {
        let ctx = context(MockTransport::connected());
        ctx.health_monitor().tick().await;
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connected"], true);
    }

    #[tokio::test]
    async fn test_ready_follows_connection() {
        let ctx = context(MockTransport::new());
        let response = warp::test::request()
            .path("/ready")
            .reply(&routes(ctx.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        ctx.transport.set_connected(true);
        let response = warp::test::request()
            .path("/ready")
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let ctx = context(MockTransport::new());
        let response = warp::test::request()
            .path("/live")
            .reply(&routes(ctx))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
