//! Request Handler boundary: a minimal `hyper` HTTP/1.1 server exposing `POST /execute`,
//! `GET /health`, and `GET /metrics`. Routing is manual method/path-segment matching, the same
//! weight class the rest of this service's transport needs — three routes don't warrant a full
//! web framework.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::engine::ExecutionRequest;
use crate::registry::PoolRegistry;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct AppState {
    pub registry: Arc<PoolRegistry>,
    pub shutting_down: AtomicBool,
}

fn full(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .expect("building a response from a fixed status/body cannot fail")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
    #[derive(Serialize)]
    struct ErrBody {
        error: String,
    }
    json_response(status, &ErrBody { error: message.into() })
}

async fn read_json_body<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, String> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| format!("failed to read request body: {e}"))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid request body: {e}"))
}

async fn handle_request(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<BoxBody>, Infallible> {
    if state.shutting_down.load(Ordering::Relaxed) {
        return Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "service is shutting down"));
    }

    let path_segments: Vec<&str> = req.uri().path().trim_matches('/').split('/').collect();

    let response = match (req.method(), path_segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(StatusCode::OK, &serde_json::json!({ "status": "healthy" })),
        (&Method::GET, ["metrics"]) => {
            let snapshot = state.registry.metrics_snapshot().await;
            json_response(StatusCode::OK, &snapshot)
        }
        (&Method::POST, ["execute"]) => match read_json_body::<ExecutionRequest>(req).await {
            Ok(request) if request.script.trim().is_empty() => {
                error_response(StatusCode::BAD_REQUEST, "script must not be empty")
            }
            Ok(request) => {
                let result = state.registry.dispatch(request).await;
                json_response(StatusCode::OK, &result)
            }
            Err(message) => error_response(StatusCode::BAD_REQUEST, message),
        },
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

pub async fn run_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| handle_request(Arc::clone(&state), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "connection error");
            }
        });
    }
}
