//! # Telemetry module
//!
//! This module expose the health and metrics endpoints of the operator over a
//! small http server

use std::{convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{gather, opts, register_counter_vec, CounterVec, Encoder, TextEncoder};
use tracing::{error, info};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request",
            "number of request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_duration",
            "duration of request handled by the server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'kubernetes_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("failed to serialize metrics, {0}")]
    Encode(prometheus::Error),
    #[cfg(feature = "metrics")]
    #[error("failed to parse header value given by prometheus, {0}")]
    InvalidHeader(header::InvalidHeaderValue),
    #[error("failed to serve http requests, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

/// serves the telemetry endpoints on the given address until the task is
/// aborted
pub async fn serve(addr: SocketAddr) -> Result<(), Error> {
    let service = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req| async { Ok::<_, Infallible>(router(req).await) }))
    });

    info!(
        addr = addr.to_string(),
        "Start to listen for http request"
    );

    Server::try_bind(&addr)
        .map_err(Error::Serve)?
        .serve(service)
        .await
        .map_err(Error::Serve)
}

/// dispatches the request, a failing handler is answered with an internal
/// server error
pub async fn router(req: Request<Body>) -> Response<Body> {
    let begin = Instant::now();
    let method = req.method().to_owned();
    let path = req.uri().path().to_string();

    let res = match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => Ok(healthz()),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics(),
        _ => Ok(not_found()),
    };

    let res = res.unwrap_or_else(|err| {
        error!(
            method = method.as_str(),
            path = &path,
            error = err.to_string(),
            "Failed to handle request",
        );

        let mut res = Response::new(Body::from(err.to_string()));
        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        res
    });

    let duration = Instant::now().duration_since(begin).as_micros();
    info!(
        method = method.as_str(),
        path = &path,
        status = res.status().as_u16(),
        duration = duration as u64,
        "Receive request",
    );

    #[cfg(feature = "metrics")]
    {
        let status = res.status().as_u16().to_string();
        SERVER_REQUEST
            .with_label_values(&[method.as_str(), &path, &status])
            .inc();
        SERVER_REQUEST_DURATION
            .with_label_values(&[method.as_str(), &path, &status, "us"])
            .inc_by(duration as f64);
    }

    res
}

pub fn healthz() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

pub fn not_found() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

#[cfg(feature = "metrics")]
/// returns the encoded metrics gathered from the application
pub fn metrics() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];
    encoder.encode(&gather(), &mut buf).map_err(Error::Encode)?;

    let mut res = Response::new(Body::from(buf));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::InvalidHeader)?,
    );

    Ok(res)
}
