//! Per-app reverse proxy
//!
//! One listener per app on its external host:port. Every request reserves the
//! app's active instance, gets its target rewritten to the instance's
//! internal port and is forwarded through a pooled hyper client. The
//! reservation is an RAII guard, so the in-flight count is released on every
//! exit path. No active instance means an immediate empty 503; the proxy
//! never routes to a draining or dead instance.

use crate::app::{App, Reservation};
use crate::error::Error;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Header carrying the client address to the instance.
const X_REAL_IP: &str = "x-real-ip";

/// External HTTP entry point for one app.
pub struct ProxyServer {
    app: Arc<App>,
    shutdown_rx: watch::Receiver<bool>,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyServer {
    pub fn new(app: Arc<App>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // The legacy client keeps a per-host idle pool, which covers the
        // upstream leg to whichever instance is currently active.
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            app,
            shutdown_rx,
            client,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.app.config().external_host_port();
        let listener = TcpListener::bind(&addr).await?;
        info!(app = %self.app.name(), %addr, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let app = Arc::clone(&self.app);
                            let client = self.client.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, client_addr, app, client).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(app = %self.app.name(), error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(app = %self.app.name(), "Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    client_addr: SocketAddr,
    app: Arc<App>,
    client: Client<HttpConnector, Incoming>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        let client = client.clone();
        async move { handle_request(req, app, client, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    app: Arc<App>,
    client: Client<HttpConnector, Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Selecting the target and pinning it are atomic with respect to
    // concurrent promotions; from here the instance stays valid even if it
    // is displaced mid-request.
    let reservation = match app.reserve_instance() {
        Ok(reservation) => reservation,
        Err(Error::NoActiveInstances) => {
            debug!(app = %app.name(), "No active instance, rejecting request");
            return Ok(empty_response(StatusCode::SERVICE_UNAVAILABLE));
        }
        Err(e) => {
            error!(app = %app.name(), error = %e, "Failed to reserve instance");
            return Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("http://{}{}", reservation.internal_host_port(), path_and_query);
    match target.parse() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            error!(app = %app.name(), %target, error = %e, "Invalid upstream target");
            return Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        req.headers_mut().insert(X_REAL_IP, value);
    }

    match client.request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            // The reservation rides inside the response body: the instance
            // counts as in flight until the last frame is forwarded (or the
            // connection dies), not merely until the headers arrive.
            let body = ReservedBody {
                inner: body,
                _reservation: reservation,
            };
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            warn!(app = %app.name(), instance = reservation.instance_id(), error = %e,
                "Upstream request failed");
            Ok(empty_response(StatusCode::BAD_GATEWAY))
        }
    }
}

/// Response body that pins its instance reservation for its whole lifetime.
///
/// Dropping releases the in-flight count exactly once, whether the body was
/// streamed to completion or abandoned mid-transfer.
struct ReservedBody<B> {
    inner: B,
    _reservation: Reservation,
}

impl<B> Body for ReservedBody<B>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Unpin,
{
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}
