//! Control API
//!
//! Small JSON-over-HTTP surface bound to the loopback RPC address. The CLI
//! is its only intended client. Mutating routes operate on one app at a
//! time; status routes render the same reports the CLI prints.

use crate::app::App;
use crate::error::Error;
use crate::report::{AppReport, DEFAULT_TAIL};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct RpcServer {
    apps: Arc<HashMap<String, Arc<App>>>,
    bind_addr: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl RpcServer {
    pub fn new(
        apps: Arc<HashMap<String, Arc<App>>>,
        bind_addr: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            apps,
            bind_addr,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let apps = Arc::clone(&self.apps);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let apps = Arc::clone(&apps);
                                    async move { handle_request(req, apps).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %peer, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    apps: Arc<HashMap<String, Arc<App>>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["status"]) => status_all(&apps),
        (Method::GET, ["status", name]) => status_one(&apps, name, &query),
        (Method::POST, ["apps", name, "start"]) => start_app(&apps, name),
        (Method::POST, ["apps", name, "stop"]) => stop_app(&apps, name, &query),
        (Method::POST, ["apps", name, "restart"]) => start_app(&apps, name),
        _ => message_response(StatusCode::NOT_FOUND, "unknown route"),
    };

    Ok(response)
}

fn status_all(apps: &HashMap<String, Arc<App>>) -> Response<Full<Bytes>> {
    let mut reports: Vec<AppReport> = apps.values().map(|app| app.report(DEFAULT_TAIL)).collect();
    reports.sort_by(|a, b| a.name.cmp(&b.name));
    json_response(StatusCode::OK, &reports)
}

fn status_one(apps: &HashMap<String, Arc<App>>, name: &str, query: &str) -> Response<Full<Bytes>> {
    let Some(app) = apps.get(name) else {
        return message_response(StatusCode::NOT_FOUND, "unknown app");
    };
    let tail = query_param(query, "n")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TAIL);
    json_response(StatusCode::OK, &app.report(tail))
}

fn start_app(apps: &HashMap<String, Arc<App>>, name: &str) -> Response<Full<Bytes>> {
    let Some(app) = apps.get(name) else {
        return message_response(StatusCode::NOT_FOUND, "unknown app");
    };
    match app.start_new_instance() {
        Ok(instance_id) => {
            info!(app = name, instance = instance_id, "Instance started via control API");
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "instance": instance_id }),
            )
        }
        Err(e) => {
            error!(app = name, error = %e, "Failed to start instance");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn stop_app(apps: &HashMap<String, Arc<App>>, name: &str, query: &str) -> Response<Full<Bytes>> {
    let Some(app) = apps.get(name) else {
        return message_response(StatusCode::NOT_FOUND, "unknown app");
    };
    let instance_id = query_param(query, "instance").and_then(|v| v.parse().ok());
    let kill = query_param(query, "kill").as_deref() == Some("true");

    match app.stop_instances(instance_id, kill) {
        Ok(()) => message_response(StatusCode::OK, "ok"),
        Err(Error::InstanceNotRunning) => {
            message_response(StatusCode::CONFLICT, "no matching running instance")
        }
        Err(e) => message_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn message_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "message": message });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response")
}
