//! Framework listener: built-in endpoints plus the routes of embedded apps

use crate::context::{AppContext, PKG_NAME, VERSION};
use crate::error::{json_error_response, ApiErrorCode};
use crate::loader::AppRequest;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// HTTP server for the main framework port
pub struct FrameworkServer {
    bind_addr: SocketAddr,
    context: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrameworkServer {
    pub fn new(bind_addr: SocketAddr, context: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            base_path = %self.context.config.server.base_path,
            "Framework server listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let ctx = Arc::clone(&context);
                                    async move { handle_request(req, ctx).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Framework connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Framework server shutting down");
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
    context: Arc<AppContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "Request");

    if let Some(response) = builtin_route(&context, &method, &path).await {
        return Ok(response);
    }

    let Some(matched) = context.router.find(&method, &path) else {
        return Ok(not_found(&context, &path));
    };

    let body = req.collect().await?.to_bytes().to_vec();
    let app_request = AppRequest {
        method,
        path,
        query,
        params: matched.params,
        body,
        app: matched.app,
    };
    let app_response = (matched.handler)(&app_request);

    Ok(json_response(app_response.status, &app_response.body))
}

/// Framework endpoints directly under the base path
async fn builtin_route(context: &AppContext, method: &Method, path: &str) -> Option<Response<Full<Bytes>>> {
    if *method != Method::GET {
        return None;
    }
    let base = &context.config.server.base_path;
    let rest = path.strip_prefix(base.trim_end_matches('/'))?;

    let response = match rest.trim_end_matches('/') {
        "" => {
            let apps: Vec<serde_json::Value> = context
                .registry
                .embedded()
                .iter()
                .map(|a| json!({ "name": a.name, "path": a.mount_path(base), "type": "embedded" }))
                .chain(context.registry.isolated().iter().map(|a| {
                    json!({ "name": a.name, "path": a.mount_path(base), "type": "isolated", "port": a.port })
                }))
                .collect();
            json_response(
                StatusCode::OK,
                &json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                    "apps": apps,
                }),
            )
        }
        "/health" => json_response(StatusCode::OK, &json!({ "status": "healthy" })),
        "/apps" => {
            let status = context.status().await;
            json_response(
                StatusCode::OK,
                &json!({
                    "embedded": status["embedded"],
                    "isolated": status["isolated"],
                    "failed": status["failed"],
                }),
            )
        }
        "/status" => json_response(StatusCode::OK, &context.status().await),
        _ => return None,
    };
    Some(response)
}

fn not_found(context: &AppContext, path: &str) -> Response<Full<Bytes>> {
    let base = &context.config.server.base_path;
    let isolated = context.registry.isolated().into_iter().find(|app| {
        let mount = app.mount_path(base);
        path == mount || path.starts_with(&format!("{}/", mount))
    });

    match isolated {
        Some(app) => json_error_response(
            ApiErrorCode::NotFound,
            format!(
                "'{}' runs as an isolated app on port {}; route through the reverse proxy",
                app.name,
                app.port.unwrap_or_default()
            ),
        ),
        None => json_error_response(ApiErrorCode::NotFound, format!("no route for {}", path)),
    }
}
