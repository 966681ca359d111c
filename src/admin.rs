//! Admin API: inspection and lifecycle actions for isolated apps

use crate::context::{AppContext, PKG_NAME, VERSION};
use crate::error::{json_error_response, ApiErrorCode, ErrorResponse};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn ok_response<T: Serialize>(data: T) -> Response<Full<Bytes>> {
    match serde_json::to_string(&ApiResponse::ok(data)) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ApiErrorCode::InternalError, e.to_string()),
    }
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<AppContext>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    context: Arc<AppContext>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&context);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, ctx, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// `/apps/{name}/{action}` split into its parts
fn app_action_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/apps/")?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((name, action))
}

async fn handle_admin_request<B>(
    req: Request<B>,
    context: Arc<AppContext>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Health and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(ok_response(serde_json::json!({ "status": "ok" }))),
        (&Method::GET, "/version") => {
            return Ok(ok_response(serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            })))
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => ok_response(context.status().await),

        (Method::GET, "/config") => ok_response(context.config.redacted()),

        (Method::GET, "/apps") => {
            let status = context.status().await;
            ok_response(serde_json::json!({
                "embedded": status["embedded"],
                "isolated": status["isolated"],
                "failed": status["failed"],
            }))
        }

        (Method::POST, path) if app_action_path(path).is_some() => {
            let (name, action) = app_action_path(path).unwrap_or_default();
            match context.control.execute(name, action).await {
                Ok(outcome) => ok_response(outcome),
                Err(e) => {
                    warn!(app = name, action, error = %e, "Admin action rejected");
                    ErrorResponse::from(&e).into_response()
                }
            }
        }

        (Method::GET, path) if path.starts_with("/apps/") => {
            let name = path.strip_prefix("/apps/").unwrap_or_default();
            match context.app_detail(name).await {
                Some(detail) => ok_response(detail),
                None => json_error_response(
                    ApiErrorCode::AppNotFound,
                    format!("app '{}' not found", name),
                ),
            }
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    };

    Ok(response)
}
