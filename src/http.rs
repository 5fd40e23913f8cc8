//! HTTP 组装：路由、请求追踪、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::routing::any;
use axum::{Router, middleware, response::Response};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span, warn};

use crate::credentials::CredentialStore;
use crate::locking::LockManager;
use crate::paths::{PASSWORD_HEADER, PathPolicy, USERNAME_HEADER};
use crate::upload::{UploadConfig, upload_handler};

/// 路由所需的共享状态。
pub struct Shared {
    pub store: Arc<CredentialStore>,
    pub policy: Arc<PathPolicy>,
    pub upload: Arc<UploadConfig>,
    pub locks: Arc<LockManager>,
}

/// 构建完整路由：`/upload` 入口、可选静态目录与中间件。
pub fn build_router(shared: Shared, static_dir: Option<&Path>, cors_origins: Option<&str>) -> Router {
    let mut app = Router::new().route(
        "/upload",
        any(upload_handler).layer(DefaultBodyLimit::disable()),
    );
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app = app
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = %client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(shared.store))
        .layer(Extension(shared.policy))
        .layer(Extension(shared.upload))
        .layer(Extension(shared.locks));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

/// 构建 CORS Layer：仅放行上传所需的方法与身份请求头。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let mut origins = Vec::new();
    for origin in cors_origins?.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        match HeaderValue::from_str(origin) {
            Ok(value) => origins.push(value),
            Err(_) => warn!(origin, "invalid cors origin ignored"),
        }
    }
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::POST, Method::PUT])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static(USERNAME_HEADER),
                HeaderName::from_static(PASSWORD_HEADER),
            ]),
    )
}

/// 追踪 span 使用的客户端地址：优先取 `x-forwarded-for` 的第一跳，否则取连接对端。
fn client_ip<B>(request: &Request<B>) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
