//! 认证网关、登录处理与登录限流。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Json as JsonResponse;
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::storage::Storage;
use crate::token::TokenService;
use crate::users::{CredentialStore, is_valid_username};

pub struct AuthState {
    pub tokens: TokenService,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

/// 认证中间件：校验 Bearer 令牌并注入请求范围的 Principal。
///
/// 公开路由放行匿名请求；管理前缀额外要求管理员标记，
/// 校验失败在到达文件层之前就终止请求。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let path = req.uri().path();
    if is_public_path(path) {
        return Ok(next.run(req).await);
    }

    let Some(TypedHeader(bearer)) = bearer else {
        return Err(ApiError::Unauthenticated("missing bearer token".into()));
    };
    let Some(principal) = auth.tokens.validate(bearer.token()) else {
        warn!(path, "rejected invalid bearer token");
        return Err(ApiError::Unauthenticated("invalid or expired token".into()));
    };
    if path.starts_with("/api/admin") && !principal.is_admin {
        warn!(path, username = principal.username, "admin route denied");
        return Err(ApiError::Unauthorized("admin privilege required".into()));
    }

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn is_public_path(path: &str) -> bool {
    if path == "/api/auth/login" || path == "/api/auth/register" || path == "/api/version" {
        return true;
    }
    if path.starts_with("/api/public/") {
        return true;
    }
    !path.starts_with("/api/")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResponse {
    token: String,
    is_admin: bool,
}

/// 登录接口：校验凭据并签发令牌。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(users): Extension<Arc<dyn CredentialStore>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Result<JsonResponse<LoginResponse>, ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());

    if let Some(retry_after) = check_login_rate_limit(&auth, client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let Some(account) = users.verify_credentials(&payload.username, &payload.password) else {
        register_login_failure(&auth, client_ip).await;
        warn!(username = payload.username, "login failed");
        return Err(ApiError::Unauthenticated("login failed".into()));
    };

    clear_login_failures(&auth, client_ip).await;
    let token = auth
        .tokens
        .issue(&account.username, account.is_admin)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(username = account.username, "login ok");

    Ok(JsonResponse(LoginResponse {
        token,
        is_admin: account.is_admin,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterRequest {
    username: String,
    password: String,
}

/// 公开注册接口：创建普通账号并建立其存储根。
/// 管理员账号只能经管理端创建。
pub async fn auth_register(
    Extension(users): Extension<Arc<dyn CredentialStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<StatusCode, ApiError> {
    if !is_valid_username(&payload.username) {
        return Err(ApiError::BadRequest("invalid username".into()));
    }
    if payload.password.is_empty() {
        return Err(ApiError::BadRequest("password is required".into()));
    }
    if !users.create_account(&payload.username, &payload.password, false) {
        return Err(ApiError::AlreadyExists("user already exists".into()));
    }
    if let Err(err) = storage.user_root(&payload.username).await {
        warn!(username = payload.username, error = ?err, "failed to create user storage root");
    }
    info!(username = payload.username, "user registered");
    Ok(StatusCode::CREATED)
}

async fn check_login_rate_limit(auth: &AuthState, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs());
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthState, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthState, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthState) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
