//! 账号凭据存储协作接口、内存实现与管理端处理器。

use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::storage::Storage;

/// 凭据存储返回的账号投影（不含口令）。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    pub is_admin: bool,
}

/// 凭据存储协作接口；口令散列与持久化由实现方负责。
pub trait CredentialStore: Send + Sync {
    fn verify_credentials(&self, username: &str, password: &str) -> Option<Account>;
    fn create_account(&self, username: &str, password: &str, is_admin: bool) -> bool;
    fn list_accounts(&self) -> Vec<Account>;
    fn delete_account(&self, username: &str) -> bool;
    fn set_admin_flag(&self, username: &str, is_admin: bool) -> bool;
    fn change_password(&self, username: &str, password: &str) -> bool;
}

#[derive(Debug)]
struct StoredAccount {
    password: String,
    is_admin: bool,
}

/// 进程生命周期内的内存凭据存储。
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    accounts: RwLock<HashMap<String, StoredAccount>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置初始管理员账号。
    pub fn seeded(username: &str, password: &str) -> Self {
        let store = Self::new();
        store.create_account(username, password, true);
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StoredAccount>> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredAccount>> {
        self.accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn verify_credentials(&self, username: &str, password: &str) -> Option<Account> {
        let accounts = self.read();
        let stored = accounts.get(username)?;
        if stored.password != password {
            return None;
        }
        Some(Account {
            username: username.to_string(),
            is_admin: stored.is_admin,
        })
    }

    fn create_account(&self, username: &str, password: &str, is_admin: bool) -> bool {
        let mut accounts = self.write();
        if accounts.contains_key(username) {
            return false;
        }
        accounts.insert(
            username.to_string(),
            StoredAccount {
                password: password.to_string(),
                is_admin,
            },
        );
        true
    }

    fn list_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .read()
            .iter()
            .map(|(username, stored)| Account {
                username: username.clone(),
                is_admin: stored.is_admin,
            })
            .collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        accounts
    }

    fn delete_account(&self, username: &str) -> bool {
        self.write().remove(username).is_some()
    }

    fn set_admin_flag(&self, username: &str, is_admin: bool) -> bool {
        match self.write().get_mut(username) {
            Some(stored) => {
                stored.is_admin = is_admin;
                true
            }
            None => false,
        }
    }

    fn change_password(&self, username: &str, password: &str) -> bool {
        match self.write().get_mut(username) {
            Some(stored) => {
                stored.password = password.to_string();
                true
            }
            None => false,
        }
    }
}

/// 用户名必须可以安全地用作单个目录名。
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && !username.starts_with('.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountCreateBody {
    username: String,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

#[derive(Deserialize)]
pub(crate) struct PasswordBody {
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoleBody {
    is_admin: bool,
}

/// 管理端：创建账号并建立其存储根。
pub async fn admin_create_user(
    Extension(users): Extension<Arc<dyn CredentialStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    Json(payload): Json<AccountCreateBody>,
) -> Result<(StatusCode, JsonResponse<Account>), ApiError> {
    if !is_valid_username(&payload.username) {
        return Err(ApiError::BadRequest("invalid username".into()));
    }
    if payload.password.is_empty() {
        return Err(ApiError::BadRequest("password is required".into()));
    }
    if !users.create_account(&payload.username, &payload.password, payload.is_admin) {
        return Err(ApiError::AlreadyExists("user already exists".into()));
    }
    if let Err(err) = storage.user_root(&payload.username).await {
        warn!(username = payload.username, error = ?err, "failed to create user storage root");
    }
    info!(
        username = payload.username,
        is_admin = payload.is_admin,
        "user created"
    );
    Ok((
        StatusCode::CREATED,
        JsonResponse(Account {
            username: payload.username,
            is_admin: payload.is_admin,
        }),
    ))
}

/// 管理端：列出全部账号（不含口令）。
pub async fn admin_list_users(
    Extension(users): Extension<Arc<dyn CredentialStore>>,
) -> JsonResponse<Vec<Account>> {
    JsonResponse(users.list_accounts())
}

/// 管理端：删除账号；用户文件保留在磁盘上。
pub async fn admin_delete_user(
    Path(username): Path<String>,
    Extension(users): Extension<Arc<dyn CredentialStore>>,
) -> Result<StatusCode, ApiError> {
    if !users.delete_account(&username) {
        return Err(ApiError::NotFound("user not found".into()));
    }
    info!(username, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// 管理端：修改口令。
pub async fn admin_change_password(
    Path(username): Path<String>,
    Extension(users): Extension<Arc<dyn CredentialStore>>,
    Json(payload): Json<PasswordBody>,
) -> Result<StatusCode, ApiError> {
    if payload.password.is_empty() {
        return Err(ApiError::BadRequest("password is required".into()));
    }
    if !users.change_password(&username, &payload.password) {
        return Err(ApiError::NotFound("user not found".into()));
    }
    info!(username, "password changed");
    Ok(StatusCode::NO_CONTENT)
}

/// 管理端：设置或清除管理员标记。
pub async fn admin_set_role(
    Path(username): Path<String>,
    Extension(users): Extension<Arc<dyn CredentialStore>>,
    Json(payload): Json<RoleBody>,
) -> Result<StatusCode, ApiError> {
    if !users.set_admin_flag(&username, payload.is_admin) {
        return Err(ApiError::NotFound("user not found".into()));
    }
    info!(username, is_admin = payload.is_admin, "role updated");
    Ok(StatusCode::NO_CONTENT)
}

/// 公开探针：是否已存在任何账号。
pub async fn users_exist(
    Extension(users): Extension<Arc<dyn CredentialStore>>,
) -> JsonResponse<bool> {
    JsonResponse(!users.list_accounts().is_empty())
}
