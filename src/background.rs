//! 登录限流记录与归档临时文件的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::archive::cleanup_stale_archives;
use crate::auth::{AuthState, prune_login_attempts};
use crate::config::{
    ARCHIVE_CLEAN_INTERVAL_SECS, ARCHIVE_TEMP_TTL_SECS, LOGIN_PRUNE_INTERVAL_SECS,
};

/// 启动后台任务（登录记录清理与归档临时文件清理）。
pub fn spawn_background_tasks(auth: Arc<AuthState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOGIN_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_login_attempts(&auth).await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(ARCHIVE_CLEAN_INTERVAL_SECS));
        let ttl = Duration::from_secs(ARCHIVE_TEMP_TTL_SECS);
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_stale_archives(ttl).await {
                warn!(error = %err, "archive temp cleanup failed");
            }
        }
    });
}
