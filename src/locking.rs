//! 按用户串行化结构性修改的互斥锁表。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

/// Asynchronous mutexes keyed by username, one per storage root.
///
/// Entries are created on first use and live for the process lifetime,
/// bounded by the number of distinct usernames.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在超时时间内获取某用户的修改锁，超时返回 Err。
    ///
    /// 返回的 guard 在任意退出路径上随 drop 释放。
    pub async fn acquire_with_timeout(
        &self,
        username: &str,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, ()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_user_is_serialized() {
        let locks = UserLocks::new();
        let guard = locks
            .acquire_with_timeout("alice", Duration::from_secs(1))
            .await
            .expect("first acquire");
        let blocked = locks
            .acquire_with_timeout("alice", Duration::from_millis(50))
            .await;
        assert!(blocked.is_err());
        drop(guard);
        locks
            .acquire_with_timeout("alice", Duration::from_secs(1))
            .await
            .expect("acquire after release");
    }

    #[tokio::test]
    async fn different_users_do_not_block_each_other() {
        let locks = UserLocks::new();
        let _alice = locks
            .acquire_with_timeout("alice", Duration::from_secs(1))
            .await
            .expect("alice lock");
        locks
            .acquire_with_timeout("bob", Duration::from_millis(50))
            .await
            .expect("bob lock should be independent");
    }
}
