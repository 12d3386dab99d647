use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::ErrorKind;

use crate::sandbox;

/// Per-user sandboxed file store rooted at a shared base directory.
///
/// Every operation takes the caller's username and one or more relative
/// paths; paths are resolved through [`sandbox::resolve`] before any
/// filesystem call. The user's storage root (`base/username`) is created
/// lazily on first reference.
#[derive(Clone, Debug)]
pub struct Storage {
    base: PathBuf,
}

impl Storage {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub async fn ensure_base(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base).await
    }

    /// 确保并返回该用户的存储根。
    pub async fn user_root(&self, username: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(username).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(StoreError::InvalidPath),
        }
        let root = self.base.join(username);
        fs::create_dir_all(&root).await?;
        Ok(root)
    }

    /// 列出目录直接子项，目录在前、名称不区分大小写排序。
    pub async fn list_dir(
        &self,
        username: &str,
        relative: Option<&str>,
    ) -> Result<Vec<FileEntry>, StoreError> {
        let root = self.user_root(username).await?;
        let target = sandbox::resolve(&root, relative.unwrap_or(""), false).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(StoreError::NotFound);
        }

        let rel_base = normalized_relative(relative);
        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = match &rel_base {
                Some(base) => format!("{base}/{name}"),
                None => name.clone(),
            };
            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(|duration| duration.as_millis() as i64);

            entries.push(FileEntry {
                name,
                path,
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() {
                    None
                } else {
                    Some(metadata.len())
                },
                last_modified,
            });
        }

        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// 解析已存在的条目，返回其规范路径与元数据。
    pub async fn resolve_entry(
        &self,
        username: &str,
        relative: &str,
    ) -> Result<(PathBuf, std::fs::Metadata), StoreError> {
        let root = self.user_root(username).await?;
        let target = sandbox::resolve(&root, relative, false).await?;
        let metadata = fs::metadata(&target).await?;
        Ok((target, metadata))
    }

    /// 解析上传目标：目录与文件名合并后整体过沙箱，父目录按需创建。
    pub async fn resolve_upload_target(
        &self,
        username: &str,
        dir_relative: Option<&str>,
        file_name: &str,
    ) -> Result<PathBuf, StoreError> {
        if file_name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        let root = self.user_root(username).await?;
        let combined = match normalized_relative(dir_relative) {
            Some(dir) => format!("{dir}/{file_name}"),
            None => file_name.to_string(),
        };
        let target = sandbox::resolve(&root, &combined, true).await?;
        if target == fs::canonicalize(&root).await? {
            return Err(StoreError::InvalidName);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::metadata(&target).await {
            Ok(existing) if existing.is_dir() => return Err(StoreError::AlreadyExists),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::Io(err)),
        }
        Ok(target)
    }

    /// 创建目录及缺失的父级；目标已存在（文件或目录）时拒绝。
    pub async fn create_dir(&self, username: &str, relative: &str) -> Result<(), StoreError> {
        let root = self.user_root(username).await?;
        let target = sandbox::resolve(&root, relative, true).await?;
        if target == fs::canonicalize(&root).await? {
            return Err(StoreError::AlreadyExists);
        }
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StoreError::AlreadyExists);
        }
        fs::create_dir_all(&target).await?;
        Ok(())
    }

    /// 递归删除文件或目录；存储根自身不可删除。
    pub async fn delete_path(&self, username: &str, relative: &str) -> Result<(), StoreError> {
        let root = self.user_root(username).await?;
        let target = sandbox::resolve(&root, relative, false).await?;
        if target == fs::canonicalize(&root).await? {
            return Err(StoreError::InvalidPath);
        }
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// 同父目录内改名；新名称不得含分隔符或父级段。
    pub async fn rename_entry(
        &self,
        username: &str,
        old_path: &str,
        new_name: &str,
    ) -> Result<(), StoreError> {
        if !is_valid_entry_name(new_name) {
            return Err(StoreError::InvalidName);
        }
        let root = self.user_root(username).await?;
        let old = sandbox::resolve(&root, old_path, false).await?;
        if old == fs::canonicalize(&root).await? {
            return Err(StoreError::InvalidPath);
        }
        let Some(parent) = old.parent() else {
            return Err(StoreError::InvalidPath);
        };
        let target = parent.join(new_name);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StoreError::AlreadyExists);
        }
        fs::rename(&old, &target).await?;
        Ok(())
    }

    /// 移动条目：源与目标各自独立过沙箱，目标父目录按需创建。
    pub async fn move_entry(
        &self,
        username: &str,
        source: &str,
        target: &str,
    ) -> Result<(), StoreError> {
        let root = self.user_root(username).await?;
        let from = sandbox::resolve(&root, source, false).await?;
        let canonical_root = fs::canonicalize(&root).await?;
        if from == canonical_root {
            return Err(StoreError::InvalidPath);
        }
        let to = sandbox::resolve(&root, target, true).await?;
        if to == canonical_root || to.starts_with(&from) {
            return Err(StoreError::InvalidPath);
        }
        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(StoreError::AlreadyExists);
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }
}

fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

fn normalized_relative(relative: Option<&str>) -> Option<String> {
    let value = relative?.replace('\\', "/");
    let value = value.trim().trim_matches('/');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug)]
pub enum StoreError {
    InvalidPath,
    InvalidName,
    NotFound,
    AlreadyExists,
    Io(io::Error),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        if err.kind() == ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(err)
        }
    }
}

/// 目录列举返回的条目投影；按请求时的文件系统状态即时计算。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub last_modified: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let base = temp.path().join("data");
        std::fs::create_dir_all(&base).expect("create base");
        (temp, Storage::new(base))
    }

    #[tokio::test]
    async fn user_root_is_created_lazily_and_validated() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("user root");
        assert!(root.is_dir());
        assert!(matches!(
            storage.user_root("a/b").await,
            Err(StoreError::InvalidPath)
        ));
        assert!(matches!(
            storage.user_root("..").await,
            Err(StoreError::InvalidPath)
        ));
        assert!(matches!(
            storage.user_root("").await,
            Err(StoreError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn mkdir_then_list_shows_directory() {
        let (_temp, storage) = make_storage();
        storage.create_dir("alice", "docs/sub").await.expect("mkdir");

        let entries = storage.list_dir("alice", Some("docs")).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "sub");
        assert!(entries[0].is_directory);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[0].path, "docs/sub");
    }

    #[tokio::test]
    async fn mkdir_rejects_existing_target() {
        let (_temp, storage) = make_storage();
        storage.create_dir("alice", "docs").await.expect("mkdir");
        assert!(matches!(
            storage.create_dir("alice", "docs").await,
            Err(StoreError::AlreadyExists)
        ));

        let root = storage.user_root("alice").await.expect("root");
        std::fs::write(root.join("file.txt"), b"x").expect("write");
        assert!(matches!(
            storage.create_dir("alice", "file.txt").await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn list_of_missing_or_file_path_is_not_found() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");
        std::fs::write(root.join("file.txt"), b"x").expect("write");

        assert!(matches!(
            storage.list_dir("alice", Some("absent")).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            storage.list_dir("alice", Some("file.txt")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_sorts_directories_first_then_name() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");
        std::fs::write(root.join("b.txt"), b"b").expect("write");
        std::fs::write(root.join("A.txt"), b"a").expect("write");
        std::fs::create_dir(root.join("zdir")).expect("mkdir");

        let entries = storage.list_dir("alice", None).await.expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "A.txt", "b.txt"]);
        assert_eq!(entries[1].size, Some(1));
    }

    #[tokio::test]
    async fn delete_is_recursive_and_not_found_when_retried() {
        let (_temp, storage) = make_storage();
        storage.create_dir("alice", "docs/sub").await.expect("mkdir");
        let root = storage.user_root("alice").await.expect("root");
        std::fs::write(root.join("docs/sub/a.txt"), b"a").expect("write");
        std::fs::write(root.join("keep.txt"), b"k").expect("write");

        storage.delete_path("alice", "docs").await.expect("delete");
        assert!(matches!(
            storage.delete_path("alice", "docs").await,
            Err(StoreError::NotFound)
        ));
        // 重试不影响兄弟条目
        assert!(root.join("keep.txt").is_file());
    }

    #[tokio::test]
    async fn storage_root_itself_cannot_be_deleted() {
        let (_temp, storage) = make_storage();
        storage.user_root("alice").await.expect("root");
        assert!(matches!(
            storage.delete_path("alice", "").await,
            Err(StoreError::InvalidPath)
        ));
        assert!(matches!(
            storage.delete_path("alice", ".").await,
            Err(StoreError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn rename_stays_in_parent_and_rejects_collisions() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");
        storage.create_dir("alice", "docs").await.expect("mkdir");
        std::fs::write(root.join("docs/a.txt"), b"a").expect("write");
        std::fs::write(root.join("docs/b.txt"), b"b").expect("write");

        assert!(matches!(
            storage.rename_entry("alice", "docs/a.txt", "sub/c.txt").await,
            Err(StoreError::InvalidName)
        ));
        assert!(matches!(
            storage.rename_entry("alice", "docs/a.txt", "..").await,
            Err(StoreError::InvalidName)
        ));
        assert!(matches!(
            storage.rename_entry("alice", "docs/a.txt", "b.txt").await,
            Err(StoreError::AlreadyExists)
        ));
        // 碰撞失败不动原条目
        assert_eq!(std::fs::read(root.join("docs/a.txt")).expect("read"), b"a");

        storage
            .rename_entry("alice", "docs/a.txt", "c.txt")
            .await
            .expect("rename");
        assert!(root.join("docs/c.txt").is_file());
        assert!(!root.join("docs/a.txt").exists());

        assert!(matches!(
            storage.rename_entry("alice", "ghost.txt", "x.txt").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn move_relocates_and_creates_target_parents() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");
        storage.create_dir("alice", "inbox").await.expect("mkdir");
        std::fs::write(root.join("inbox/a.txt"), b"a").expect("write");

        storage
            .move_entry("alice", "inbox/a.txt", "archive/2026/a-renamed.txt")
            .await
            .expect("move");
        assert_eq!(
            std::fs::read(root.join("archive/2026/a-renamed.txt")).expect("read"),
            b"a"
        );
        assert!(!root.join("inbox/a.txt").exists());

        assert!(matches!(
            storage.move_entry("alice", "ghost", "x").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn move_rejects_existing_target_and_self_nesting() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");
        storage.create_dir("alice", "docs").await.expect("mkdir");
        std::fs::write(root.join("a.txt"), b"a").expect("write");
        std::fs::write(root.join("b.txt"), b"b").expect("write");

        assert!(matches!(
            storage.move_entry("alice", "a.txt", "b.txt").await,
            Err(StoreError::AlreadyExists)
        ));
        assert!(matches!(
            storage.move_entry("alice", "docs", "docs/inner").await,
            Err(StoreError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn upload_target_resolves_combined_path() {
        let (_temp, storage) = make_storage();
        let root = storage.user_root("alice").await.expect("root");

        let target = storage
            .resolve_upload_target("alice", Some("docs"), "report.pdf")
            .await
            .expect("target");
        assert!(target.ends_with("docs/report.pdf"));
        assert!(root.join("docs").is_dir(), "parent should be created");

        assert!(matches!(
            storage
                .resolve_upload_target("alice", Some("docs"), "../../evil.txt")
                .await,
            Err(StoreError::InvalidPath)
        ));
        assert!(matches!(
            storage.resolve_upload_target("alice", None, "").await,
            Err(StoreError::InvalidName)
        ));
        assert!(matches!(
            storage.resolve_upload_target("alice", None, "docs").await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn users_cannot_see_each_other() {
        let (_temp, storage) = make_storage();
        let alice_root = storage.user_root("alice").await.expect("alice root");
        std::fs::write(alice_root.join("private.txt"), b"p").expect("write");
        storage.user_root("bob").await.expect("bob root");

        let entries = storage.list_dir("bob", None).await.expect("list");
        assert!(entries.is_empty());
        assert!(matches!(
            storage.resolve_entry("bob", "../alice/private.txt").await,
            Err(StoreError::InvalidPath)
        ));
    }
}
