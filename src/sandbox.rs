//! 将不可信相对路径限定在某个存储根内的解析器。

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::storage::StoreError;

/// Resolves an untrusted relative path against a storage root.
///
/// The sub path is first filtered lexically: any parent-directory or
/// root component rejects it outright. The join result is then
/// canonicalized, resolving symlinks, and accepted only when the
/// canonical path is the root itself or lies under it component-wise
/// (`/data/bob-2` never satisfies a check against `/data/bob`).
///
/// With `allow_missing`, a not-yet-existing suffix is tolerated: the
/// deepest existing ancestor is canonicalized and containment-checked,
/// and the missing components (already filtered to plain names) are
/// appended to it. Without it, a missing entry is `NotFound`.
pub async fn resolve(
    root: &Path,
    sub_path: &str,
    allow_missing: bool,
) -> Result<PathBuf, StoreError> {
    let joined = root.join(lexical_normalize(sub_path)?);
    let canonical_root = fs::canonicalize(root).await?;

    let mut missing: Vec<OsString> = Vec::new();
    let mut current = joined.as_path();
    loop {
        match fs::canonicalize(current).await {
            Ok(canonical) => {
                if canonical != canonical_root && !canonical.starts_with(&canonical_root) {
                    return Err(StoreError::InvalidPath);
                }
                let mut resolved = canonical;
                for component in missing.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if !allow_missing {
                    return Err(StoreError::NotFound);
                }
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(StoreError::InvalidPath);
                };
                missing.push(name.to_os_string());
                current = parent;
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
    }
}

/// 逐个组件过滤：`..`、盘符与根组件直接拒绝，`.` 跳过。
/// 反斜杠统一按分隔符处理，避免 Windows 风格的穿越写法。
fn lexical_normalize(sub_path: &str) -> Result<PathBuf, StoreError> {
    let unified = sub_path.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidPath);
            }
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_root() -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("bob");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, root)
    }

    #[tokio::test]
    async fn rejects_parent_segments() {
        let (_temp, root) = make_root();
        for sub in ["..", "../x", "a/../../b", "..\\x"] {
            let result = resolve(&root, sub, true).await;
            assert!(
                matches!(result, Err(StoreError::InvalidPath)),
                "{sub} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn leading_slash_is_treated_as_root_relative() {
        let (_temp, root) = make_root();
        std::fs::create_dir_all(root.join("docs")).expect("mkdir docs");
        let resolved = resolve(&root, "/docs", false).await.expect("resolve");
        assert!(resolved.ends_with("docs"));
    }

    #[tokio::test]
    async fn empty_sub_path_resolves_to_root() {
        let (_temp, root) = make_root();
        let resolved = resolve(&root, "", false).await.expect("resolve root");
        assert_eq!(resolved, std::fs::canonicalize(&root).expect("canonicalize"));
    }

    #[tokio::test]
    async fn missing_leaf_requires_allow_missing() {
        let (_temp, root) = make_root();
        let result = resolve(&root, "absent.txt", false).await;
        assert!(matches!(result, Err(StoreError::NotFound)));

        let resolved = resolve(&root, "deep/nested/file.txt", true)
            .await
            .expect("missing suffix allowed");
        assert!(resolved.ends_with("deep/nested/file.txt"));
        assert!(resolved.starts_with(std::fs::canonicalize(&root).expect("canonicalize")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        use std::os::unix::fs::symlink;

        let (temp, root) = make_root();
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside dir");
        std::fs::write(outside.join("secret.txt"), b"secret").expect("write outside file");
        symlink(&outside, root.join("link")).expect("symlink");

        let result = resolve(&root, "link/secret.txt", false).await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
        let result = resolve(&root, "link/new.txt", true).await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sibling_with_root_prefix_name_is_rejected() {
        use std::os::unix::fs::symlink;

        let (temp, root) = make_root();
        let sibling = temp.path().join("bob-2");
        std::fs::create_dir_all(&sibling).expect("create sibling");
        symlink(&sibling, root.join("twin")).expect("symlink");

        let result = resolve(&root, "twin", false).await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_inside_sandbox_is_allowed() {
        use std::os::unix::fs::symlink;

        let (_temp, root) = make_root();
        let real = root.join("real");
        std::fs::create_dir_all(&real).expect("create real dir");
        std::fs::write(real.join("a.txt"), b"a").expect("write file");
        symlink(&real, root.join("alias")).expect("symlink");

        let resolved = resolve(&root, "alias/a.txt", false).await.expect("resolve");
        assert_eq!(
            resolved,
            std::fs::canonicalize(real.join("a.txt")).expect("canonicalize")
        );
    }
}
