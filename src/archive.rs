//! 目录递归打包为 zip 的归档器。

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::config::{ARCHIVE_CHUNK_SIZE, ARCHIVE_TEMP_PREFIX};

/// 归档产物的临时文件句柄；drop 时尽力删除。
pub struct ArchiveHandle {
    path: PathBuf,
}

impl ArchiveHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// 归档临时目录的根路径。
pub fn archive_temp_root() -> PathBuf {
    std::env::temp_dir().join(ARCHIVE_TEMP_PREFIX)
}

/// 将目录递归打包到临时 zip 文件。
///
/// 顶层目录名即源目录名，每个文件一个条目，内容按固定大小分块写入。
/// 任何文件读取失败都会使整个归档失败并清理临时文件。
pub async fn archive_directory(directory: &Path) -> io::Result<ArchiveHandle> {
    let dir = directory.to_path_buf();
    let top = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());

    task::spawn_blocking(move || {
        let temp_root = archive_temp_root();
        std::fs::create_dir_all(&temp_root)?;
        let zip_path = temp_root.join(format!("{}.zip", Uuid::new_v4()));
        if let Err(err) = build_zip(&dir, &top, &zip_path) {
            let _ = std::fs::remove_file(&zip_path);
            return Err(err);
        }
        Ok(ArchiveHandle { path: zip_path })
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

fn build_zip(dir: &Path, top: &str, zip_path: &Path) -> io::Result<()> {
    let file = File::create(zip_path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);
    add_directory(&mut zip, dir, top, options)?;
    zip.finish().map_err(io::Error::other)?;
    Ok(())
}

fn add_directory(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
) -> io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_name = format!("{prefix}/{name}");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            add_directory(zip, &entry.path(), &entry_name, options)?;
        } else if file_type.is_file() {
            zip.start_file(entry_name.as_str(), options)
                .map_err(io::Error::other)?;
            let mut source = File::open(entry.path())?;
            let mut buffer = vec![0u8; ARCHIVE_CHUNK_SIZE];
            loop {
                let read = source.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                zip.write_all(&buffer[..read])?;
            }
        }
        // 符号链接不入包：沙箱内条目由本服务写入，不产生链接。
    }

    Ok(())
}

/// 清理超过存活期的归档临时文件。
pub async fn cleanup_stale_archives(ttl: Duration) -> io::Result<()> {
    let temp_root = archive_temp_root();
    if tokio::fs::metadata(&temp_root).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = tokio::fs::read_dir(&temp_root).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale archive");
            } else {
                info!(path = ?path, "removed stale archive");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;
    use zip::ZipArchive;

    #[tokio::test]
    async fn archive_preserves_subtree_under_directory_name() {
        let temp = tempdir().expect("tempdir");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(docs.join("sub")).expect("mkdir");
        std::fs::write(docs.join("report.pdf"), b"pdf-bytes").expect("write");
        std::fs::write(docs.join("sub/notes.txt"), b"notes").expect("write");

        let handle = archive_directory(&docs).await.expect("archive");
        let bytes = std::fs::read(handle.path()).expect("read zip");

        let mut zip = ZipArchive::new(Cursor::new(bytes)).expect("open zip");
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["docs/report.pdf", "docs/sub/notes.txt"]);

        let mut content = Vec::new();
        zip.by_name("docs/report.pdf")
            .expect("entry")
            .read_to_end(&mut content)
            .expect("read entry");
        assert_eq!(content, b"pdf-bytes");
    }

    #[tokio::test]
    async fn archive_handle_removes_temp_file_on_drop() {
        let temp = tempdir().expect("tempdir");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");
        std::fs::write(docs.join("a.txt"), b"a").expect("write");

        let handle = archive_directory(&docs).await.expect("archive");
        let path = handle.path().to_path_buf();
        assert!(path.is_file());
        drop(handle);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn empty_directory_archives_to_empty_zip() {
        let temp = tempdir().expect("tempdir");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");

        let handle = archive_directory(&docs).await.expect("archive");
        let bytes = std::fs::read(handle.path()).expect("read zip");
        let zip = ZipArchive::new(Cursor::new(bytes)).expect("open zip");
        assert_eq!(zip.len(), 0);
    }
}
