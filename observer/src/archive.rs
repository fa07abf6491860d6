//! Saving a batch's logs under a name and packaging saved logs as zip.
//!
//! Saved directories live beside the log directory: with the default
//! `user_session_logs/mturk`, saving as `run_1` produces
//! `user_session_logs/run_1/`.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;
use zip::write::SimpleFileOptions;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid archive name {0:?}")]
    InvalidName(String),
    #[error("no saved session at {0}")]
    NotFound(PathBuf),
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve the sibling directory a save named `name` lives in.
///
/// Names also end up in a `Content-Disposition` header, so quotes and
/// control characters are refused along with path separators.
pub fn saved_dir(log_dir: &Path, name: &str) -> Result<PathBuf, ArchiveError> {
    let invalid = || ArchiveError::InvalidName(name.to_string());
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid());
    }
    if name
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '"') || c.is_control())
    {
        return Err(invalid());
    }
    if log_dir.file_name().is_some_and(|own| own == name) {
        return Err(invalid());
    }
    let parent = log_dir.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(name))
}

/// Move every file in `log_dir` into the saved directory `name`.
pub async fn save_logs(log_dir: &Path, name: &str) -> Result<PathBuf, ArchiveError> {
    let target = saved_dir(log_dir, name)?;
    tokio::fs::create_dir_all(&target)
        .await
        .map_err(io_error(&target))?;

    let mut entries = tokio::fs::read_dir(log_dir)
        .await
        .map_err(io_error(log_dir))?;
    let mut moved = 0usize;
    while let Some(entry) = entries.next_entry().await.map_err(io_error(log_dir))? {
        if !entry
            .file_type()
            .await
            .map_err(io_error(log_dir))?
            .is_file()
        {
            continue;
        }
        let from = entry.path();
        let to = target.join(entry.file_name());
        tokio::fs::rename(&from, &to)
            .await
            .map_err(io_error(&from))?;
        moved += 1;
    }

    info!(moved, target = %target.display(), "session logs saved");
    Ok(target)
}

/// Zip the files of the saved directory `name`, returning the archive bytes.
pub async fn archive_saved(log_dir: &Path, name: &str) -> Result<Vec<u8>, ArchiveError> {
    let dir = saved_dir(log_dir, name)?;
    if !tokio::fs::metadata(&dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(ArchiveError::NotFound(dir));
    }
    tokio::task::spawn_blocking(move || zip_directory(&dir)).await?
}

fn zip_directory(dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if entry.file_type().map_err(io_error(dir))?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents = std::fs::read(path).map_err(io_error(path))?;
        writer.start_file(name, options)?;
        writer.write_all(&contents).map_err(io_error(path))?;
    }
    Ok(writer.finish()?.into_inner())
}
