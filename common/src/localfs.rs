//! Local filesystem helpers used by the transfer orchestrator.

use async_recursion::async_recursion;

use crate::error::{Error, Result};

fn local_error(context: String) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::transfer_io(context, source)
}

/// Counts regular files under `path` (recursively). A file counts as one.
#[async_recursion]
pub async fn count_files(path: &std::path::Path) -> Result<usize> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(local_error(format!("failed reading metadata of {path:?}")))?;
    if !metadata.is_dir() {
        return Ok(usize::from(metadata.is_file()));
    }
    let mut count = 0;
    for entry in read_dir_sorted(path).await? {
        count += count_files(&entry).await?;
    }
    Ok(count)
}

/// Directory entries of `path`, sorted by name so that recursive walks are deterministic.
pub async fn read_dir_sorted(path: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(local_error(format!("cannot open directory {path:?} for reading")))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(local_error(format!("failed traversing directory {path:?}")))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// File name of `path` as UTF-8, the form used for remote object names.
pub fn file_name(path: &std::path::Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::invalid_argument(format!("{path:?} has no UTF-8 file name")))
}
