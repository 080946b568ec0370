use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tempfile::NamedTempFile;

/// Make sure `path` exists locally, downloading it from `url` on first use.
///
/// `setting` is the prefix of the `<setting>_PATH`/`<setting>_URL` variables
/// named in the error when neither is usable.
///
/// The download is written to a temporary file next to `path` and renamed
/// into place, so an interrupted fetch never leaves a partial file behind.
pub async fn ensure_cached(setting: &str, path: &Path, url: Option<&str>) -> anyhow::Result<()> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Using cached file");
        return Ok(());
    }

    let url = url.with_context(|| {
        format!(
            "{} does not exist and no download URL is configured; \
             set {setting}_URL to fetch it or {setting}_PATH to an existing file",
            path.display()
        )
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

    tracing::info!(url, path = %path.display(), "Downloading");
    let body = reqwest::get(url)
        .await?
        .error_for_status()?
        .bytes()
        .await
        .with_context(|| format!("failed to download {url}"))?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&body)?;
    tmp.persist(path)
        .with_context(|| format!("failed to store {}", path.display()))?;

    tracing::info!(bytes = body.len(), path = %path.display(), "Download cached");
    Ok(())
}
