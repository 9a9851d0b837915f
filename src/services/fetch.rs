//! Archive download and extraction.
//!
//! The workflow only sees the [`ArchiveFetcher`] trait; [`HttpArchiveFetcher`] is the
//! production implementation (reqwest for downloads, the `unzip` tool for extraction).

use crate::error::{ManagerError, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Fallback file name when neither the response nor the URL provides one.
const FALLBACK_FILENAME: &str = "download";

/// Fetches archives and unpacks them into instance folders.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` into `folder` (created if missing), returning the local file.
    async fn download(&self, url: &str, folder: &Utf8Path) -> Result<Utf8PathBuf>;

    /// Unpack `archive` into `target`.
    async fn extract(&self, archive: &Utf8Path, target: &Utf8Path) -> Result<()>;
}

/// HTTP downloader plus `unzip`-based extractor.
pub struct HttpArchiveFetcher {
    client: reqwest::Client,
    disposition_pattern: Regex,
}

impl HttpArchiveFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ManagerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            disposition_pattern: Regex::new(
                r#"filename(?:\*=[A-Za-z0-9_-]*'[^']*'(?P<ext>[^";\s]+)|="?(?P<plain>[^";]+)"?)"#,
            )
            .expect("Invalid content-disposition regex"),
        })
    }

    /// Derive the local file name from a `Content-Disposition` header or the URL.
    pub fn resolve_filename(&self, url: &str, content_disposition: Option<&str>) -> String {
        content_disposition
            .and_then(|header| self.filename_from_disposition(header))
            .or_else(|| Url::parse(url).ok().and_then(|url| filename_from_url(&url)))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
    }

    /// File name from a `Content-Disposition` header.
    ///
    /// An RFC 5987 `filename*=charset''value` parameter wins over a plain
    /// `filename=` and is percent-decoded.
    fn filename_from_disposition(&self, header: &str) -> Option<String> {
        let mut extended = None;
        let mut plain = None;
        for caps in self.disposition_pattern.captures_iter(header) {
            if let Some(value) = caps.name("ext") {
                extended.get_or_insert_with(|| decode_segment(value.as_str()));
            } else if let Some(value) = caps.name("plain") {
                plain.get_or_insert_with(|| value.as_str().to_string());
            }
        }

        extended
            .and_then(|name| sanitize_filename(&name))
            .or_else(|| plain.and_then(|name| sanitize_filename(&name)))
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn download(&self, url: &str, folder: &Utf8Path) -> Result<Utf8PathBuf> {
        let download_error = |reason: String| ManagerError::Download {
            url: url.to_string(),
            reason,
        };

        tokio::fs::create_dir_all(folder)
            .await
            .map_err(|e| ManagerError::io(folder, e))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(e.to_string()))?;

        let disposition = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // Name from the final URL after redirects, falling back to the requested one
        let filename = match disposition.as_deref() {
            Some(header) => self.resolve_filename(url, Some(header)),
            None => filename_from_url(response.url())
                .unwrap_or_else(|| self.resolve_filename(url, None)),
        };
        let dest = folder.join(filename);

        tracing::info!("Downloading {} -> {}", url, dest);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| ManagerError::io(&dest, e))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ManagerError::io(&dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ManagerError::io(&dest, e))?;

        tracing::info!("Download complete: {} ({} bytes)", dest, written);
        Ok(dest)
    }

    async fn extract(&self, archive: &Utf8Path, target: &Utf8Path) -> Result<()> {
        tracing::info!("Extracting {} -> {}", archive, target);

        let status = Command::new("unzip")
            .arg("-o")
            .arg("-q")
            .arg(archive.as_str())
            .arg("-d")
            .arg(target.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|e| ManagerError::io(archive, e))?;

        // unzip exits 1 for warnings only
        match status.code() {
            Some(code) if code < 2 => Ok(()),
            code => Err(ManagerError::Extraction {
                archive: archive.to_path_buf(),
                target: target.to_path_buf(),
                code,
            }),
        }
    }
}

/// Last non-empty path segment of `url`, percent-decoded.
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    sanitize_filename(&decode_segment(segment))
}

fn decode_segment(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.trim().trim_matches('"');
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
