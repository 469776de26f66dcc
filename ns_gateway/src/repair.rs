use log::{info, warn};
use ns_lib::{build_http_client, BlobId, NsError, NsPath, NsResult};
use ns_meta::MetaClient;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// A fetched file waiting to be republished.
pub struct Upload<'a> {
    pub file_name: &'a str,
    pub content_type: Option<&'a str>,
    pub data_path: &'a Path,
}

/// The namespace's normal write path: stores content under a path so that a
/// later `find_file` sees it.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, path: &NsPath, upload: Upload<'_>) -> NsResult<()>;
}

/// Multipart upload (`file` field) to `<filer_url><path>`.
pub struct HttpPublisher {
    filer_url: String,
    client: Client,
}

impl HttpPublisher {
    pub fn new(filer_url: impl Into<String>, timeout: Duration) -> NsResult<Self> {
        let filer_url = filer_url.into();
        let filer_url = if filer_url.starts_with("http://") || filer_url.starts_with("https://") {
            filer_url
        } else {
            format!("http://{}", filer_url)
        };
        Ok(Self {
            filer_url: filer_url.trim_end_matches('/').to_string(),
            client: build_http_client(timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, path: &NsPath, upload: Upload<'_>) -> NsResult<()> {
        let data = tokio::fs::read(upload.data_path).await?;
        let mut part = Part::bytes(data).file_name(upload.file_name.to_string());
        if let Some(content_type) = upload.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| NsError::InvalidParam(format!("content type {}: {}", content_type, e)))?;
        }
        let url = format!("{}{}", self.filer_url, path);
        let resp = self
            .client
            .post(&url)
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|e| NsError::UpstreamUnavailable(format!("upload {}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NsError::UpstreamUnavailable(format!(
                "upload {}: HTTP {}",
                url, status
            )));
        }
        Ok(())
    }
}

/// File name from `attachment; filename="x.txt"` style header values.
fn disposition_file_name(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let name = part.strip_prefix("filename=")?;
        let name = name.trim_matches('"');
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    })
}

/// Copies a missing file from the fallback origin into the namespace, then
/// resolves it again. One attempt per request.
pub struct FetchRepair {
    origin: String,
    client: Client,
    publisher: Arc<dyn Publisher>,
    temp_dir: PathBuf,
}

impl FetchRepair {
    pub fn new(
        origin: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        temp_dir: PathBuf,
        timeout: Duration,
    ) -> NsResult<Self> {
        Ok(Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            client: build_http_client(timeout)?,
            publisher,
            temp_dir,
        })
    }

    pub async fn repair(&self, meta: &MetaClient, path: &NsPath) -> NsResult<BlobId> {
        let url = format!("{}{}", self.origin, path);
        info!("fetch-repair {} from {}", path, url);
        let mut resp = self.client.get(&url).send().await.map_err(|e| {
            warn!("fetch {} from origin failed: {}", url, e);
            NsError::NotFound(path.to_string())
        })?;
        if !resp.status().is_success() {
            warn!("origin returned {} for {}", resp.status(), url);
            return Err(NsError::NotFound(path.to_string()));
        }

        let file_name = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| path.name().to_string());
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let staged = tempfile::Builder::new()
            .prefix("ns-repair-")
            .tempfile_in(&self.temp_dir)?;
        let mut out = tokio::fs::File::from_std(staged.reopen()?);
        let mut total = 0usize;
        loop {
            let chunk = resp.chunk().await.map_err(|e| {
                warn!("fetch {} interrupted: {}", url, e);
                NsError::NotFound(path.to_string())
            })?;
            match chunk {
                Some(chunk) => {
                    total += chunk.len();
                    out.write_all(&chunk).await?;
                }
                None => break,
            }
        }
        out.flush().await?;
        drop(out);

        let upload = Upload {
            file_name: &file_name,
            content_type: content_type.as_deref(),
            data_path: staged.path(),
        };
        if let Err(err) = self.publisher.publish(path, upload).await {
            warn!("republish {} failed: {}", path, err);
            return Err(NsError::NotFound(path.to_string()));
        }
        info!("republished {} ({} bytes) as {}", path, total, file_name);

        meta.find_file(path)
            .await?
            .ok_or_else(|| NsError::NotFound(path.to_string()))
    }
}
