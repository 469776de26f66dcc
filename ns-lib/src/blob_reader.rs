use crate::{build_http_client, Location, NsError, NsResult};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Reads blob content straight from the storage node named by a [`Location`].
pub struct BlobReader {
    client: Client,
}

impl BlobReader {
    pub fn new(timeout: Duration) -> NsResult<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
        })
    }

    pub async fn read_all(&self, location: &Location) -> NsResult<Vec<u8>> {
        let url = location.serving_url();
        let resp = self.client.get(&url).send().await.map_err(|e| {
            warn!("GET {} failed: {}", url, e);
            NsError::ContentFetchFailure(format!("GET {}: {}", url, e))
        })?;
        Self::check_status(&url, resp.status())?;
        let data = resp
            .bytes()
            .await
            .map_err(|e| NsError::ContentFetchFailure(format!("read body of {}: {}", url, e)))?;
        Ok(data.to_vec())
    }

    pub async fn content_length(&self, location: &Location) -> NsResult<u64> {
        let url = location.serving_url();
        let resp = self.client.head(&url).send().await.map_err(|e| {
            NsError::ContentFetchFailure(format!("HEAD {}: {}", url, e))
        })?;
        Self::check_status(&url, resp.status())?;
        // body-based length is empty for HEAD, read the header itself
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                NsError::InvalidData(format!("HEAD {} returned no content length", url))
            })
    }

    fn check_status(url: &str, status: StatusCode) -> NsResult<()> {
        if status.is_success() {
            return Ok(());
        }
        warn!("storage node {} returned {}", url, status);
        if status == StatusCode::NOT_FOUND {
            return Err(NsError::NotFound(url.to_string()));
        }
        Err(NsError::ContentFetchFailure(format!("{} returned {}", url, status)))
    }
}
