use crate::{build_http_client, BlobId, NsError, NsResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub url: String,
    #[serde(rename = "publicUrl", default)]
    pub public_url: String,
}

impl Replica {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            public_url: url.clone(),
            url,
        }
    }

    fn endpoint(&self) -> &str {
        if self.public_url.is_empty() {
            &self.url
        } else {
            &self.public_url
        }
    }
}

/// Point-in-time answer of the coordinator: the replicas able to serve a blob,
/// in preference order. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    blob_id: BlobId,
    replicas: Vec<Replica>,
}

impl Location {
    pub fn new(blob_id: BlobId, replicas: Vec<Replica>) -> NsResult<Self> {
        if replicas.is_empty() {
            return Err(NsError::LocationResolutionFailure(format!(
                "no replica serves {}",
                blob_id
            )));
        }
        Ok(Self { blob_id, replicas })
    }

    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    /// `http://<endpoint>/<blob id>` of the preferred replica.
    pub fn serving_url(&self) -> String {
        let endpoint = self.replicas[0].endpoint().trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}/{}", endpoint, self.blob_id)
        } else {
            format!("http://{}/{}", endpoint, self.blob_id)
        }
    }
}

#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve_location(&self, blob_id: &BlobId) -> NsResult<Location>;
}

#[derive(Debug, Deserialize)]
struct LookupVolumeResp {
    #[serde(default)]
    locations: Vec<Replica>,
    #[serde(default)]
    error: String,
}

/// Resolves blob locations through the cluster master's `/dir/lookup` endpoint.
/// One round trip per call.
pub struct MasterLocator {
    master_url: String,
    client: Client,
}

impl MasterLocator {
    pub fn new(master_url: impl Into<String>, timeout: Duration) -> NsResult<Self> {
        Ok(Self {
            master_url: master_url.into().trim_end_matches('/').to_string(),
            client: build_http_client(timeout)?,
        })
    }

    fn lookup_url(&self) -> String {
        if self.master_url.starts_with("http://") || self.master_url.starts_with("https://") {
            format!("{}/dir/lookup", self.master_url)
        } else {
            format!("http://{}/dir/lookup", self.master_url)
        }
    }
}

#[async_trait]
impl LocationResolver for MasterLocator {
    async fn resolve_location(&self, blob_id: &BlobId) -> NsResult<Location> {
        let url = self.lookup_url();
        let resp = self
            .client
            .get(&url)
            .query(&[("volumeId", blob_id.volume_id.to_string())])
            .send()
            .await
            .map_err(|e| {
                warn!("lookup {} at {} failed: {}", blob_id, url, e);
                NsError::UpstreamUnavailable(format!("lookup {} at {}: {}", blob_id, url, e))
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!("lookup {} at {} returned {}", blob_id, url, status);
            return Err(NsError::UpstreamUnavailable(format!(
                "lookup {} at {}: HTTP {}",
                blob_id, url, status
            )));
        }

        let body: LookupVolumeResp = resp.json().await.map_err(|e| {
            NsError::InvalidData(format!("decode lookup reply for {}: {}", blob_id, e))
        })?;
        if !body.error.is_empty() {
            warn!("lookup {} at {}: {}", blob_id, url, body.error);
            return Err(NsError::LocationResolutionFailure(format!(
                "{}: {}",
                blob_id, body.error
            )));
        }
        debug!("lookup {} -> {:?}", blob_id, body.locations);
        Location::new(*blob_id, body.locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use warp::Filter;

    async fn start_master() -> String {
        let route = warp::path!("dir" / "lookup")
            .and(warp::query::<HashMap<String, String>>())
            .map(|query: HashMap<String, String>| {
                let reply = match query.get("volumeId").map(|v| v.as_str()) {
                    Some("3") => serde_json::json!({
                        "volumeId": "3",
                        "locations": [
                            { "url": "10.0.0.7:8080", "publicUrl": "node7" },
                            { "url": "10.0.0.8:8080", "publicUrl": "node8" }
                        ]
                    }),
                    Some("4") => serde_json::json!({ "volumeId": "4", "locations": [] }),
                    _ => serde_json::json!({ "error": "volume id not found" }),
                };
                warp::reply::json(&reply)
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    #[test]
    fn test_serving_url() {
        let blob_id: BlobId = "3,01637037d6".parse().unwrap();
        let location = Location::new(blob_id, vec![Replica::new("node7")]).unwrap();
        assert_eq!(location.serving_url(), "http://node7/3,01637037d6");

        let location = Location::new(
            blob_id,
            vec![Replica {
                url: "10.0.0.7:8080".to_string(),
                public_url: String::new(),
            }],
        )
        .unwrap();
        assert_eq!(location.serving_url(), "http://10.0.0.7:8080/3,01637037d6");

        assert!(Location::new(blob_id, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_master_locator_resolves() {
        let master = start_master().await;
        let locator = MasterLocator::new(master, Duration::from_secs(5)).unwrap();
        let blob_id: BlobId = "3,01637037d6".parse().unwrap();
        let location = locator.resolve_location(&blob_id).await.unwrap();
        assert_eq!(location.serving_url(), "http://node7/3,01637037d6");
    }

    #[tokio::test]
    async fn test_master_locator_failures() {
        let master = start_master().await;
        let locator = MasterLocator::new(master, Duration::from_secs(5)).unwrap();

        let unknown: BlobId = "9,01637037d6".parse().unwrap();
        let err = locator.resolve_location(&unknown).await.unwrap_err();
        assert!(matches!(err, NsError::LocationResolutionFailure(_)));

        let empty: BlobId = "4,01637037d6".parse().unwrap();
        let err = locator.resolve_location(&empty).await.unwrap_err();
        assert!(matches!(err, NsError::LocationResolutionFailure(_)));
    }

    #[tokio::test]
    async fn test_master_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let locator = MasterLocator::new(addr.to_string(), Duration::from_secs(2)).unwrap();
        let blob_id: BlobId = "3,01637037d6".parse().unwrap();
        let err = locator.resolve_location(&blob_id).await.unwrap_err();
        assert!(matches!(err, NsError::UpstreamUnavailable(_)));
    }
}
