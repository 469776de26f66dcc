use crate::{FileRecord, MetaHandler};
use ns_lib::{build_http_client, EntryKind, NsError, NsPath, NsResult};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
    seq: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Remote metadata service reached by JSON-RPC over HTTP POST.
pub struct RpcMetaHandler {
    url: String,
    client: Client,
    seq: AtomicU64,
}

impl RpcMetaHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> NsResult<Self> {
        let url = url.into();
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            format!("http://{}", url)
        };
        Ok(Self {
            url,
            client: build_http_client(timeout)?,
            seq: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_reason(method: &str, reason: String) -> NsError {
        let lower = reason.to_lowercase();
        if lower.contains("not found") {
            NsError::NotFound(reason)
        } else if lower.contains("already exists") || lower.contains("not empty") {
            NsError::WriteConflict(reason)
        } else if lower.contains("invalid") {
            NsError::InvalidParam(reason)
        } else {
            NsError::UpstreamUnavailable(format!("{}: {}", method, reason))
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> NsResult<T> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            method,
            params,
            seq,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!("meta rpc {}#{} to {} failed: {}", method, seq, self.url, e);
                NsError::UpstreamUnavailable(format!("{} {}: {}", method, self.url, e))
            })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(NsError::NotFound(format!("{} {}", method, self.url)));
        }
        if !status.is_success() {
            warn!("meta rpc {}#{} returned {}", method, seq, status);
            return Err(NsError::from_http_status(
                status,
                format!("{} {}", method, self.url),
            ));
        }

        let reply: RpcResponse = resp
            .json()
            .await
            .map_err(|e| NsError::InvalidData(format!("decode {} reply: {}", method, e)))?;
        if let Some(reason) = reply.error {
            debug!("meta rpc {}#{} error: {}", method, seq, reason);
            return Err(Self::map_reason(method, reason));
        }
        serde_json::from_value(reply.result)
            .map_err(|e| NsError::InvalidData(format!("decode {} result: {}", method, e)))
    }
}

#[async_trait::async_trait]
impl MetaHandler for RpcMetaHandler {
    async fn handle_list_directories(&self, dir: &NsPath) -> NsResult<Option<Vec<String>>> {
        self.call("list_directories", json!({ "dir": dir })).await
    }

    async fn handle_list_files(
        &self,
        dir: &NsPath,
        last_file_name: Option<&str>,
        limit: u32,
    ) -> NsResult<Option<Vec<FileRecord>>> {
        self.call(
            "list_files",
            json!({ "dir": dir, "last_file_name": last_file_name, "limit": limit }),
        )
        .await
    }

    async fn handle_lookup(&self, dir: &NsPath, name: &str) -> NsResult<Option<EntryKind>> {
        self.call("lookup", json!({ "dir": dir, "name": name }))
            .await
    }

    async fn handle_create_entry(
        &self,
        dir: &NsPath,
        name: &str,
        kind: EntryKind,
    ) -> NsResult<()> {
        self.call(
            "create_entry",
            json!({ "dir": dir, "name": name, "kind": kind }),
        )
        .await
    }

    async fn handle_delete_entry(&self, dir: &NsPath, name: &str, is_dir: bool) -> NsResult<()> {
        self.call(
            "delete_entry",
            json!({ "dir": dir, "name": name, "is_dir": is_dir }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lookup, MetaClient};
    use ns_lib::BlobId;
    use warp::Filter;

    // Answers from a fixed namespace: /docs holds dir "img" and file "a.txt".
    fn answer(method: &str, params: &Value) -> Value {
        let dir = params["dir"].as_str().unwrap_or_default();
        match (method, dir) {
            ("list_directories", "/docs") => json!({ "result": ["img"] }),
            ("list_files", "/docs") => {
                if params["last_file_name"].is_null() {
                    json!({ "result": [{ "name": "a.txt", "blob_id": "3,01637037d6" }] })
                } else {
                    json!({ "result": [] })
                }
            }
            ("list_directories", _) | ("list_files", _) => json!({ "result": null }),
            ("lookup", "/docs") if params["name"] == "a.txt" => {
                json!({ "result": { "File": "3,01637037d6" } })
            }
            ("lookup", "/gone") => json!({ "error": "directory /gone not found" }),
            ("lookup", _) => json!({ "result": null }),
            ("create_entry", _) => json!({ "error": "entry /docs/img already exists" }),
            ("delete_entry", _) => json!({ "error": "backend store is read-only" }),
            _ => json!({ "error": "unknown method" }),
        }
    }

    async fn start_meta_service() -> String {
        let route = warp::post()
            .and(warp::body::json())
            .map(|req: Value| {
                let method = req["method"].as_str().unwrap_or_default().to_string();
                assert!(req["seq"].as_u64().is_some());
                warp::reply::json(&answer(&method, &req["params"]))
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_rpc_listing_and_lookup() {
        let url = start_meta_service().await;
        let client = MetaClient::new_rpc(RpcMetaHandler::new(url, Duration::from_secs(5)).unwrap());
        let docs = NsPath::new("/docs");

        let page = client.list_children(&docs, None, 10).await.unwrap();
        assert_eq!(page.names(), vec!["a.txt", "img"]);
        assert!(!page.has_more);

        let err = client
            .list_children(&NsPath::new("/missing"), None, 10)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let blob: BlobId = "3,01637037d6".parse().unwrap();
        match client.lookup(&docs, "a.txt").await.unwrap() {
            Lookup::Found(entry) => assert_eq!(entry.blob_id(), Some(&blob)),
            Lookup::NotFound => panic!("a.txt should exist"),
        }
        assert_eq!(client.lookup(&docs, "b").await.unwrap(), Lookup::NotFound);
    }

    #[tokio::test]
    async fn test_rpc_error_reasons() {
        let url = start_meta_service().await;
        let client = MetaClient::new_rpc(RpcMetaHandler::new(url, Duration::from_secs(5)).unwrap());
        let docs = NsPath::new("/docs");

        let err = client
            .create_entry(&docs, "img", EntryKind::Dir)
            .await
            .unwrap_err();
        assert!(matches!(err, NsError::WriteConflict(_)));

        let err = client.delete(&docs, "a.txt", false).await.unwrap_err();
        assert!(matches!(err, NsError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_rpc_lookup_misses_are_not_errors() {
        let url = start_meta_service().await;
        let client = MetaClient::new_rpc(RpcMetaHandler::new(url, Duration::from_secs(5)).unwrap());
        assert_eq!(
            client.lookup(&NsPath::new("/gone"), "b.txt").await.unwrap(),
            Lookup::NotFound
        );

        // a service that answers every call with 404
        let route = warp::post().map(|| {
            warp::reply::with_status(
                warp::reply::json(&json!({ "error": "not found" })),
                warp::http::StatusCode::NOT_FOUND,
            )
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        let client = MetaClient::new_rpc(
            RpcMetaHandler::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap(),
        );
        assert_eq!(
            client.lookup(&NsPath::new("/a"), "b.txt").await.unwrap(),
            Lookup::NotFound
        );
        assert_eq!(client.find_file(&NsPath::new("/a/b.txt")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rpc_unreachable_service() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let handler = RpcMetaHandler::new(addr.to_string(), Duration::from_secs(2)).unwrap();
        assert!(handler.url().starts_with("http://"));
        let client = MetaClient::new_rpc(handler);
        let err = client.lookup(&NsPath::root(), "x").await.unwrap_err();
        assert!(matches!(err, NsError::UpstreamUnavailable(_)));
    }
}
