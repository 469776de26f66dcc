use crate::listing::merge_page;
use crate::RpcMetaHandler;
use ns_lib::{BlobId, EntryKind, ListPage, NamespaceEntry, NsError, NsPath, NsResult};
use serde::{Deserialize, Serialize};

/// Page size used when a caller wants a whole directory at once.
pub const LIST_ALL_PAGE_SIZE: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub blob_id: BlobId,
}

/// Outcome of a single-entry lookup. Transport failures travel in the `Err`
/// arm of the surrounding `NsResult`, so callers branch on a closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(NamespaceEntry),
    NotFound,
}

impl Lookup {
    pub fn found(self) -> Option<NamespaceEntry> {
        match self {
            Lookup::Found(entry) => Some(entry),
            Lookup::NotFound => None,
        }
    }
}

// ========== Remote seam : MetaHandler ==========
// The metadata store keeps directories and files in two separate indexes.
// `None` from a list call means the directory itself does not exist.
#[async_trait::async_trait]
pub trait MetaHandler: Send + Sync {
    async fn handle_list_directories(&self, dir: &NsPath) -> NsResult<Option<Vec<String>>>;

    async fn handle_list_files(
        &self,
        dir: &NsPath,
        last_file_name: Option<&str>,
        limit: u32,
    ) -> NsResult<Option<Vec<FileRecord>>>;

    async fn handle_lookup(&self, dir: &NsPath, name: &str) -> NsResult<Option<EntryKind>>;

    async fn handle_create_entry(&self, dir: &NsPath, name: &str, kind: EntryKind)
        -> NsResult<()>;

    async fn handle_delete_entry(&self, dir: &NsPath, name: &str, is_dir: bool) -> NsResult<()>;
}

/// Facade over the namespace metadata service. Every call is one remote
/// round trip (listing adds one look-ahead call); nothing here retries.
pub enum MetaClient {
    InProcess(Box<dyn MetaHandler>),
    Rpc(RpcMetaHandler),
}

impl MetaClient {
    pub fn new_in_process(handler: Box<dyn MetaHandler>) -> Self {
        Self::InProcess(handler)
    }

    pub fn new_rpc(handler: RpcMetaHandler) -> Self {
        Self::Rpc(handler)
    }

    fn handler(&self) -> &dyn MetaHandler {
        match self {
            Self::InProcess(handler) => handler.as_ref(),
            Self::Rpc(handler) => handler,
        }
    }

    async fn list_after(
        &self,
        dir: &NsPath,
        after: Option<&str>,
        limit: u32,
    ) -> NsResult<Vec<NamespaceEntry>> {
        let handler = self.handler();
        let directories = handler
            .handle_list_directories(dir)
            .await?
            .ok_or_else(|| NsError::NotFound(dir.to_string()))?;
        let files = handler
            .handle_list_files(dir, after, limit)
            .await?
            .ok_or_else(|| NsError::NotFound(dir.to_string()))?;
        Ok(merge_page(dir, directories, files, after, limit as usize))
    }

    /// One name-sorted page of `dir` after `last_name`. `has_more` comes from
    /// fetching one entry past the last returned name.
    pub async fn list_children(
        &self,
        dir: &NsPath,
        last_name: Option<&str>,
        limit: u32,
    ) -> NsResult<ListPage> {
        let limit = limit.max(1);
        let entries = self.list_after(dir, last_name, limit).await?;
        let last_name = entries.last().map(|e| e.name.clone());
        let has_more = match last_name.as_deref() {
            Some(cursor) => !self.list_after(dir, Some(cursor), 1).await?.is_empty(),
            None => false,
        };
        debug!(
            "list {} -> {} entries, last={:?}, has_more={}",
            dir,
            entries.len(),
            last_name,
            has_more
        );
        Ok(ListPage {
            entries,
            last_name,
            has_more,
        })
    }

    pub async fn list_all(&self, dir: &NsPath) -> NsResult<Vec<NamespaceEntry>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let batch = self
                .list_after(dir, cursor.as_deref(), LIST_ALL_PAGE_SIZE)
                .await?;
            let batch_len = batch.len();
            cursor = batch.last().map(|e| e.name.clone());
            all.extend(batch);
            if batch_len < LIST_ALL_PAGE_SIZE as usize {
                break;
            }
        }
        Ok(all)
    }

    /// A miss is always `Lookup::NotFound`, whether the handler reports it
    /// as an absent entry or as a not-found error (missing parent, HTTP 404).
    pub async fn lookup(&self, dir: &NsPath, name: &str) -> NsResult<Lookup> {
        match self.handler().handle_lookup(dir, name).await {
            Ok(Some(kind)) => Ok(Lookup::Found(NamespaceEntry::new(dir, name, kind))),
            Ok(None) => Ok(Lookup::NotFound),
            Err(err) if err.is_not_found() => {
                debug!("lookup {} in {} -> not found: {}", name, dir, err);
                Ok(Lookup::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Blob behind a file path; directories and missing paths yield `None`.
    pub async fn find_file(&self, path: &NsPath) -> NsResult<Option<BlobId>> {
        let (dir, name) = match path.split_parent_name() {
            Some(v) => v,
            None => return Ok(None),
        };
        Ok(self
            .lookup(&dir, &name)
            .await?
            .found()
            .and_then(|entry| entry.blob_id().copied()))
    }

    pub async fn create_entry(&self, dir: &NsPath, name: &str, kind: EntryKind) -> NsResult<()> {
        self.handler().handle_create_entry(dir, name, kind).await
    }

    pub async fn delete(&self, dir: &NsPath, name: &str, is_dir: bool) -> NsResult<()> {
        self.handler().handle_delete_entry(dir, name, is_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMetaHandler;

    fn blob(key: u64) -> BlobId {
        BlobId::new(1, key, 0xabcd)
    }

    fn client_with(names_dirs: &[&str], names_files: &[&str]) -> (MetaClient, MemoryMetaHandler) {
        let handler = MemoryMetaHandler::new();
        let dir = NsPath::new("/d");
        handler.put_dir(&dir).unwrap();
        for name in names_dirs {
            handler.put_dir(&dir.join(name)).unwrap();
        }
        for (i, name) in names_files.iter().enumerate() {
            handler.put_file(&dir.join(name), blob(i as u64 + 1)).unwrap();
        }
        (
            MetaClient::new_in_process(Box::new(handler.clone())),
            handler,
        )
    }

    #[tokio::test]
    async fn test_pagination_pages_are_disjoint_and_exhaustive() {
        let (client, _handler) = client_with(&[], &["a", "b", "c", "d", "e"]);
        let dir = NsPath::new("/d");

        let page1 = client.list_children(&dir, None, 2).await.unwrap();
        assert_eq!(page1.names(), vec!["a", "b"]);
        assert_eq!(page1.last_name.as_deref(), Some("b"));
        assert!(page1.has_more);

        let page2 = client.list_children(&dir, Some("b"), 2).await.unwrap();
        assert_eq!(page2.names(), vec!["c", "d"]);
        assert!(page2.has_more);

        let page3 = client.list_children(&dir, Some("d"), 2).await.unwrap();
        assert_eq!(page3.names(), vec!["e"]);
        assert!(!page3.has_more);

        let page4 = client.list_children(&dir, Some("e"), 2).await.unwrap();
        assert!(page4.entries.is_empty());
        assert_eq!(page4.last_name, None);
        assert!(!page4.has_more);
    }

    #[tokio::test]
    async fn test_pagination_mixes_dirs_and_files() {
        let (client, _handler) = client_with(&["b", "d"], &["a", "c", "e"]);
        let dir = NsPath::new("/d");

        let page1 = client.list_children(&dir, None, 2).await.unwrap();
        assert_eq!(page1.names(), vec!["a", "b"]);
        assert!(page1.entries[1].is_dir());
        let page2 = client.list_children(&dir, Some("b"), 2).await.unwrap();
        assert_eq!(page2.names(), vec!["c", "d"]);
        let page3 = client.list_children(&dir, Some("d"), 2).await.unwrap();
        assert_eq!(page3.names(), vec!["e"]);
        assert!(!page3.has_more);

        let all = client.list_all(&dir).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_not_found() {
        let (client, _handler) = client_with(&[], &[]);
        let err = client
            .list_children(&NsPath::new("/nope"), None, 10)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_and_find_file() {
        let (client, _handler) = client_with(&["sub"], &["f.txt"]);
        let dir = NsPath::new("/d");

        match client.lookup(&dir, "f.txt").await.unwrap() {
            Lookup::Found(entry) => {
                assert_eq!(entry.path.as_str(), "/d/f.txt");
                assert_eq!(entry.blob_id(), Some(&blob(1)));
            }
            Lookup::NotFound => panic!("f.txt should exist"),
        }
        assert_eq!(
            client.lookup(&dir, "missing").await.unwrap(),
            Lookup::NotFound
        );

        assert_eq!(
            client.find_file(&NsPath::new("/d/f.txt")).await.unwrap(),
            Some(blob(1))
        );
        assert_eq!(client.find_file(&NsPath::new("/d/sub")).await.unwrap(), None);
        assert_eq!(client.find_file(&NsPath::root()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_all_spans_several_pages() {
        let handler = MemoryMetaHandler::new();
        let dir = NsPath::new("/big");
        handler.put_dir(&dir).unwrap();
        let total = LIST_ALL_PAGE_SIZE as usize + 7;
        for i in 0..total {
            handler
                .put_file(&dir.join(&format!("f{:05}", i)), blob(i as u64 + 1))
                .unwrap();
        }
        let client = MetaClient::new_in_process(Box::new(handler));
        let all = client.list_all(&dir).await.unwrap();
        assert_eq!(all.len(), total);
        assert_eq!(all[0].name, "f00000");
        assert_eq!(all[total - 1].name, format!("f{:05}", total - 1));
    }
}
