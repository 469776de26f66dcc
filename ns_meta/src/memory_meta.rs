use crate::{FileRecord, MetaHandler};
use ns_lib::{BlobId, EntryKind, NsError, NsPath, NsResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CallCounters {
    lookup: AtomicU64,
    create: AtomicU64,
    delete: AtomicU64,
}

struct MemoryState {
    // full path -> kind; the root directory is implicit
    entries: Mutex<BTreeMap<NsPath, EntryKind>>,
    counters: CallCounters,
    latency: Mutex<Option<Duration>>,
}

/// In-process namespace store. Serves the in-process mode of the adapters and
/// stands in for the remote metadata service in tests; clones share state.
#[derive(Clone)]
pub struct MemoryMetaHandler {
    state: Arc<MemoryState>,
}

impl Default for MemoryMetaHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetaHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState {
                entries: Mutex::new(BTreeMap::new()),
                counters: CallCounters::default(),
                latency: Mutex::new(None),
            }),
        }
    }

    /// Delay applied to every handler call, to widen race windows in tests.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.state.latency.lock() {
            *current = latency;
        }
    }

    pub fn lookup_calls(&self) -> u64 {
        self.state.counters.lookup.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.state.counters.create.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.state.counters.delete.load(Ordering::SeqCst)
    }

    /// Creates `path` and any missing ancestors as directories.
    pub fn put_dir(&self, path: &NsPath) -> NsResult<()> {
        let mut entries = self.lock_entries()?;
        Self::ensure_dirs(&mut entries, path)
    }

    /// Stores a file at `path`, creating missing ancestors and replacing an
    /// existing file there.
    pub fn put_file(&self, path: &NsPath, blob_id: BlobId) -> NsResult<()> {
        let (parent, _) = path
            .split_parent_name()
            .ok_or_else(|| NsError::InvalidParam("root is not a file".to_string()))?;
        let mut entries = self.lock_entries()?;
        Self::ensure_dirs(&mut entries, &parent)?;
        if let Some(EntryKind::Dir) = entries.get(path) {
            return Err(NsError::WriteConflict(format!("{} is a directory", path)));
        }
        entries.insert(path.clone(), EntryKind::File(blob_id));
        Ok(())
    }

    pub fn get(&self, path: &NsPath) -> Option<EntryKind> {
        self.state.entries.lock().ok()?.get(path).cloned()
    }

    fn lock_entries(&self) -> NsResult<std::sync::MutexGuard<'_, BTreeMap<NsPath, EntryKind>>> {
        self.state
            .entries
            .lock()
            .map_err(|_| NsError::Internal("memory namespace lock poisoned".to_string()))
    }

    fn ensure_dirs(entries: &mut BTreeMap<NsPath, EntryKind>, path: &NsPath) -> NsResult<()> {
        let mut current = NsPath::root();
        for component in path.as_str().split('/').filter(|c| !c.is_empty()) {
            current = current.join(component);
            match entries.get(&current) {
                Some(EntryKind::Dir) => {}
                Some(EntryKind::File(_)) => {
                    return Err(NsError::WriteConflict(format!("{} is a file", current)));
                }
                None => {
                    entries.insert(current.clone(), EntryKind::Dir);
                }
            }
        }
        Ok(())
    }

    fn dir_exists(entries: &BTreeMap<NsPath, EntryKind>, dir: &NsPath) -> bool {
        dir.is_root() || matches!(entries.get(dir), Some(EntryKind::Dir))
    }

    fn children<'a>(
        entries: &'a BTreeMap<NsPath, EntryKind>,
        dir: &'a NsPath,
    ) -> impl Iterator<Item = (&'a str, &'a EntryKind)> + 'a {
        entries.iter().filter_map(move |(path, kind)| {
            let (parent, _) = path.split_parent_name()?;
            if &parent == dir {
                Some((path.name(), kind))
            } else {
                None
            }
        })
    }

    async fn simulate_latency(&self) {
        let latency = self.state.latency.lock().ok().and_then(|v| *v);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl MetaHandler for MemoryMetaHandler {
    async fn handle_list_directories(&self, dir: &NsPath) -> NsResult<Option<Vec<String>>> {
        self.simulate_latency().await;
        let entries = self.lock_entries()?;
        if !Self::dir_exists(&entries, dir) {
            return Ok(None);
        }
        let mut names: Vec<String> = Self::children(&entries, dir)
            .filter(|(_, kind)| kind.is_dir())
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        Ok(Some(names))
    }

    async fn handle_list_files(
        &self,
        dir: &NsPath,
        last_file_name: Option<&str>,
        limit: u32,
    ) -> NsResult<Option<Vec<FileRecord>>> {
        self.simulate_latency().await;
        let entries = self.lock_entries()?;
        if !Self::dir_exists(&entries, dir) {
            return Ok(None);
        }
        let mut files: Vec<FileRecord> = Self::children(&entries, dir)
            .filter_map(|(name, kind)| match kind {
                EntryKind::File(blob_id) => Some(FileRecord {
                    name: name.to_string(),
                    blob_id: *blob_id,
                }),
                EntryKind::Dir => None,
            })
            .filter(|record| match last_file_name {
                Some(cursor) => record.name.as_str() > cursor,
                None => true,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files.truncate(limit as usize);
        Ok(Some(files))
    }

    async fn handle_lookup(&self, dir: &NsPath, name: &str) -> NsResult<Option<EntryKind>> {
        self.state.counters.lookup.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let entries = self.lock_entries()?;
        Ok(entries.get(&dir.join(name)).cloned())
    }

    async fn handle_create_entry(
        &self,
        dir: &NsPath,
        name: &str,
        kind: EntryKind,
    ) -> NsResult<()> {
        self.state.counters.create.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut entries = self.lock_entries()?;
        if !Self::dir_exists(&entries, dir) {
            return Err(NsError::NotFound(dir.to_string()));
        }
        let path = dir.join(name);
        if entries.contains_key(&path) {
            return Err(NsError::WriteConflict(format!("{} already exists", path)));
        }
        entries.insert(path, kind);
        Ok(())
    }

    async fn handle_delete_entry(&self, dir: &NsPath, name: &str, is_dir: bool) -> NsResult<()> {
        self.state.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut entries = self.lock_entries()?;
        let path = dir.join(name);
        let kind = entries
            .get(&path)
            .cloned()
            .ok_or_else(|| NsError::NotFound(path.to_string()))?;
        if kind.is_dir() != is_dir {
            return Err(NsError::InvalidParam(format!(
                "{} is_dir mismatch, requested is_dir={}",
                path, is_dir
            )));
        }
        if is_dir && Self::children(&entries, &path).next().is_some() {
            return Err(NsError::WriteConflict(format!("{} is not empty", path)));
        }
        entries.remove(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_delete_rules() {
        let handler = MemoryMetaHandler::new();
        let root = NsPath::root();
        handler
            .handle_create_entry(&root, "d", EntryKind::Dir)
            .await
            .unwrap();
        let err = handler
            .handle_create_entry(&root, "d", EntryKind::Dir)
            .await
            .unwrap_err();
        assert!(matches!(err, NsError::WriteConflict(_)));

        let d = NsPath::new("/d");
        handler
            .handle_create_entry(&d, "f", EntryKind::File(BlobId::new(1, 1, 1)))
            .await
            .unwrap();
        let err = handler.handle_delete_entry(&root, "d", true).await.unwrap_err();
        assert!(matches!(err, NsError::WriteConflict(_)));

        handler.handle_delete_entry(&d, "f", false).await.unwrap();
        handler.handle_delete_entry(&root, "d", true).await.unwrap();
        assert!(handler.get(&d).is_none());
        assert_eq!(handler.create_calls(), 3);
        assert_eq!(handler.delete_calls(), 3);
    }

    #[tokio::test]
    async fn test_create_under_missing_parent() {
        let handler = MemoryMetaHandler::new();
        let err = handler
            .handle_create_entry(&NsPath::new("/missing"), "x", EntryKind::Dir)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_put_file_creates_parents() {
        let handler = MemoryMetaHandler::new();
        handler
            .put_file(&NsPath::new("/a/b/c.txt"), BlobId::new(2, 3, 4))
            .unwrap();
        assert_eq!(handler.get(&NsPath::new("/a")), Some(EntryKind::Dir));
        assert_eq!(handler.get(&NsPath::new("/a/b")), Some(EntryKind::Dir));
        assert!(handler
            .put_file(&NsPath::new("/a/b/c.txt/d"), BlobId::new(2, 3, 4))
            .is_err());
    }
}
