use log::{debug, info, warn};
use ns_lib::{BlobId, EntryKind, NamespaceEntry, NsError, NsPath, NsResult};
use ns_meta::{Lookup, MetaClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

pub const ROOT_IDENTITY: u64 = 1;
const ARENA_BIT: u64 = 1 << 63;

#[derive(Debug)]
pub enum NodeBody {
    Dir(DirNode),
    File(BlobId),
}

/// A live handle for one namespace path. Handles are shared: every lookup or
/// listing of the same cached path hands out the same `Arc<Node>`.
#[derive(Debug)]
pub struct Node {
    identity: u64,
    path: NsPath,
    name: String,
    body: NodeBody,
}

impl Node {
    fn new(identity: u64, path: NsPath, kind: EntryKind) -> Self {
        let name = path.name().to_string();
        let body = match kind {
            EntryKind::Dir => NodeBody::Dir(DirNode::new(path.clone())),
            EntryKind::File(blob_id) => NodeBody::File(blob_id),
        };
        Self {
            identity,
            path,
            name,
            body,
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn path(&self) -> &NsPath {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.body, NodeBody::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match &self.body {
            NodeBody::Dir(dir) => Some(dir),
            NodeBody::File(_) => None,
        }
    }

    pub fn blob_id(&self) -> Option<&BlobId> {
        match &self.body {
            NodeBody::File(blob_id) => Some(blob_id),
            NodeBody::Dir(_) => None,
        }
    }

    fn matches(&self, kind: &EntryKind) -> bool {
        match (&self.body, kind) {
            (NodeBody::Dir(_), EntryKind::Dir) => true,
            (NodeBody::File(cached), EntryKind::File(listed)) => cached == listed,
            _ => false,
        }
    }
}

// ========== Identity table ==========
// identity -> live node. Packed identities come straight from the blob id so
// the same file maps to the same inode number across restarts; everything else
// draws from the arena counter.
struct IdentityTable {
    next_arena: AtomicU64,
    nodes: RwLock<HashMap<u64, Arc<Node>>>,
}

impl IdentityTable {
    fn new() -> Self {
        Self {
            next_arena: AtomicU64::new(1),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    fn next_arena_identity(&self) -> u64 {
        ARENA_BIT | self.next_arena.fetch_add(1, Ordering::SeqCst)
    }

    /// Picks an identity for a new node at `path`, builds it and registers it
    /// in one step under the write lock.
    fn admit(&self, path: NsPath, kind: EntryKind) -> NsResult<Arc<Node>> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| NsError::Internal("identity table lock poisoned".to_string()))?;
        let packed = match &kind {
            EntryKind::File(blob_id) => blob_id.packed_identity(),
            EntryKind::Dir => None,
        };
        let identity = match packed {
            Some(id) if !nodes.contains_key(&id) => id,
            Some(id) => {
                debug!(
                    "identity {:#x} already held, {} falls back to the arena",
                    id, path
                );
                self.next_arena_identity()
            }
            None => self.next_arena_identity(),
        };
        let node = Arc::new(Node::new(identity, path, kind));
        nodes.insert(identity, node.clone());
        Ok(node)
    }

    fn insert_root(&self, node: Arc<Node>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.identity, node);
        }
    }

    fn get(&self, identity: u64) -> Option<Arc<Node>> {
        self.nodes.read().ok()?.get(&identity).cloned()
    }

    /// Drops the table entry only while it still points at `node`.
    fn release(&self, node: &Arc<Node>) {
        if let Ok(mut nodes) = self.nodes.write() {
            let held = nodes
                .get(&node.identity)
                .map(|current| Arc::ptr_eq(current, node))
                .unwrap_or(false);
            if held {
                nodes.remove(&node.identity);
            }
        }
    }

    fn len(&self) -> usize {
        self.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }
}

/// Owns the root directory handle and the identity table. The FUSE layer goes
/// from inode number to node through here.
pub struct NodeCache {
    meta: MetaClient,
    identities: IdentityTable,
    root: Arc<Node>,
}

impl NodeCache {
    pub fn new(meta: MetaClient) -> Self {
        let identities = IdentityTable::new();
        let root = Arc::new(Node::new(ROOT_IDENTITY, NsPath::root(), EntryKind::Dir));
        identities.insert_root(root.clone());
        Self {
            meta,
            identities,
            root,
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    pub fn node(&self, identity: u64) -> Option<Arc<Node>> {
        self.identities.get(identity)
    }

    /// Number of identities currently bound to live nodes, root included.
    pub fn live_identities(&self) -> usize {
        self.identities.len()
    }

    async fn release_subtree(&self, node: Arc<Node>) {
        let mut pending = vec![node];
        while let Some(node) = pending.pop() {
            self.identities.release(&node);
            if let Some(dir) = node.as_dir() {
                let mut children = dir.children.lock().await;
                pending.extend(children.drain().map(|(_, child)| child));
            }
        }
    }
}

/// Child map of one directory. The map lock is held across the remote call
/// of a resolve-or-insert, so first lookups of one name are serialised per
/// directory while sibling directories proceed independently.
#[derive(Debug)]
pub struct DirNode {
    path: NsPath,
    children: Mutex<HashMap<String, Arc<Node>>>,
}

impl DirNode {
    fn new(path: NsPath) -> Self {
        Self {
            path,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Cached handle for `name`, or a fresh one after a remote lookup.
    /// `None` is never cached.
    pub async fn resolve(&self, cache: &NodeCache, name: &str) -> NsResult<Option<Arc<Node>>> {
        let mut children = self.children.lock().await;
        if let Some(node) = children.get(name) {
            return Ok(Some(node.clone()));
        }
        match cache.meta.lookup(&self.path, name).await? {
            Lookup::Found(entry) => {
                let node = cache.identities.admit(entry.path, entry.kind)?;
                children.insert(name.to_string(), node.clone());
                Ok(Some(node))
            }
            Lookup::NotFound => {
                debug!("resolve {} in {}: not found", name, self.path);
                Ok(None)
            }
        }
    }

    pub async fn create(&self, cache: &NodeCache, name: &str, kind: EntryKind) -> NsResult<Arc<Node>> {
        let mut children = self.children.lock().await;
        if children.contains_key(name) {
            return Err(NsError::WriteConflict(format!(
                "{} already exists",
                self.path.join(name)
            )));
        }
        let node = cache.identities.admit(self.path.join(name), kind.clone())?;
        children.insert(name.to_string(), node.clone());

        if let Err(err) = cache.meta.create_entry(&self.path, name, kind).await {
            warn!("create {} failed, rolling back: {}", node.path(), err);
            children.remove(name);
            cache.identities.release(&node);
            return Err(err);
        }
        info!("created {} as identity {:#x}", node.path(), node.identity());
        Ok(node)
    }

    /// Remote delete first; the cached handle is evicted only after it succeeds.
    pub async fn remove(&self, cache: &NodeCache, name: &str, is_dir: bool) -> NsResult<()> {
        let mut children = self.children.lock().await;
        if let Err(err) = cache.meta.delete(&self.path, name, is_dir).await {
            warn!("delete {} failed: {}", self.path.join(name), err);
            return Err(err);
        }
        let evicted = children.remove(name);
        drop(children);
        if let Some(node) = evicted {
            cache.release_subtree(node).await;
        }
        Ok(())
    }

    /// Full listing of this directory. Every listed child goes through the
    /// child map so listing and lookup agree on handles; a cached child whose
    /// kind or blob changed remotely is replaced. Cached children missing from
    /// the listing are kept until removed through this cache.
    pub async fn read_dir_all(&self, cache: &NodeCache) -> NsResult<Vec<Arc<Node>>> {
        let listed: Vec<NamespaceEntry> = cache.meta.list_all(&self.path).await?;
        let mut children = self.children.lock().await;
        let mut out = Vec::with_capacity(listed.len());
        let mut replaced = Vec::new();
        for entry in listed {
            if let Some(node) = children.get(&entry.name) {
                if node.matches(&entry.kind) {
                    out.push(node.clone());
                    continue;
                }
            }
            let node = cache.identities.admit(entry.path, entry.kind)?;
            if let Some(old) = children.insert(entry.name, node.clone()) {
                replaced.push(old);
            }
            out.push(node);
        }
        drop(children);
        for old in replaced {
            debug!("replacing stale handle for {}", old.path());
            cache.release_subtree(old).await;
        }
        Ok(out)
    }
}
