use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, Request,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY, EROFS};
use log::{debug, info, warn};
use ns_lib::{
    BlobReader, EntryKind, LocationResolver, MasterLocator, NsError, NsResult,
    DEFAULT_REQUEST_TIMEOUT,
};
use ns_meta::{MemoryMetaHandler, MetaClient, RpcMetaHandler};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

use crate::node_cache::{Node, NodeCache};

const TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_NS_DAEMON_CONFIG_PATH: &str = "/etc/nsgw/ns_daemon.json";

#[derive(Debug, Clone)]
pub struct NsDaemonRunOptions {
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Metadata service endpoint. Without one the mount serves an in-process
    /// namespace.
    #[serde(alias = "filer", alias = "meta_url")]
    pub filer_url: Option<String>,
    #[serde(alias = "master")]
    pub master_url: String,
    #[serde(alias = "timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(alias = "fsname")]
    pub fs_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            filer_url: None,
            master_url: "http://127.0.0.1:9333".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            fs_name: "nsfs".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

// Content of an open file, read in full on open.
struct OpenHandle {
    identity: u64,
    data: Vec<u8>,
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    fn with_handle<F, T>(&self, fh: u64, f: F) -> Result<T, i32>
    where
        F: FnOnce(&OpenHandle) -> T,
    {
        let map = self.handles.lock().map_err(|_| EIO)?;
        let handle = map.get(&fh).ok_or(EBADF)?;
        Ok(f(handle))
    }

    fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }
}

pub struct NsDaemon {
    runtime: Runtime,
    cache: NodeCache,
    locator: Arc<dyn LocationResolver>,
    reader: BlobReader,
    handle_table: HandleTable,
    mount_time: SystemTime,
}

impl NsDaemon {
    pub fn new(
        runtime: Runtime,
        meta: MetaClient,
        locator: Arc<dyn LocationResolver>,
        timeout: Duration,
    ) -> NsResult<Self> {
        Ok(Self {
            runtime,
            cache: NodeCache::new(meta),
            locator,
            reader: BlobReader::new(timeout)?,
            handle_table: HandleTable::new(),
            mount_time: SystemTime::now(),
        })
    }

    fn node(&self, ino: u64) -> Result<Arc<Node>, i32> {
        self.cache.node(ino).ok_or(ENOENT)
    }

    fn dir_node(&self, ino: u64) -> Result<Arc<Node>, i32> {
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(ENOTDIR);
        }
        Ok(node)
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let parent = self.dir_node(parent)?;
        let dir = parent.as_dir().ok_or(ENOTDIR)?;
        let node = self
            .runtime
            .block_on(dir.resolve(&self.cache, name))
            .map_err(map_ns_err)?
            .ok_or(ENOENT)?;
        let attr = self.build_attr(&node);
        Ok((node.identity(), attr))
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<(u64, FileAttr), i32> {
        let node = self.node(ino)?;
        Ok((ino, self.build_attr(&node)))
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let node = self.dir_node(ino)?;
        let dir = node.as_dir().ok_or(ENOTDIR)?;
        let children = self
            .runtime
            .block_on(dir.read_dir_all(&self.cache))
            .map_err(map_ns_err)?;

        // each entry carries the offset of the one after it
        let dots = [
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        let listed = children.into_iter().map(|child| {
            let file_type = if child.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            (child.identity(), file_type, child.name().to_string())
        });
        Ok(dots
            .into_iter()
            .chain(listed)
            .zip(1i64..)
            .filter(|(_, next)| *next > offset)
            .map(|((identity, file_type, name), next)| (identity, file_type, name, next))
            .collect())
    }

    fn file_size(&self, node: &Node) -> u64 {
        let blob_id = match node.blob_id() {
            Some(v) => v,
            None => return 0,
        };
        let size = self.runtime.block_on(async {
            let location = self.locator.resolve_location(blob_id).await?;
            self.reader.content_length(&location).await
        });
        match size {
            Ok(size) => size,
            Err(err) => {
                warn!("size of {} ({}) unavailable: {}", node.path(), blob_id, err);
                0
            }
        }
    }

    fn build_attr(&self, node: &Node) -> FileAttr {
        let (kind, perm, nlink) = if node.is_dir() {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o444, 1)
        };
        let size = self.file_size(node);
        FileAttr {
            ino: node.identity(),
            size,
            blocks: (size + 511) / 512,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind,
            perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    pub(crate) fn mkdir_path(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let parent = self.dir_node(parent)?;
        let dir = parent.as_dir().ok_or(ENOTDIR)?;
        let node = self
            .runtime
            .block_on(dir.create(&self.cache, name, EntryKind::Dir))
            .map_err(map_ns_err)?;
        Ok(self.build_attr(&node))
    }

    pub(crate) fn remove_path(&self, parent: u64, name: &str, is_dir: bool) -> Result<(), i32> {
        let parent = self.dir_node(parent)?;
        let dir = parent.as_dir().ok_or(ENOTDIR)?;
        self.runtime
            .block_on(dir.remove(&self.cache, name, is_dir))
            .map_err(map_ns_err)
    }

    pub(crate) fn read_all(&self, node: &Node) -> NsResult<Vec<u8>> {
        let blob_id = node
            .blob_id()
            .ok_or_else(|| NsError::InvalidParam(format!("{} is a directory", node.path())))?;
        self.runtime.block_on(async {
            let location = self.locator.resolve_location(blob_id).await?;
            self.reader.read_all(&location).await
        })
    }

    pub(crate) fn open_file(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let node = self.node(ino)?;
        if node.is_dir() {
            return Err(EISDIR);
        }
        let accmode = flags & libc::O_ACCMODE;
        if accmode == libc::O_WRONLY || accmode == libc::O_RDWR {
            return Err(EROFS);
        }
        let data = self.read_all(&node).map_err(|err| {
            warn!("open {} failed: {}", node.path(), err);
            map_ns_err(err)
        })?;
        debug!("opened {} ({} bytes)", node.path(), data.len());
        Ok(self.handle_table.insert(OpenHandle {
            identity: node.identity(),
            data,
        }))
    }

    pub(crate) fn read_handle(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        if offset < 0 {
            return Err(EINVAL);
        }
        self.handle_table.with_handle(fh, |handle| {
            let start = (offset as usize).min(handle.data.len());
            let end = start.saturating_add(size as usize).min(handle.data.len());
            handle.data[start..end].to_vec()
        })
    }

    pub(crate) fn release_handle(&self, fh: u64) -> Result<(), i32> {
        match self.handle_table.remove(fh) {
            Some(handle) => {
                debug!("released fh {} of identity {:#x}", fh, handle.identity);
                Ok(())
            }
            None => Err(EBADF),
        }
    }
}

impl Filesystem for NsDaemon {
    fn lookup(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok((_ino, attr)) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_handle(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.mkdir_path(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.remove_path(parent, name, false) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.remove_path(parent, name, true) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}

pub(crate) fn map_ns_err(err: NsError) -> i32 {
    match err {
        NsError::NotFound(_) => ENOENT,
        NsError::WriteConflict(msg) if msg.contains("not empty") => ENOTEMPTY,
        NsError::WriteConflict(_) => libc::EEXIST,
        NsError::InvalidId(_) => EINVAL,
        NsError::InvalidParam(_) => EINVAL,
        NsError::InvalidData(_) => EINVAL,
        NsError::UpstreamUnavailable(_) => EIO,
        NsError::LocationResolutionFailure(_) => EIO,
        NsError::ContentFetchFailure(_) => EIO,
        NsError::IoError(_) => EIO,
        NsError::Internal(_) => EIO,
    }
}

pub(crate) fn read_json_config<T: DeserializeOwned>(path: &Path) -> NsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| NsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| NsError::InvalidData(format!("parse {} failed: {}", path.display(), e)))
}

pub(crate) fn load_daemon_config(path: &Path) -> NsResult<DaemonConfig> {
    if !path.exists() {
        warn!("config {} not found, using defaults", path.display());
        return Ok(DaemonConfig::default());
    }
    read_json_config(path)
}

pub(crate) fn build_meta_client(config: &DaemonConfig) -> NsResult<MetaClient> {
    match config.filer_url.as_ref().filter(|v| !v.is_empty()) {
        Some(url) => {
            info!("using metadata service at {}", url);
            Ok(MetaClient::new_rpc(RpcMetaHandler::new(
                url.clone(),
                config.request_timeout(),
            )?))
        }
        None => {
            info!("no filer_url configured, serving an in-process namespace");
            Ok(MetaClient::new_in_process(Box::new(MemoryMetaHandler::new())))
        }
    }
}

pub fn run_ns_daemon(options: NsDaemonRunOptions) -> NsResult<()> {
    let config = load_daemon_config(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| NsError::Internal(e.to_string()))?;
    let meta = build_meta_client(&config)?;
    let locator = Arc::new(MasterLocator::new(
        config.master_url.clone(),
        config.request_timeout(),
    )?);

    std::fs::create_dir_all(&options.mountpoint).map_err(|e| {
        NsError::IoError(format!(
            "create mountpoint {} failed: {}",
            options.mountpoint.display(),
            e
        ))
    })?;

    let filesystem = NsDaemon::new(runtime, meta, locator, config.request_timeout())?;
    let mount_options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);
    info!(
        "mounting ns_daemon at {:?}, master={}, config={}",
        options.mountpoint,
        config.master_url,
        options.config_path.display()
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("ns_daemon mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => Err(NsError::IoError(format!("mount failed: {}", err))),
    }
}
