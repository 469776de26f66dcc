use crate::{BlobId, NsPath};
use serde::{Deserialize, Serialize};

/// A namespace entry is either a directory or a file backed by exactly one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Dir,
    File(BlobId),
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub path: NsPath,
    pub name: String,
    pub kind: EntryKind,
}

impl NamespaceEntry {
    pub fn new(parent: &NsPath, name: &str, kind: EntryKind) -> Self {
        Self {
            path: parent.join(name),
            name: name.to_string(),
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn blob_id(&self) -> Option<&BlobId> {
        match &self.kind {
            EntryKind::File(blob_id) => Some(blob_id),
            EntryKind::Dir => None,
        }
    }
}

/// One page of a merged, name-sorted directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage {
    pub entries: Vec<NamespaceEntry>,
    /// Name of the last returned entry; the cursor for the next page.
    pub last_name: Option<String>,
    pub has_more: bool,
}

impl ListPage {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}
