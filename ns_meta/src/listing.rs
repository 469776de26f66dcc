use crate::FileRecord;
use ns_lib::{EntryKind, NamespaceEntry, NsPath};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Merges the separately listed directories and files of `dir` into one
/// name-sorted run of at most `limit` entries strictly after `after`.
///
/// A name present in both listings is reported as a directory.
pub(crate) fn merge_page(
    dir: &NsPath,
    directories: Vec<String>,
    files: Vec<FileRecord>,
    after: Option<&str>,
    limit: usize,
) -> Vec<NamespaceEntry> {
    let mut merged = BTreeMap::new();
    for name in directories {
        merged.insert(name, EntryKind::Dir);
    }
    for file in files {
        merged.entry(file.name).or_insert(EntryKind::File(file.blob_id));
    }

    let start_bound = match after {
        Some(cursor) => Bound::Excluded(cursor.to_string()),
        None => Bound::Unbounded,
    };
    merged
        .range((start_bound, Bound::Unbounded))
        .take(limit)
        .map(|(name, kind)| NamespaceEntry::new(dir, name, kind.clone()))
        .collect()
}
