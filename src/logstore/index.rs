//! In-memory indexes over the log files.
//!
//! An index remembers the [`FileStamp`] it was built from and is rebuilt
//! lazily on the next lookup once the file's stamp differs.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use super::file::{read_lines, FileStamp};
use super::records::{ErrorEntry, SuccessRecord};
use crate::content_id::ContentId;

/// Success log index: content ids per scope (`None` = unscoped records).
#[derive(Debug, Default)]
pub struct SuccessIndex {
    last_seen: Option<Option<FileStamp>>,
    by_scope: HashMap<Option<String>, HashSet<ContentId>>,
}

impl SuccessIndex {
    pub fn is_fresh(&self, current: Option<FileStamp>) -> bool {
        self.last_seen == Some(current)
    }

    pub fn invalidate(&mut self) {
        self.last_seen = None;
    }

    pub fn rebuild(&mut self, path: &Path, current: Option<FileStamp>) -> io::Result<()> {
        let mut by_scope: HashMap<Option<String>, HashSet<ContentId>> = HashMap::new();
        for record in read_lines(path)?.iter().filter_map(|l| SuccessRecord::parse(l)) {
            if let Some(id) = record.content_id() {
                by_scope.entry(record.scope).or_default().insert(id);
            }
        }
        self.by_scope = by_scope;
        self.last_seen = Some(current);
        Ok(())
    }

    /// With no scope, a record in any scope counts. With a scope, only
    /// records of that scope count.
    pub fn contains(&self, id: &ContentId, scope: Option<&str>) -> bool {
        match scope {
            None => self.by_scope.values().any(|ids| ids.contains(id)),
            Some(scope) => self
                .by_scope
                .get(&Some(scope.to_string()))
                .is_some_and(|ids| ids.contains(id)),
        }
    }

    pub fn all_ids(&self) -> HashSet<ContentId> {
        self.by_scope.values().flatten().cloned().collect()
    }
}

/// Parsed entries of one error log.
#[derive(Debug, Default, Clone)]
pub struct ErrorIndex {
    last_seen: Option<FileStamp>,
    pub entries: Vec<ErrorEntry>,
}

impl ErrorIndex {
    pub fn load(path: &Path, current: Option<FileStamp>) -> io::Result<Self> {
        let entries = read_lines(path)?
            .iter()
            .filter_map(|l| ErrorEntry::parse(l))
            .collect();
        Ok(Self {
            last_seen: current,
            entries,
        })
    }

    pub fn is_fresh(&self, current: Option<FileStamp>) -> bool {
        self.last_seen == current
    }

    pub fn restamp(&mut self, current: Option<FileStamp>) {
        self.last_seen = current;
    }
}
