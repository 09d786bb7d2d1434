use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
    Other,
}

impl ChangeKind {
    /// Single-letter code used in commit bodies, in the style of `git status --short`.
    pub fn code(&self) -> char {
        match self {
            ChangeKind::Created => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Removed => 'D',
            ChangeKind::Renamed => 'R',
            ChangeKind::Other => '?',
        }
    }
}

/// A raw notification from the filesystem source, reduced to what the
/// pipeline cares about. Every notification goes through one dispatch point
/// in the directory watch, whichever variant it is.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Changed { kind: ChangeKind, paths: Vec<PathBuf> },
    /// Pure reads and opens; never committed.
    Accessed,
    Failed(String),
}

impl From<notify::Result<notify::Event>> for SourceEvent {
    fn from(result: notify::Result<notify::Event>) -> Self {
        use notify::event::{ModifyKind, EventKind};

        match result {
            Ok(event) => {
                let kind = match event.kind {
                    EventKind::Access(_) => return SourceEvent::Accessed,
                    EventKind::Create(_) => ChangeKind::Created,
                    EventKind::Remove(_) => ChangeKind::Removed,
                    EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
                    EventKind::Modify(_) => ChangeKind::Modified,
                    _ => ChangeKind::Other,
                };
                SourceEvent::Changed {
                    kind,
                    paths: event.paths,
                }
            }
            Err(err) => SourceEvent::Failed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub seen_at: SystemTime,
}

impl ChangeRecord {
    pub fn new(path: PathBuf, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            seen_at: SystemTime::now(),
        }
    }
}

/// The set of distinct paths changed during one accumulation window.
///
/// Keyed by path so repeated notifications collapse into one record, with
/// the latest one winning. Ordered so commits list files deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    records: BTreeMap<PathBuf, ChangeRecord>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the path was not already pending.
    pub fn insert(&mut self, record: ChangeRecord) -> bool {
        self.records.insert(record.path.clone(), record).is_none()
    }

    /// Fold an older set (e.g. one whose commit failed) back into this one.
    /// Records already present here are newer and are kept.
    pub fn absorb_older(&mut self, older: ChangeSet) {
        for (path, record) in older.records {
            self.records.entry(path).or_insert(record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.records.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.values()
    }
}

impl FromIterator<ChangeRecord> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ChangeRecord>>(iter: I) -> Self {
        let mut set = ChangeSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}
