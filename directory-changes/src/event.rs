//! Change events surfaced from a watched directory.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// File was created.
    Created,

    /// File contents or metadata changed.
    Changed,

    /// File was deleted.
    Deleted,

    /// File was renamed (either half of the rename).
    Renamed,
}

impl ChangeKind {
    /// Map a notify event kind onto a change kind.
    ///
    /// Returns `None` for kinds that are not surfaced: access events,
    /// `Other`, and the combined `RenameMode::Both` report, whose halves
    /// already arrive as separate `From` and `To` notifications.
    pub fn from_notify(kind: notify::EventKind) -> Option<Self> {
        match kind {
            notify::EventKind::Create(_) => Some(Self::Created),
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
            notify::EventKind::Modify(ModifyKind::Name(_)) => Some(Self::Renamed),
            notify::EventKind::Modify(_) | notify::EventKind::Any => Some(Self::Changed),
            notify::EventKind::Remove(_) => Some(Self::Deleted),
            notify::EventKind::Access(_) | notify::EventKind::Other => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        };
        f.write_str(name)
    }
}

/// A path paired with the kind of change that touched it.
///
/// This is the default element of a directory change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Path to the affected file.
    pub path: PathBuf,

    /// The kind of change.
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Create a new change event.
    pub fn new(path: PathBuf, kind: ChangeKind) -> Self {
        Self { path, kind }
    }

    /// Path to the affected file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<ChangeEvent> for (PathBuf, ChangeKind) {
    fn from(event: ChangeEvent) -> Self {
        (event.path, event.kind)
    }
}

/// A single raw notification from the watch facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Full path reported by the facility.
    pub path: PathBuf,

    /// The kind of change.
    pub kind: ChangeKind,

    /// When the notification was observed.
    pub observed_at: DateTime<Utc>,
}

impl RawChange {
    /// Create a raw change stamped with the current time.
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }

    /// Split a notify event into one raw change per reported path.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        let Some(kind) = ChangeKind::from_notify(event.kind) else {
            return Vec::new();
        };

        let observed_at = Utc::now();
        event
            .paths
            .into_iter()
            .map(|path| Self {
                path,
                kind,
                observed_at,
            })
            .collect()
    }
}
