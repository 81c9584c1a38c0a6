//! Shared value types for the versioned filesystem, commit builder, and
//! session engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An SVN revision number. `0` is the synthesized empty root.
pub type Revision = u64;

/// A slash-delimited, leading-slash-anchored, canonicalized path.
///
/// Canonicalization (no `.`, no `..`, no empty segments except the root
/// `/`) is enforced by [`canonicalize_path`] rather than by this type
/// directly, matching the source's treatment of paths as plain strings with
/// a validating constructor.
pub fn canonicalize_path(raw: &str) -> String {
    let mut segments = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// The kind of a resolved node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

/// A property map: property name -> property value bytes.
///
/// Properties are split into regular (client-visible) and internal
/// (reserved-namespace, server-only) by [`PropertyMap::regular`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap(BTreeMap<String, Vec<u8>>);

/// Reserved prefix for internal (never sent on the wire) properties.
const INTERNAL_PREFIX: &str = "svnbridge:internal:";

impl PropertyMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_internal(name: &str) -> bool {
        name.starts_with(INTERNAL_PREFIX)
    }

    /// Properties visible to the SVN client: everything not under the
    /// internal namespace.
    pub fn regular(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0
            .iter()
            .filter(|(k, _)| !Self::is_internal(k))
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The resolution of `(R, path)`.
#[derive(Debug, Clone)]
pub enum Node {
    Dir {
        properties: PropertyMap,
        last_change: LastChange,
    },
    File {
        blob_id: String,
        filter_chain: Vec<String>,
        size: u64,
        md5: String,
        properties: PropertyMap,
        last_change: LastChange,
    },
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Dir { .. } => NodeKind::Dir,
            Node::File { .. } => NodeKind::File,
        }
    }

    pub fn properties(&self) -> &PropertyMap {
        match self {
            Node::Dir { properties, .. } => properties,
            Node::File { properties, .. } => properties,
        }
    }

    pub fn last_change(&self) -> &LastChange {
        match self {
            Node::Dir { last_change, .. } => last_change,
            Node::File { last_change, .. } => last_change,
        }
    }
}

/// The revision, author, and date a node was last modified at.
#[derive(Debug, Clone)]
pub struct LastChange {
    pub rev: Revision,
    pub author: String,
    pub date: DateTime<Utc>,
}

/// An entry returned by `VersionedFs::list`.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: NodeKind,
    pub last_change_rev: Revision,
    pub last_change_author: String,
    pub last_change_date: DateTime<Utc>,
}

/// How a path changed in a given revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Deleted,
    Modified,
    Replaced,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Added => "added",
            ChangeAction::Deleted => "deleted",
            ChangeAction::Modified => "modified",
            ChangeAction::Replaced => "replaced",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "added" => ChangeAction::Added,
            "deleted" => ChangeAction::Deleted,
            "replaced" => ChangeAction::Replaced,
            _ => ChangeAction::Modified,
        }
    }
}

/// A single path's change record within a revision's changed-paths set.
#[derive(Debug, Clone)]
pub struct ChangedPath {
    pub path: String,
    pub action: ChangeAction,
    pub copy_from_path: Option<String>,
    pub copy_from_rev: Option<i64>,
}

/// A log entry as returned by `VersionedFs::log`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub rev: Revision,
    pub author: String,
    pub message: String,
    pub date: DateTime<Utc>,
    pub changed_paths: Vec<ChangedPath>,
}

/// An advisory lock on a path.
#[derive(Debug, Clone)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single line of `blame` output.
#[derive(Debug, Clone)]
pub struct BlameLine {
    pub line_no: u64,
    pub rev: Revision,
    pub author: String,
    pub content: Vec<u8>,
}

/// Depth of a report/editor-driver operation, matching SVN's `svn_depth_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    Infinity,
}

impl Depth {
    pub fn from_wire(word: &str) -> Option<Self> {
        match word {
            "empty" => Some(Depth::Empty),
            "files" => Some(Depth::Files),
            "immediates" => Some(Depth::Immediates),
            "infinity" => Some(Depth::Infinity),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Depth::Empty => "empty",
            Depth::Files => "files",
            Depth::Immediates => "immediates",
            Depth::Infinity => "infinity",
        }
    }
}

/// The ACL oracle's operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclOperation {
    Read,
    Write,
    Admin,
}
