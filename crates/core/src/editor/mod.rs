//! The reporter -> editor diff driver behind `update`/`switch`/`status`/
//! `diff`: the client declares its mixed-revision working state (a
//! [`Report`]), and [`drive_update`] walks it against a target revision,
//! emitting the minimal [`EditorOp`] sequence a real SVN client's editor
//! would expect, depth-first and parent-before-children.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::ReportError;
use crate::fs::VersionedFs;
use crate::models::{Depth, Node, NodeKind, PropertyMap, Revision};

/// One step of an emitted editor drive. The session engine serializes these
/// onto the wire as the corresponding SVN editor command.
#[derive(Debug, Clone)]
pub enum EditorOp {
    OpenRoot { rev: Revision },
    DeleteEntry { path: String },
    AddDir { path: String, copy_from: Option<(String, Revision)> },
    OpenDir { path: String, rev: Revision },
    ChangeDirProp { path: String, name: String, value: Option<Vec<u8>> },
    CloseDir { path: String },
    AddFile { path: String, copy_from: Option<(String, Revision)> },
    OpenFile { path: String, rev: Revision },
    ChangeFileProp { path: String, name: String, value: Option<Vec<u8>> },
    ApplyTextDelta { path: String, base_checksum: Option<String>, delta: Vec<u8> },
    CloseFile { path: String, text_checksum: Option<String> },
}

/// One `set-path`/`link-path` declaration from the client's reporter.
#[derive(Debug, Clone)]
pub struct ReportedEntry {
    pub rev: Revision,
    pub start_empty: bool,
    pub lock_token: Option<String>,
    pub depth: Depth,
}

/// The client's declared mixed-revision working state, built up by
/// `set-path`/`delete-path` calls and sealed by `finish-report`.
#[derive(Debug, Default)]
pub struct Report {
    entries: BTreeMap<String, ReportedEntry>,
    deleted: BTreeSet<String>,
    finished: bool,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_path(
        &mut self,
        path: &str,
        rev: Revision,
        start_empty: bool,
        lock_token: Option<String>,
        depth: Depth,
    ) -> Result<(), ReportError> {
        if self.finished {
            return Err(ReportError::ReportFinished);
        }
        self.entries.insert(
            crate::models::canonicalize_path(path),
            ReportedEntry { rev, start_empty, lock_token, depth },
        );
        Ok(())
    }

    pub fn delete_path(&mut self, path: &str) -> Result<(), ReportError> {
        if self.finished {
            return Err(ReportError::ReportFinished);
        }
        self.deleted.insert(crate::models::canonicalize_path(path));
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(), ReportError> {
        if self.entries.is_empty() {
            return Err(ReportError::EmptyReport);
        }
        self.finished = true;
        Ok(())
    }

    /// The reported state governing `path`: its own entry if the client
    /// declared one, else the nearest reported ancestor's (mixed-revision
    /// `set-path` semantics: an un-reported subtree inherits its parent's
    /// declared revision).
    fn entry_for(&self, path: &str) -> &ReportedEntry {
        let mut candidate = path;
        loop {
            if let Some(entry) = self.entries.get(candidate) {
                return entry;
            }
            if candidate == "/" {
                break;
            }
            candidate = match candidate.rfind('/') {
                Some(0) => "/",
                Some(idx) => &candidate[..idx],
                None => "/",
            };
        }
        self.entries
            .get("/")
            .expect("finish() requires at least one reported entry, and every path's ancestor search terminates at '/'")
    }

    fn is_explicitly_deleted(&self, path: &str) -> bool {
        self.deleted.contains(path)
    }
}

/// Drive a full update/switch diff: `report` is the client's declared state,
/// `target_rev` is the revision being updated/switched to, `switch_target`
/// is `Some(path)` for a `switch` (the root maps to a different path than
/// what was reported) or `None` for a plain `update`/`status`/`diff`.
pub fn drive_update(
    fs: &VersionedFs,
    report: &Report,
    target_rev: Revision,
    switch_target: Option<&str>,
) -> Result<Vec<EditorOp>, ReportError> {
    if report.entries.is_empty() {
        return Err(ReportError::EmptyReport);
    }
    let mut ops = Vec::new();
    let root = report.entry_for("/");
    ops.push(EditorOp::OpenRoot { rev: root.rev });

    let target_root = switch_target.map(crate::models::canonicalize_path).unwrap_or_else(|| "/".to_string());
    diff_dir_children(fs, report, "/", &target_root, target_rev, root.depth, &mut ops)?;
    Ok(ops)
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn diff_dir_children(
    fs: &VersionedFs,
    report: &Report,
    reported_dir: &str,
    target_dir: &str,
    target_rev: Revision,
    depth: Depth,
    ops: &mut Vec<EditorOp>,
) -> Result<(), ReportError> {
    if depth == Depth::Empty {
        return Ok(());
    }

    let dir_report = report.entry_for(reported_dir);
    let reported_listing = if dir_report.start_empty {
        Vec::new()
    } else {
        fs.list(dir_report.rev, reported_dir)?
    };
    let target_listing = fs.list(target_rev, target_dir)?;

    let reported_names: BTreeMap<&str, NodeKind> =
        reported_listing.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    let target_names: BTreeMap<&str, NodeKind> =
        target_listing.iter().map(|e| (e.name.as_str(), e.kind)).collect();

    let mut all_names: BTreeSet<&str> = reported_names.keys().copied().collect();
    all_names.extend(target_names.keys().copied());

    for name in all_names {
        if depth == Depth::Files && target_names.get(name) == Some(&NodeKind::Dir) {
            continue;
        }
        let reported_child = join(reported_dir, name);
        let target_child = join(target_dir, name);

        if report.is_explicitly_deleted(&reported_child) && !target_names.contains_key(name) {
            ops.push(EditorOp::DeleteEntry { path: target_child });
            continue;
        }

        match (reported_names.get(name), target_names.get(name)) {
            (Some(_), None) => {
                ops.push(EditorOp::DeleteEntry { path: target_child });
            }
            (None, Some(target_kind)) => {
                diff_added_entry(fs, &target_child, target_rev, *target_kind, depth, ops)?;
            }
            (Some(reported_kind), Some(target_kind)) if reported_kind != target_kind => {
                ops.push(EditorOp::DeleteEntry { path: target_child.clone() });
                diff_added_entry(fs, &target_child, target_rev, *target_kind, depth, ops)?;
            }
            (Some(_), Some(target_kind)) => {
                diff_existing_entry(
                    fs,
                    report,
                    &reported_child,
                    &target_child,
                    target_rev,
                    *target_kind,
                    depth,
                    ops,
                )?;
            }
            (None, None) => unreachable!("name came from the union of both listings"),
        }
    }
    Ok(())
}

fn child_depth(depth: Depth) -> Depth {
    match depth {
        Depth::Infinity => Depth::Infinity,
        _ => Depth::Empty,
    }
}

fn diff_added_entry(
    fs: &VersionedFs,
    target_path: &str,
    target_rev: Revision,
    kind: NodeKind,
    depth: Depth,
    ops: &mut Vec<EditorOp>,
) -> Result<(), ReportError> {
    match kind {
        NodeKind::Dir => {
            ops.push(EditorOp::AddDir { path: target_path.to_string(), copy_from: None });
            let node = fs.stat(target_rev, target_path)?;
            emit_all_props(target_path, node.as_ref(), ops);
            diff_dir_children(fs, &Report::default(), "/__unreported__", target_path, target_rev, child_depth(depth), ops)?;
            ops.push(EditorOp::CloseDir { path: target_path.to_string() });
        }
        NodeKind::File => {
            ops.push(EditorOp::AddFile { path: target_path.to_string(), copy_from: None });
            let node = fs.stat(target_rev, target_path)?;
            emit_all_props(target_path, node.as_ref(), ops);
            let content = fs.read(target_rev, target_path)?;
            let delta = crate::delta::encode(&[], &content);
            ops.push(EditorOp::ApplyTextDelta { path: target_path.to_string(), base_checksum: None, delta });
            let checksum = format!("{:x}", md5::compute(&content));
            ops.push(EditorOp::CloseFile { path: target_path.to_string(), text_checksum: Some(checksum) });
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn diff_existing_entry(
    fs: &VersionedFs,
    report: &Report,
    reported_path: &str,
    target_path: &str,
    target_rev: Revision,
    kind: NodeKind,
    depth: Depth,
    ops: &mut Vec<EditorOp>,
) -> Result<(), ReportError> {
    let dir_report = report.entry_for(reported_path);
    match kind {
        NodeKind::Dir => {
            let reported_node = fs.stat(dir_report.rev, reported_path)?;
            let target_node = fs.stat(target_rev, target_path)?;
            let prop_changed = props_differ(reported_node.as_ref(), target_node.as_ref());
            if prop_changed || reported_path != target_path {
                ops.push(EditorOp::OpenDir { path: target_path.to_string(), rev: dir_report.rev });
                emit_prop_diff(target_path, reported_node.as_ref(), target_node.as_ref(), ops);
                diff_dir_children(fs, report, reported_path, target_path, target_rev, child_depth(depth), ops)?;
                ops.push(EditorOp::CloseDir { path: target_path.to_string() });
            } else {
                // No local prop changes: still recurse to find deeper
                // changes, opening the dir lazily only if the recursion
                // actually produces anything.
                let mut nested = Vec::new();
                diff_dir_children(fs, report, reported_path, target_path, target_rev, child_depth(depth), &mut nested)?;
                if !nested.is_empty() {
                    ops.push(EditorOp::OpenDir { path: target_path.to_string(), rev: dir_report.rev });
                    ops.extend(nested);
                    ops.push(EditorOp::CloseDir { path: target_path.to_string() });
                }
            }
        }
        NodeKind::File => {
            let reported_node = fs.stat(dir_report.rev, reported_path)?;
            let target_node = fs.stat(target_rev, target_path)?;
            let blob_changed = match (&reported_node, &target_node) {
                (Some(Node::File { blob_id: a, .. }), Some(Node::File { blob_id: b, .. })) => a != b,
                _ => true,
            };
            let prop_changed = props_differ(reported_node.as_ref(), target_node.as_ref());
            if !blob_changed && !prop_changed {
                return Ok(());
            }
            ops.push(EditorOp::OpenFile { path: target_path.to_string(), rev: dir_report.rev });
            emit_prop_diff(target_path, reported_node.as_ref(), target_node.as_ref(), ops);
            if blob_changed {
                let base = if dir_report.start_empty {
                    Vec::new()
                } else {
                    fs.read(dir_report.rev, reported_path)?
                };
                let target_content = fs.read(target_rev, target_path)?;
                let delta = crate::delta::encode(&base, &target_content);
                let base_checksum = if base.is_empty() { None } else { Some(format!("{:x}", md5::compute(&base))) };
                ops.push(EditorOp::ApplyTextDelta { path: target_path.to_string(), base_checksum, delta });
                let checksum = format!("{:x}", md5::compute(&target_content));
                ops.push(EditorOp::CloseFile { path: target_path.to_string(), text_checksum: Some(checksum) });
            } else {
                ops.push(EditorOp::CloseFile { path: target_path.to_string(), text_checksum: None });
            }
        }
    }
    Ok(())
}

fn props_differ(a: Option<&Node>, b: Option<&Node>) -> bool {
    let empty = PropertyMap::new();
    let pa = a.map(|n| n.properties()).unwrap_or(&empty);
    let pb = b.map(|n| n.properties()).unwrap_or(&empty);
    let ra: BTreeMap<&str, &[u8]> = pa.regular().collect();
    let rb: BTreeMap<&str, &[u8]> = pb.regular().collect();
    ra != rb
}

fn emit_prop_diff(path: &str, old: Option<&Node>, new: Option<&Node>, ops: &mut Vec<EditorOp>) {
    let empty = PropertyMap::new();
    let old_props = old.map(|n| n.properties()).unwrap_or(&empty);
    let new_props = new.map(|n| n.properties()).unwrap_or(&empty);
    let old_map: BTreeMap<&str, &[u8]> = old_props.regular().collect();
    let new_map: BTreeMap<&str, &[u8]> = new_props.regular().collect();

    let is_dir = matches!(new, Some(Node::Dir { .. })) || (new.is_none() && matches!(old, Some(Node::Dir { .. })));

    for (name, value) in &new_map {
        if old_map.get(name) != Some(value) {
            push_prop_op(path, name, Some(value.to_vec()), is_dir, ops);
        }
    }
    for name in old_map.keys() {
        if !new_map.contains_key(name) {
            push_prop_op(path, name, None, is_dir, ops);
        }
    }
}

fn emit_all_props(path: &str, node: Option<&Node>, ops: &mut Vec<EditorOp>) {
    let Some(node) = node else { return };
    let is_dir = matches!(node, Node::Dir { .. });
    for (name, value) in node.properties().regular() {
        push_prop_op(path, name, Some(value.to_vec()), is_dir, ops);
    }
}

fn push_prop_op(path: &str, name: &str, value: Option<Vec<u8>>, is_dir: bool, ops: &mut Vec<EditorOp>) {
    if is_dir {
        ops.push(EditorOp::ChangeDirProp { path: path.to_string(), name: name.to_string(), value });
    } else {
        ops.push(EditorOp::ChangeFileProp { path: path.to_string(), name: name.to_string(), value });
    }
}
