//! Carries a compiled snapshot forward across a source patch.
//!
//! Only files the patch touches are taken from the newer snapshot; everything
//! else keeps its ids from the older one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use diffy::{Line, Patch};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChangesError;
use crate::query::export::{CallTarget, Snapshot, SnapshotCall, SnapshotDefinition};

const NULL_PATH: &str = "/dev/null";

/// Line numbers a single-file patch deletes (old side) and inserts (new side).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub deleted_lines: Vec<u32>,
    pub inserted_lines: Vec<u32>,
}

impl FilePatch {
    fn key(&self) -> Option<&str> {
        self.old_path.as_deref().or(self.new_path.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionSpan {
    pub signature: String,
    pub begin_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub added: Vec<FunctionSpan>,
    pub removed: Vec<FunctionSpan>,
    pub modified: Vec<FunctionSpan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub snapshot: Snapshot,
    /// Keyed by the path on the old side of the patch.
    pub changes: BTreeMap<String, FileChanges>,
}

pub fn update_snapshot(
    before: &Snapshot,
    after: &Snapshot,
    patch: &str,
) -> Result<SnapshotUpdate, ChangesError> {
    let patches = parse_patch(patch)?;
    let changes = detect_changes(&patches, before, after);
    let snapshot = merge_snapshots(&patches, before, after);
    debug!(
        files = patches.len(),
        changed_files = changes.len(),
        definitions = snapshot.definitions.len(),
        "snapshot updated from patch"
    );
    Ok(SnapshotUpdate { snapshot, changes })
}

/// Parses a unified diff covering any number of files.
pub fn parse_patch(diff: &str) -> Result<Vec<FilePatch>, ChangesError> {
    let mut out = Vec::new();
    for chunk in split_files(diff) {
        let label = chunk.lines().next().unwrap_or_default().to_string();
        let patch = Patch::from_str(chunk).map_err(|err| ChangesError::Patch {
            path: label,
            message: err.to_string(),
        })?;

        let mut file = FilePatch {
            old_path: patch.original().and_then(patch_path),
            new_path: patch.modified().and_then(patch_path),
            ..FilePatch::default()
        };
        for hunk in patch.hunks() {
            let mut old_line = hunk.old_range().start() as u32;
            let mut new_line = hunk.new_range().start() as u32;
            for line in hunk.lines() {
                match line {
                    Line::Context(_) => {
                        old_line += 1;
                        new_line += 1;
                    }
                    Line::Delete(_) => {
                        file.deleted_lines.push(old_line);
                        old_line += 1;
                    }
                    Line::Insert(_) => {
                        file.inserted_lines.push(new_line);
                        new_line += 1;
                    }
                }
            }
        }
        out.push(file);
    }
    Ok(out)
}

/// Cuts a multi-file diff into single-file patches starting at their `---`
/// header. Chunks without hunks (mode changes, binary files) are dropped.
fn split_files(diff: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    let mut offset = 0;
    let lines: Vec<&str> = diff.split_inclusive('\n').collect();
    let git_style = lines.iter().any(|line| line.starts_with("diff "));
    for (n, line) in lines.iter().enumerate() {
        let boundary = if git_style {
            line.starts_with("diff ")
        } else {
            line.starts_with("--- ")
                && lines.get(n + 1).is_some_and(|l| l.starts_with("+++ "))
                && lines.get(n + 2).is_some_and(|l| l.starts_with("@@ "))
        };
        if boundary {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts.push(diff.len());

    starts
        .windows(2)
        .filter_map(|pair| {
            let chunk = &diff[pair[0]..pair[1]];
            let header = chunk
                .match_indices("--- ")
                .map(|(at, _)| at)
                .find(|&at| at == 0 || chunk.as_bytes()[at - 1] == b'\n')?;
            let body = &chunk[header..];
            body.lines()
                .any(|line| line.starts_with("@@ "))
                .then_some(body)
        })
        .collect()
}

fn patch_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == NULL_PATH {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

type FunctionRanges<'a> = BTreeMap<&'a str, (u32, u32)>;

fn functions_in<'a>(snapshot: &'a Snapshot, path: Option<&str>) -> FunctionRanges<'a> {
    let Some(path) = path else {
        return BTreeMap::new();
    };
    snapshot
        .definitions
        .iter()
        .filter(|def| snapshot.files.get(def.file).is_some_and(|f| f == path))
        .map(|def| (def.signature.as_str(), (def.begin_line, def.end_line)))
        .collect()
}

fn functions_at<'a>(functions: &FunctionRanges<'a>, lines: &[u32]) -> BTreeSet<&'a str> {
    functions
        .iter()
        .filter(|(_, (begin, end))| lines.iter().any(|line| begin <= line && line <= end))
        .map(|(signature, _)| *signature)
        .collect()
}

/// Lists, per file, the functions whose line range a patch line falls in.
pub fn detect_changes(
    patches: &[FilePatch],
    before: &Snapshot,
    after: &Snapshot,
) -> BTreeMap<String, FileChanges> {
    let mut out = BTreeMap::new();
    for file in patches {
        let Some(key) = file.key() else {
            continue;
        };
        let old_funs = functions_in(before, file.old_path.as_deref());
        let new_funs = functions_in(after, file.new_path.as_deref());

        let touched_old = functions_at(&old_funs, &file.deleted_lines);
        let touched_new = functions_at(&new_funs, &file.inserted_lines);
        let touched: BTreeSet<&str> = touched_old.union(&touched_new).copied().collect();

        let old_hit: BTreeSet<&str> = old_funs.keys().copied().filter(|s| touched.contains(s)).collect();
        let new_hit: BTreeSet<&str> = new_funs.keys().copied().filter(|s| touched.contains(s)).collect();

        let span = |funs: &FunctionRanges<'_>, signature: &str| {
            let (begin_line, end_line) = funs.get(signature).copied().unwrap_or_default();
            FunctionSpan {
                signature: signature.to_string(),
                begin_line,
                end_line,
            }
        };
        let changes = FileChanges {
            added: new_hit.difference(&old_hit).map(|s| span(&new_funs, *s)).collect(),
            removed: old_hit.difference(&new_hit).map(|s| span(&old_funs, *s)).collect(),
            modified: old_hit.intersection(&new_hit).map(|s| span(&old_funs, *s)).collect(),
        };
        if !changes.added.is_empty() || !changes.removed.is_empty() || !changes.modified.is_empty() {
            out.insert(key.to_string(), changes);
        }
    }
    out
}

/// Replaces the definitions of every patched file in `before` with those
/// from `after`, remapping call targets into one id space.
pub fn merge_snapshots(patches: &[FilePatch], before: &Snapshot, after: &Snapshot) -> Snapshot {
    let patched: BTreeSet<&str> = patches
        .iter()
        .flat_map(|p| [p.old_path.as_deref(), p.new_path.as_deref()])
        .flatten()
        .collect();
    let before_path = |def: &SnapshotDefinition| before.files.get(def.file).map(String::as_str);
    let after_path = |def: &SnapshotDefinition| after.files.get(def.file).map(String::as_str);

    let mut kept = Vec::new();
    let mut replaced = Vec::new();
    for def in &before.definitions {
        match before_path(def) {
            Some(path) if patched.contains(path) => replaced.push((def, path)),
            Some(path) => kept.push((def, path)),
            None => {}
        }
    }
    let kept_by_key: HashMap<(&str, &str, u32, u32), i64> = kept
        .iter()
        .map(|(def, path)| ((*path, def.signature.as_str(), def.begin_line, def.end_line), def.id))
        .collect();

    let mut next_id = before.definitions.iter().map(|d| d.id).max().unwrap_or(0) + 1;
    let mut imported = Vec::new();
    let mut after_ids: HashMap<i64, i64> = HashMap::new();
    for def in &after.definitions {
        let Some(path) = after_path(def) else {
            continue;
        };
        if patched.contains(path) {
            after_ids.insert(def.id, next_id);
            imported.push((def, path, next_id));
            next_id += 1;
        } else if let Some(&id) =
            kept_by_key.get(&(path, def.signature.as_str(), def.begin_line, def.end_line))
        {
            after_ids.insert(def.id, id);
        }
    }

    let mut imported_by_name: HashMap<(&str, &str), Vec<i64>> = HashMap::new();
    for (def, path, id) in &imported {
        imported_by_name
            .entry((*path, def.signature.as_str()))
            .or_default()
            .push(*id);
    }
    let mut before_ids: HashMap<i64, i64> = kept.iter().map(|(def, _)| (def.id, def.id)).collect();
    for (def, path) in &replaced {
        if let Some([id]) = imported_by_name.get(&(*path, def.signature.as_str())).map(Vec::as_slice) {
            before_ids.insert(def.id, *id);
        }
    }

    let files: Vec<String> = kept
        .iter()
        .map(|(_, path)| *path)
        .chain(imported.iter().map(|(_, path, _)| *path))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let file_ids: HashMap<&str, usize> = files
        .iter()
        .enumerate()
        .map(|(n, file)| (file.as_str(), n))
        .collect();

    let mut definitions: Vec<SnapshotDefinition> = kept
        .iter()
        .map(|(def, path)| SnapshotDefinition {
            file: file_ids[path],
            calls: remap_calls(&def.calls, &before_ids),
            ..(*def).clone()
        })
        .chain(imported.iter().map(|(def, path, id)| SnapshotDefinition {
            id: *id,
            file: file_ids[path],
            calls: remap_calls(&def.calls, &after_ids),
            ..(*def).clone()
        }))
        .collect();
    definitions.sort_by_key(|def| def.id);

    Snapshot {
        revision: after.revision.clone(),
        generated_at: after.generated_at.clone(),
        files,
        definitions,
        dropped_calls: 0,
    }
}

fn remap_calls(calls: &[SnapshotCall], ids: &HashMap<i64, i64>) -> Vec<SnapshotCall> {
    calls
        .iter()
        .filter_map(|call| {
            let target = match &call.target {
                CallTarget::Single(id) => CallTarget::Single(*ids.get(id)?),
                CallTarget::Overridden(targets) => {
                    let mut mapped: Vec<i64> =
                        targets.iter().filter_map(|id| ids.get(id).copied()).collect();
                    mapped.sort_unstable();
                    mapped.dedup();
                    match mapped.len() {
                        0 => return None,
                        1 => CallTarget::Single(mapped[0]),
                        _ => CallTarget::Overridden(mapped),
                    }
                }
            };
            Some(SnapshotCall {
                target,
                line: call.line,
                column: call.column,
            })
        })
        .collect()
}
