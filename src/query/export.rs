//! Compiles the six relations into one read-only snapshot for the viewer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EffectiveConfig;
use crate::error::ExportError;
use crate::index::{CallRow, FactIndex};
use crate::query::compress::{compress_snapshot, decompress_snapshot, is_compressed};
use crate::store::atomic::replace_file;
use crate::store::with_locked_index;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallTarget {
    Single(i64),
    Overridden(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCall {
    pub target: CallTarget,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    pub id: i64,
    /// Index into [`Snapshot::files`].
    pub file: usize,
    pub signature: String,
    pub begin_line: u32,
    pub end_line: u32,
    pub calls: Vec<SnapshotCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: String,
    pub generated_at: String,
    pub files: Vec<String>,
    pub definitions: Vec<SnapshotDefinition>,
    #[serde(skip)]
    pub dropped_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub revision: String,
    pub output: PathBuf,
    pub files: usize,
    pub definitions: usize,
    pub calls: usize,
    pub dropped_calls: usize,
    pub compressed: bool,
    pub bytes: usize,
}

/// Collapses the whitespace variants compilers print inside signatures.
pub fn compact_signature(signature: &str) -> String {
    signature
        .replace(", ", ",")
        .replace(" *", "*")
        .replace(" &", "&")
}

pub fn build_snapshot(index: &FactIndex, revision: &str) -> rusqlite::Result<Snapshot> {
    build_snapshot_at(index, revision, Utc::now())
}

pub fn build_snapshot_at(
    index: &FactIndex,
    revision: &str,
    generated_at: DateTime<Utc>,
) -> rusqlite::Result<Snapshot> {
    let definitions = index.definitions()?;

    let files: Vec<String> = definitions
        .iter()
        .map(|row| row.key.unit_path.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let file_ids: HashMap<&str, usize> = files
        .iter()
        .enumerate()
        .map(|(n, file)| (file.as_str(), n))
        .collect();

    let mut by_name: HashMap<String, Vec<i64>> = HashMap::new();
    let mut entries: BTreeMap<i64, SnapshotDefinition> = BTreeMap::new();
    for row in &definitions {
        let signature = compact_signature(&row.key.signature);
        by_name.entry(signature.clone()).or_default().push(row.id);
        entries.insert(
            row.id,
            SnapshotDefinition {
                id: row.id,
                file: file_ids[row.key.unit_path.as_str()],
                signature,
                begin_line: row.key.begin_line,
                end_line: row.key.end_line,
                calls: Vec::new(),
            },
        );
    }

    let resolved_decls: HashMap<i64, i64> = index
        .declarations()?
        .into_iter()
        .filter_map(|decl| {
            let target = decl.def_ref.or_else(|| {
                match by_name.get(&compact_signature(&decl.key.signature)) {
                    Some(ids) if ids.len() == 1 => Some(ids[0]),
                    _ => None,
                }
            })?;
            Some((decl.id, target))
        })
        .collect();

    let mut related: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    let mut relate = |a: i64, b: i64| {
        related.entry(a).or_default().insert(b);
        related.entry(b).or_default().insert(a);
    };
    for (def, base) in index.resolved_overrides()? {
        relate(def, base);
    }
    for (def, base_decl) in index.unresolved_overrides()? {
        if let Some(&base) = resolved_decls.get(&base_decl) {
            relate(def, base);
        }
    }

    let mut dropped_calls = 0;
    let attach = |entries: &mut BTreeMap<i64, SnapshotDefinition>, call: &CallRow, callee: i64| {
        let target = match related.get(&callee) {
            Some(peers) if call.is_virtual && peers.len() > 1 => {
                CallTarget::Overridden(peers.iter().copied().collect())
            }
            Some(peers) if call.is_virtual => {
                CallTarget::Single(peers.iter().next().copied().unwrap_or(callee))
            }
            _ => CallTarget::Single(callee),
        };
        if let Some(entry) = entries.get_mut(&call.caller) {
            entry.calls.push(SnapshotCall {
                target,
                line: call.line,
                column: call.column,
            });
        }
    };
    for call in index.resolved_calls()? {
        attach(&mut entries, &call, call.callee);
    }
    for call in index.unresolved_calls()? {
        match resolved_decls.get(&call.callee) {
            Some(&callee) => attach(&mut entries, &call, callee),
            None => dropped_calls += 1,
        }
    }

    let mut definitions: Vec<SnapshotDefinition> = entries.into_values().collect();
    for entry in &mut definitions {
        entry.calls.sort_by_key(|call| (call.line, call.column));
    }
    debug!(
        definitions = definitions.len(),
        overridden = related.len(),
        dropped_calls,
        "snapshot compiled"
    );

    Ok(Snapshot {
        revision: revision.to_string(),
        generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        files,
        definitions,
        dropped_calls,
    })
}

/// Compiles the store under the lock, then writes the snapshot to `output`.
pub fn export(
    config: &EffectiveConfig,
    revision: &str,
    output: &Path,
    compress: bool,
) -> Result<ExportSummary, ExportError> {
    let snapshot = with_locked_index(config, |index| -> Result<Snapshot, ExportError> {
        Ok(build_snapshot(index, revision)?)
    })?;

    let bytes = write_snapshot(&snapshot, output, compress)?;

    let summary = ExportSummary {
        revision: snapshot.revision.clone(),
        output: output.to_path_buf(),
        files: snapshot.files.len(),
        definitions: snapshot.definitions.len(),
        calls: snapshot.definitions.iter().map(|d| d.calls.len()).sum(),
        dropped_calls: snapshot.dropped_calls,
        compressed: compress,
        bytes,
    };
    info!(
        output = %output.display(),
        revision,
        definitions = summary.definitions,
        bytes = summary.bytes,
        "exported snapshot"
    );
    Ok(summary)
}

/// Atomically replaces `output` with the encoded snapshot. Returns the bytes written.
pub fn write_snapshot(
    snapshot: &Snapshot,
    output: &Path,
    compress: bool,
) -> Result<usize, ExportError> {
    let json = serde_json::to_vec(snapshot)?;
    let bytes = if compress {
        compress_snapshot(&json)?
    } else {
        json
    };
    replace_file(output, &bytes)?;
    Ok(bytes.len())
}

/// Reads a snapshot written by [`export`], compressed or not.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, ExportError> {
    let raw = fs::read(path)?;
    let json = if is_compressed(&raw) {
        decompress_snapshot(&raw)?
    } else {
        raw
    };
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{FactBatch, FunctionKey, Resolution};
    use crate::index::merge::MergeOptions;
    use chrono::TimeZone;

    fn key(path: &str, sig: &str, begin: u32, end: u32) -> FunctionKey {
        FunctionKey::new(path, sig, begin, end)
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid time")
    }

    fn index_with(batch: &FactBatch) -> FactIndex {
        let mut index = FactIndex::open_in_memory().expect("sqlite");
        index
            .merge_batch(batch, MergeOptions::default())
            .expect("merge");
        index
    }

    #[test]
    fn compacts_signature_spacing() {
        assert_eq!(
            compact_signature("void f(int *, const Foo &, char)"),
            "void f(int*,const Foo&,char)"
        );
    }

    #[test]
    fn snapshot_indexes_files_and_resolved_calls() {
        let f = key("b.cpp", "void f(int, int)", 1, 5);
        let g = key("a.cpp", "void g()", 7, 9);
        let mut batch = FactBatch::new();
        batch.add_call(f.clone(), g.clone(), 3, 4, false, Resolution::Resolved);
        let index = index_with(&batch);

        let snapshot = build_snapshot_at(&index, "rev1", fixed_time()).expect("snapshot");
        assert_eq!(snapshot.revision, "rev1");
        assert_eq!(snapshot.generated_at, "2024-05-01T12:00:00Z");
        assert_eq!(snapshot.files, vec!["a.cpp", "b.cpp"]);

        let caller = snapshot
            .definitions
            .iter()
            .find(|d| d.signature == "void f(int,int)")
            .expect("caller entry");
        assert_eq!(caller.file, 1);
        let g_id = index.definition_id(&g).expect("lookup").expect("g stored");
        assert_eq!(
            caller.calls,
            vec![SnapshotCall {
                target: CallTarget::Single(g_id),
                line: 3,
                column: 4
            }]
        );
    }

    #[test]
    fn unresolved_call_resolves_by_unique_name_or_drops() {
        let caller = key("main.cpp", "int main()", 1, 10);
        let unique_decl = key("lib.h", "void lib(int *)", 2, 2);
        let unique_def = key("lib.cpp", "void lib(int*)", 5, 8);
        let ambiguous_decl = key("dup.h", "void dup()", 1, 1);
        let mut batch = FactBatch::new();
        batch
            .add_definition(unique_def.clone())
            .add_definition(key("dup1.cpp", "void dup()", 1, 2))
            .add_definition(key("dup2.cpp", "void dup()", 1, 2))
            .add_call(caller.clone(), unique_decl, 3, 1, false, Resolution::Unresolved)
            .add_call(caller.clone(), ambiguous_decl, 4, 1, false, Resolution::Unresolved);
        let index = index_with(&batch);

        let snapshot = build_snapshot_at(&index, "r", fixed_time()).expect("snapshot");
        let main_id = index.definition_id(&caller).expect("lookup").expect("main");
        let lib_id = index.definition_id(&unique_def).expect("lookup").expect("lib");
        let main = snapshot
            .definitions
            .iter()
            .find(|d| d.id == main_id)
            .expect("main entry");
        assert_eq!(main.calls.len(), 1);
        assert_eq!(main.calls[0].target, CallTarget::Single(lib_id));
        assert_eq!(snapshot.dropped_calls, 1);
    }

    #[test]
    fn virtual_call_expands_to_override_peers() {
        let caller = key("use.cpp", "void use(Base&)", 1, 4);
        let base = key("base.cpp", "void Base::run()", 1, 2);
        let left = key("left.cpp", "void Left::run()", 1, 2);
        let right = key("right.cpp", "void Right::run()", 1, 2);
        let mut batch = FactBatch::new();
        batch
            .add_override(left.clone(), base.clone(), Resolution::Resolved)
            .add_override(right.clone(), base.clone(), Resolution::Resolved)
            .add_call(caller.clone(), base.clone(), 2, 5, true, Resolution::Resolved)
            .add_call(caller.clone(), left.clone(), 3, 5, false, Resolution::Resolved);
        let index = index_with(&batch);

        let id = |k: &FunctionKey| index.definition_id(k).expect("lookup").expect("stored");
        let snapshot = build_snapshot_at(&index, "r", fixed_time()).expect("snapshot");
        let entry = snapshot
            .definitions
            .iter()
            .find(|d| d.id == id(&caller))
            .expect("caller entry");

        let mut peers = vec![id(&left), id(&right)];
        peers.sort();
        assert_eq!(entry.calls[0].target, CallTarget::Overridden(peers));
        assert_eq!(entry.calls[1].target, CallTarget::Single(id(&left)));
    }

    #[test]
    fn export_writes_loadable_compressed_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EffectiveConfig {
            database: dir.path().join("facts.sqlite"),
            lock: dir.path().join("facts.sqlite.lock"),
            callgraph: true,
            root: None,
        };
        let mut batch = FactBatch::new();
        batch.add_definition(key("a.cpp", "f()", 1, 2));
        crate::store::merge(&config, &batch).expect("merge");

        let output = dir.path().join("out/graph.json.zst");
        let summary = export(&config, "deadbeef", &output, true).expect("export");
        assert!(summary.compressed);
        assert_eq!(summary.definitions, 1);

        let loaded = load_snapshot(&output).expect("load");
        assert_eq!(loaded.revision, "deadbeef");
        assert_eq!(loaded.definitions[0].signature, "f()");
    }
}
