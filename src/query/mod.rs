pub mod changes;
pub mod compress;
pub mod export;

pub use changes::{FileChanges, FilePatch, FunctionSpan, SnapshotUpdate, update_snapshot};
pub use export::{
    CallTarget, ExportSummary, Snapshot, SnapshotCall, SnapshotDefinition, build_snapshot,
    compact_signature, export, load_snapshot, write_snapshot,
};
