//! One unit's end-of-compilation merge, serialized across processes.
//!
//! Every merge runs the same sequence: take the lock, open (creating on first
//! use) the store, apply the batch in one immediate transaction, close the
//! store, release the lock. Close and release happen on every path after the
//! lock is held.

use std::borrow::Cow;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::EffectiveConfig;
use crate::error::MergeError;
use crate::facts::FactBatch;
use crate::index::FactIndex;
use crate::index::merge::{MergeOptions, MergeReport};
use crate::store::lock::StoreLock;

/// Merges `batch` into the store named by `config`.
///
/// Blocks while another merge holds the lock. An empty batch still opens
/// the store, so the first call in a fresh build creates the schema.
pub fn merge(config: &EffectiveConfig, batch: &FactBatch) -> Result<MergeReport, MergeError> {
    let started = Instant::now();
    let batch = match &config.root {
        Some(root) => Cow::Owned(batch.clone().rebase(root)),
        None => Cow::Borrowed(batch),
    };
    let options = MergeOptions {
        callgraph: config.callgraph,
    };

    let report = with_locked_index(config, |index| index.merge_batch(&batch, options))?;
    info!(
        database = %config.database.display(),
        facts = batch.fact_count(),
        rows_written = report.rows_written(),
        skipped_sentinel = report.skipped_sentinel,
        skipped_edges = report.skipped_unresolvable_edges,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "merged fact batch"
    );
    Ok(report)
}

/// Runs `f` against the store while holding the store lock.
///
/// The store handle is closed before the lock is released, whatever `f`
/// returned.
pub fn with_locked_index<T, E, F>(config: &EffectiveConfig, f: F) -> Result<T, E>
where
    E: From<MergeError>,
    F: FnOnce(&mut FactIndex) -> Result<T, E>,
{
    let mut lock = StoreLock::open(&config.lock)?;
    let guard = lock.acquire()?;

    let mut index = FactIndex::open(&config.database)?;
    let result = f(&mut index);
    index.close();
    debug!(database = %config.database.display(), "fact store closed");

    drop(guard);
    result
}
