//! Applies one [`FactBatch`] to the store as idempotent writes.
//!
//! Step order is fixed: definitions, declarations with a defining key,
//! declarations without one, then edges. Edges resolve their endpoints by key
//! lookup, so every row they point at must already be written.

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::facts::{CallFact, FactBatch, FunctionKey, OverrideFact, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// When false, call edges and their implied endpoints are ignored.
    pub callgraph: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { callgraph: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub definitions_inserted: usize,
    pub declarations_inserted: usize,
    pub declarations_backfilled: usize,
    pub resolved_calls_inserted: usize,
    pub unresolved_calls_inserted: usize,
    pub resolved_overrides_inserted: usize,
    pub unresolved_overrides_inserted: usize,
    pub skipped_sentinel: usize,
    /// Edges whose endpoint lookup failed after implied endpoints were
    /// written. Stays zero unless the store is missing rows it just wrote.
    pub skipped_unresolvable_edges: usize,
    pub calls_ignored: usize,
}

impl MergeReport {
    pub fn rows_written(&self) -> usize {
        self.definitions_inserted
            + self.declarations_inserted
            + self.declarations_backfilled
            + self.resolved_calls_inserted
            + self.unresolved_calls_inserted
            + self.resolved_overrides_inserted
            + self.unresolved_overrides_inserted
    }
}

/// The batch flattened into the write order, with edge endpoints folded in.
struct MergePlan<'a> {
    definitions: Vec<&'a FunctionKey>,
    claimed: Vec<(&'a FunctionKey, &'a FunctionKey)>,
    unclaimed: Vec<&'a FunctionKey>,
    calls: Vec<&'a CallFact>,
    overrides: Vec<&'a OverrideFact>,
}

impl<'a> MergePlan<'a> {
    fn build(batch: &'a FactBatch, options: MergeOptions, report: &mut MergeReport) -> Self {
        let mut plan = Self {
            definitions: Vec::new(),
            claimed: Vec::new(),
            unclaimed: Vec::new(),
            calls: Vec::new(),
            overrides: Vec::new(),
        };
        let mut seen_definitions = HashSet::new();
        let mut seen_unclaimed = HashSet::new();

        let mut push_definition = |plan: &mut Self, key: &'a FunctionKey| {
            if seen_definitions.insert(key) {
                plan.definitions.push(key);
            }
        };
        let mut push_unclaimed = |plan: &mut Self, key: &'a FunctionKey| {
            if seen_unclaimed.insert(key) {
                plan.unclaimed.push(key);
            }
        };

        for key in &batch.definitions {
            if key.is_concrete() {
                push_definition(&mut plan, key);
            } else {
                warn!(%key, "skipping definition with sentinel key");
                report.skipped_sentinel += 1;
            }
        }

        for decl in &batch.declarations {
            if !decl.key.is_concrete() {
                warn!(key = %decl.key, "skipping declaration with sentinel key");
                report.skipped_sentinel += 1;
                continue;
            }
            match decl.definition.as_ref().filter(|def| def.is_concrete()) {
                Some(def) => plan.claimed.push((&decl.key, def)),
                None => push_unclaimed(&mut plan, &decl.key),
            }
        }

        if options.callgraph {
            for call in &batch.calls {
                if !call.caller.is_concrete() || !call.callee.is_concrete() {
                    warn!(
                        caller = %call.caller,
                        callee = %call.callee,
                        "skipping call edge with sentinel endpoint"
                    );
                    report.skipped_sentinel += 1;
                    continue;
                }
                push_definition(&mut plan, &call.caller);
                match call.resolution {
                    Resolution::Resolved => push_definition(&mut plan, &call.callee),
                    Resolution::Unresolved => push_unclaimed(&mut plan, &call.callee),
                }
                plan.calls.push(call);
            }
        } else {
            report.calls_ignored = batch.calls.len();
        }

        for item in &batch.overrides {
            if !item.method.is_concrete() || !item.base.is_concrete() {
                warn!(
                    method = %item.method,
                    base = %item.base,
                    "skipping override edge with sentinel endpoint"
                );
                report.skipped_sentinel += 1;
                continue;
            }
            push_definition(&mut plan, &item.method);
            match item.resolution {
                Resolution::Resolved => push_definition(&mut plan, &item.base),
                Resolution::Unresolved => push_unclaimed(&mut plan, &item.base),
            }
            plan.overrides.push(item);
        }

        plan
    }
}

/// Runs the whole batch against `conn`. The caller owns the transaction.
pub fn apply_batch(
    conn: &Connection,
    batch: &FactBatch,
    options: MergeOptions,
) -> rusqlite::Result<MergeReport> {
    let mut report = MergeReport::default();
    let plan = MergePlan::build(batch, options, &mut report);

    for key in &plan.definitions {
        insert_definition(conn, key, &mut report)?;
    }
    debug!(inserted = report.definitions_inserted, "definitions merged");

    for (key, def) in &plan.claimed {
        merge_claimed_declaration(conn, key, def, &mut report)?;
    }
    for key in &plan.unclaimed {
        report.declarations_inserted += insert_declaration(conn, key, None, None)?;
    }
    debug!(
        inserted = report.declarations_inserted,
        backfilled = report.declarations_backfilled,
        "declarations merged"
    );

    for call in &plan.calls {
        insert_call(conn, call, &mut report)?;
    }
    for item in &plan.overrides {
        insert_override(conn, item, &mut report)?;
    }
    debug!(
        skipped = report.skipped_unresolvable_edges,
        "edges merged"
    );

    Ok(report)
}

fn insert_definition(
    conn: &Connection,
    key: &FunctionKey,
    report: &mut MergeReport,
) -> rusqlite::Result<()> {
    let inserted = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO definitions (unit_path, signature, begin_line, end_line)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![key.unit_path, key.signature, key.begin_line, key.end_line])?;
    if inserted == 0 {
        return Ok(());
    }
    report.definitions_inserted += 1;

    // Declarations merged earlier may have claimed this key before it existed.
    let def_id = conn.last_insert_rowid();
    report.declarations_backfilled += conn
        .prepare_cached(
            "UPDATE declarations SET def_ref = ?1
             WHERE def_ref IS NULL
               AND def_unit_path = ?2 AND def_signature = ?3
               AND def_begin_line = ?4 AND def_end_line = ?5",
        )?
        .execute(params![
            def_id,
            key.unit_path,
            key.signature,
            key.begin_line,
            key.end_line
        ])?;
    Ok(())
}

/// Backfill-then-insert. Both halves run so either arrival order converges.
///
/// `def_ref` only ever follows the recorded claim, so a later claim naming a
/// different definition cannot move it away from the first one.
fn merge_claimed_declaration(
    conn: &Connection,
    key: &FunctionKey,
    def: &FunctionKey,
    report: &mut MergeReport,
) -> rusqlite::Result<()> {
    let def_id = definition_id(conn, def)?;

    conn.prepare_cached(
        "UPDATE declarations
         SET def_unit_path = ?5, def_signature = ?6, def_begin_line = ?7, def_end_line = ?8
         WHERE unit_path = ?1 AND signature = ?2 AND begin_line = ?3 AND end_line = ?4
           AND def_unit_path IS NULL",
    )?
    .execute(params![
        key.unit_path,
        key.signature,
        key.begin_line,
        key.end_line,
        def.unit_path,
        def.signature,
        def.begin_line,
        def.end_line
    ])?;

    if let Some(def_id) = def_id {
        report.declarations_backfilled += conn
            .prepare_cached(
                "UPDATE declarations SET def_ref = ?5
                 WHERE unit_path = ?1 AND signature = ?2 AND begin_line = ?3 AND end_line = ?4
                   AND def_ref IS NULL
                   AND def_unit_path = ?6 AND def_signature = ?7
                   AND def_begin_line = ?8 AND def_end_line = ?9",
            )?
            .execute(params![
                key.unit_path,
                key.signature,
                key.begin_line,
                key.end_line,
                def_id,
                def.unit_path,
                def.signature,
                def.begin_line,
                def.end_line
            ])?;
    }

    report.declarations_inserted += insert_declaration(conn, key, def_id, Some(def))?;
    Ok(())
}

fn insert_declaration(
    conn: &Connection,
    key: &FunctionKey,
    def_id: Option<i64>,
    claim: Option<&FunctionKey>,
) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO declarations (
            unit_path, signature, begin_line, end_line, def_ref,
            def_unit_path, def_signature, def_begin_line, def_end_line
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        key.unit_path,
        key.signature,
        key.begin_line,
        key.end_line,
        def_id,
        claim.map(|def| def.unit_path.as_str()),
        claim.map(|def| def.signature.as_str()),
        claim.map(|def| def.begin_line),
        claim.map(|def| def.end_line)
    ])
}

fn insert_call(
    conn: &Connection,
    call: &CallFact,
    report: &mut MergeReport,
) -> rusqlite::Result<()> {
    let caller = definition_id(conn, &call.caller)?;
    let (callee, sql) = match call.resolution {
        Resolution::Resolved => (
            definition_id(conn, &call.callee)?,
            "INSERT OR IGNORE INTO call_edges_resolved (caller, callee, line, col, is_virtual)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        ),
        Resolution::Unresolved => (
            declaration_id(conn, &call.callee)?,
            "INSERT OR IGNORE INTO call_edges_unresolved (caller, callee, line, col, is_virtual)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        ),
    };
    let (Some(caller), Some(callee)) = (caller, callee) else {
        warn!(
            caller = %call.caller,
            callee = %call.callee,
            line = call.line,
            column = call.column,
            "skipping call edge with unknown endpoint"
        );
        report.skipped_unresolvable_edges += 1;
        return Ok(());
    };

    let inserted = conn.prepare_cached(sql)?.execute(params![
        caller,
        callee,
        call.line,
        call.column,
        call.is_virtual
    ])?;
    match call.resolution {
        Resolution::Resolved => report.resolved_calls_inserted += inserted,
        Resolution::Unresolved => report.unresolved_calls_inserted += inserted,
    }
    Ok(())
}

fn insert_override(
    conn: &Connection,
    item: &OverrideFact,
    report: &mut MergeReport,
) -> rusqlite::Result<()> {
    let method = definition_id(conn, &item.method)?;
    let (base, sql) = match item.resolution {
        Resolution::Resolved => (
            definition_id(conn, &item.base)?,
            "INSERT OR IGNORE INTO override_edges_resolved (def, base_def) VALUES (?1, ?2)",
        ),
        Resolution::Unresolved => (
            declaration_id(conn, &item.base)?,
            "INSERT OR IGNORE INTO override_edges_unresolved (def, base_decl) VALUES (?1, ?2)",
        ),
    };
    let (Some(method), Some(base)) = (method, base) else {
        warn!(
            method = %item.method,
            base = %item.base,
            "skipping override edge with unknown endpoint"
        );
        report.skipped_unresolvable_edges += 1;
        return Ok(());
    };

    let inserted = conn.prepare_cached(sql)?.execute(params![method, base])?;
    match item.resolution {
        Resolution::Resolved => report.resolved_overrides_inserted += inserted,
        Resolution::Unresolved => report.unresolved_overrides_inserted += inserted,
    }
    Ok(())
}

pub(crate) fn definition_id(conn: &Connection, key: &FunctionKey) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(
        "SELECT id FROM definitions
         WHERE unit_path = ?1 AND signature = ?2 AND begin_line = ?3 AND end_line = ?4",
    )?
    .query_row(
        params![key.unit_path, key.signature, key.begin_line, key.end_line],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn declaration_id(
    conn: &Connection,
    key: &FunctionKey,
) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(
        "SELECT id FROM declarations
         WHERE unit_path = ?1 AND signature = ?2 AND begin_line = ?3 AND end_line = ?4",
    )?
    .query_row(
        params![key.unit_path, key.signature, key.begin_line, key.end_line],
        |row| row.get(0),
    )
    .optional()
}
