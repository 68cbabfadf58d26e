use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use callmerge::config::EffectiveConfig;
use callmerge::error::MergeError;
use callmerge::facts::{FactBatch, FunctionKey, Resolution};
use callmerge::index::FactIndex;
use callmerge::store::{merge, with_locked_index};
use rusqlite::Connection;

type CallEdge = (FunctionKey, FunctionKey, u32, u32, bool);

/// Relation contents with row ids replaced by the keys they point at.
#[derive(Debug, PartialEq, Eq)]
struct StoreState {
    definitions: BTreeSet<FunctionKey>,
    declarations: BTreeSet<(FunctionKey, Option<FunctionKey>)>,
    resolved_calls: BTreeSet<CallEdge>,
    unresolved_calls: BTreeSet<CallEdge>,
    resolved_overrides: BTreeSet<(FunctionKey, FunctionKey)>,
    unresolved_overrides: BTreeSet<(FunctionKey, FunctionKey)>,
}

fn config_in(dir: &Path) -> EffectiveConfig {
    EffectiveConfig {
        database: dir.join("facts.sqlite"),
        lock: dir.join("facts.lock"),
        callgraph: true,
        root: None,
    }
}

fn key(path: &str, sig: &str, begin: u32, end: u32) -> FunctionKey {
    FunctionKey::new(path, sig, begin, end)
}

fn read_state(index: &FactIndex) -> rusqlite::Result<StoreState> {
    let defs: HashMap<i64, FunctionKey> = index
        .definitions()?
        .into_iter()
        .map(|row| (row.id, row.key))
        .collect();
    let decl_rows = index.declarations()?;
    let decls: HashMap<i64, FunctionKey> = decl_rows
        .iter()
        .map(|row| (row.id, row.key.clone()))
        .collect();

    let call_edges = |rows: Vec<callmerge::index::CallRow>, callees: &HashMap<i64, FunctionKey>| {
        rows.into_iter()
            .map(|row| {
                (
                    defs[&row.caller].clone(),
                    callees[&row.callee].clone(),
                    row.line,
                    row.column,
                    row.is_virtual,
                )
            })
            .collect::<BTreeSet<_>>()
    };

    Ok(StoreState {
        definitions: defs.values().cloned().collect(),
        declarations: decl_rows
            .iter()
            .map(|row| (row.key.clone(), row.def_ref.map(|id| defs[&id].clone())))
            .collect(),
        resolved_calls: call_edges(index.resolved_calls()?, &defs),
        unresolved_calls: call_edges(index.unresolved_calls()?, &decls),
        resolved_overrides: index
            .resolved_overrides()?
            .into_iter()
            .map(|(def, base)| (defs[&def].clone(), defs[&base].clone()))
            .collect(),
        unresolved_overrides: index
            .unresolved_overrides()?
            .into_iter()
            .map(|(def, base)| (defs[&def].clone(), decls[&base].clone()))
            .collect(),
    })
}

fn state(config: &EffectiveConfig) -> StoreState {
    with_locked_index(config, |index| {
        read_state(index).map_err(MergeError::Transaction)
    })
    .expect("read store state")
}

fn unit_a() -> FactBatch {
    let f = key("fileA", "f()", 10, 20);
    let g = key("fileA", "g()", 30, 40);
    let mut batch = FactBatch::new();
    batch
        .add_definition(f.clone())
        .add_definition(g.clone())
        .add_call(f, g, 15, 3, false, Resolution::Resolved);
    batch
}

fn unit_b() -> FactBatch {
    let g = key("fileA", "g()", 30, 40);
    let h = key("fileB", "h()", 1, 5);
    let mut batch = FactBatch::new();
    batch
        .add_declaration(h.clone(), None)
        .add_call(g, h, 35, 7, false, Resolution::Unresolved);
    batch
}

#[test]
fn merging_same_batch_twice_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let mut batch = unit_a();
    batch
        .add_declaration(key("a.h", "f()", 1, 1), Some(key("fileA", "f()", 10, 20)))
        .add_override(
            key("fileA", "g()", 30, 40),
            key("base.h", "g()", 2, 2),
            Resolution::Unresolved,
        );

    merge(&config, &batch).expect("first merge");
    let once = state(&config);
    let report = merge(&config, &batch).expect("second merge");

    assert_eq!(report.rows_written(), 0);
    assert_eq!(state(&config), once);
}

#[test]
fn definition_arriving_later_backfills_like_combined_run() {
    let decl = key("fileC", "d()", 1, 5);
    let def = key("fileC", "k()", 1, 10);

    let split_dir = tempfile::tempdir().expect("tempdir");
    let split = config_in(split_dir.path());
    let mut first = FactBatch::new();
    first.add_declaration(decl.clone(), Some(def.clone()));
    let mut second = FactBatch::new();
    second.add_definition(def.clone());
    merge(&split, &first).expect("declaration batch");
    merge(&split, &second).expect("definition batch");

    let combined_dir = tempfile::tempdir().expect("tempdir");
    let combined = config_in(combined_dir.path());
    let mut both = FactBatch::new();
    both.add_definition(def.clone())
        .add_declaration(decl.clone(), Some(def.clone()));
    merge(&combined, &both).expect("combined batch");

    let split_state = state(&split);
    assert!(split_state.declarations.contains(&(decl, Some(def))));
    assert_eq!(split_state, state(&combined));
}

#[test]
fn sentinel_facts_are_skipped_and_rest_of_batch_lands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let good = key("a.cpp", "good()", 1, 3);
    let mut batch = FactBatch::new();
    batch
        .add_definition(FunctionKey::sentinel())
        .add_declaration(FunctionKey::sentinel(), None)
        .add_call(good.clone(), FunctionKey::sentinel(), 2, 1, false, Resolution::Resolved)
        .add_definition(good.clone());

    let report = merge(&config, &batch).expect("merge");
    assert_eq!(report.skipped_sentinel, 3);

    let after = state(&config);
    assert_eq!(after.definitions, BTreeSet::from([good]));
    assert!(after.declarations.is_empty());
    assert!(after.resolved_calls.is_empty());
}

#[test]
fn each_key_has_at_most_one_row_per_relation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let f = key("a.cpp", "f()", 1, 9);
    for _ in 0..3 {
        let mut batch = FactBatch::new();
        batch
            .add_definition(f.clone())
            .add_definition(f.clone())
            .add_declaration(f.clone(), None)
            .add_declaration(f.clone(), Some(f.clone()));
        merge(&config, &batch).expect("merge");
    }

    let counts = with_locked_index(&config, |index| {
        index.relation_counts().map_err(MergeError::Transaction)
    })
    .expect("counts");
    assert_eq!(counts.definitions, 1);
    assert_eq!(counts.declarations, 1);
}

#[test]
fn every_edge_points_at_existing_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let mut extra = FactBatch::new();
    extra
        .add_override(
            key("d.cpp", "D::run()", 1, 4),
            key("b.cpp", "B::run()", 1, 4),
            Resolution::Resolved,
        )
        .add_override(
            key("d.cpp", "D::run()", 1, 4),
            key("i.h", "I::run()", 3, 3),
            Resolution::Unresolved,
        );
    merge(&config, &unit_a()).expect("merge a");
    merge(&config, &unit_b()).expect("merge b");
    merge(&config, &extra).expect("merge overrides");

    let conn = Connection::open(&config.database).expect("open store");
    let dangling: i64 = conn
        .query_row(
            "SELECT
                (SELECT COUNT(*) FROM call_edges_resolved c
                   WHERE c.caller NOT IN (SELECT id FROM definitions)
                      OR c.callee NOT IN (SELECT id FROM definitions))
              + (SELECT COUNT(*) FROM call_edges_unresolved c
                   WHERE c.caller NOT IN (SELECT id FROM definitions)
                      OR c.callee NOT IN (SELECT id FROM declarations))
              + (SELECT COUNT(*) FROM override_edges_resolved o
                   WHERE o.def NOT IN (SELECT id FROM definitions)
                      OR o.base_def NOT IN (SELECT id FROM definitions))
              + (SELECT COUNT(*) FROM override_edges_unresolved o
                   WHERE o.def NOT IN (SELECT id FROM definitions)
                      OR o.base_decl NOT IN (SELECT id FROM declarations))",
            [],
            |row| row.get(0),
        )
        .expect("dangling count");
    assert_eq!(dangling, 0);

    let after = state(&config);
    assert_eq!(after.resolved_overrides.len(), 1);
    assert_eq!(after.unresolved_overrides.len(), 1);
}

#[test]
fn two_units_converge_in_either_order() {
    let ab_dir = tempfile::tempdir().expect("tempdir");
    let ab = config_in(ab_dir.path());
    merge(&ab, &unit_a()).expect("a");
    merge(&ab, &unit_b()).expect("b");

    let ba_dir = tempfile::tempdir().expect("tempdir");
    let ba = config_in(ba_dir.path());
    merge(&ba, &unit_b()).expect("b");
    merge(&ba, &unit_a()).expect("a");

    let forward = state(&ab);
    assert_eq!(forward.definitions.len(), 2);
    assert_eq!(
        forward.declarations,
        BTreeSet::from([(key("fileB", "h()", 1, 5), None)])
    );
    assert_eq!(forward.resolved_calls.len(), 1);
    assert_eq!(forward.unresolved_calls.len(), 1);
    assert_eq!(forward, state(&ba));
}

#[test]
fn reasserted_declaration_gains_reference_then_stays_put() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let d = key("fileC", "d()", 1, 5);
    let k = key("fileC", "k()", 1, 10);

    let mut early = FactBatch::new();
    early.add_declaration(d.clone(), Some(k.clone()));
    merge(&config, &early).expect("declaration first");
    assert!(state(&config).declarations.contains(&(d.clone(), None)));

    let mut full = FactBatch::new();
    full.add_definition(k.clone())
        .add_declaration(d.clone(), Some(k.clone()));
    merge(&config, &full).expect("definition arrives");
    let resolved = state(&config);
    assert!(resolved.declarations.contains(&(d.clone(), Some(k.clone()))));

    let report = merge(&config, &full).expect("identical merge");
    assert_eq!(report.rows_written(), 0);
    assert_eq!(state(&config), resolved);
}
