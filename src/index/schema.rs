use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// The six relations downstream tooling reads, in dependency order.
pub const RELATIONS: [&str; 6] = [
    "definitions",
    "declarations",
    "call_edges_resolved",
    "call_edges_unresolved",
    "override_edges_resolved",
    "override_edges_unresolved",
];

pub(crate) fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous = FULL;
        ",
    )
}

/// Creates every relation of a fresh store in one transaction.
///
/// Callers run this only when the store file did not exist before opening it.
pub(crate) fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "
        BEGIN IMMEDIATE;

        CREATE TABLE definitions (
            id INTEGER PRIMARY KEY,
            unit_path TEXT NOT NULL,
            signature TEXT NOT NULL,
            begin_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            UNIQUE(unit_path, signature, begin_line, end_line)
        );

        CREATE TABLE declarations (
            id INTEGER PRIMARY KEY,
            unit_path TEXT NOT NULL,
            signature TEXT NOT NULL,
            begin_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            def_ref INTEGER REFERENCES definitions(id),
            def_unit_path TEXT,
            def_signature TEXT,
            def_begin_line INTEGER,
            def_end_line INTEGER,
            UNIQUE(unit_path, signature, begin_line, end_line)
        );

        CREATE INDEX idx_declarations_pending_claim
            ON declarations(def_unit_path, def_signature, def_begin_line, def_end_line)
            WHERE def_ref IS NULL;

        CREATE TABLE call_edges_resolved (
            caller INTEGER NOT NULL REFERENCES definitions(id),
            callee INTEGER NOT NULL REFERENCES definitions(id),
            line INTEGER NOT NULL,
            col INTEGER NOT NULL,
            is_virtual INTEGER NOT NULL CHECK (is_virtual IN (0, 1)),
            UNIQUE(caller, callee, line, col, is_virtual)
        );

        CREATE TABLE call_edges_unresolved (
            caller INTEGER NOT NULL REFERENCES definitions(id),
            callee INTEGER NOT NULL REFERENCES declarations(id),
            line INTEGER NOT NULL,
            col INTEGER NOT NULL,
            is_virtual INTEGER NOT NULL CHECK (is_virtual IN (0, 1)),
            UNIQUE(caller, callee, line, col, is_virtual)
        );

        CREATE TABLE override_edges_resolved (
            def INTEGER NOT NULL REFERENCES definitions(id),
            base_def INTEGER NOT NULL REFERENCES definitions(id),
            UNIQUE(def, base_def)
        );

        CREATE TABLE override_edges_unresolved (
            def INTEGER NOT NULL REFERENCES definitions(id),
            base_decl INTEGER NOT NULL REFERENCES declarations(id),
            UNIQUE(def, base_decl)
        );

        PRAGMA user_version = {SCHEMA_VERSION};

        COMMIT;
        "
    ))
}
