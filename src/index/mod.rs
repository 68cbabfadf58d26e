pub mod merge;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::MergeError;
use crate::facts::{FactBatch, FunctionKey};
use crate::index::merge::{MergeOptions, MergeReport, apply_batch};
use crate::index::schema::{apply_pragmas, create_schema};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelationCounts {
    pub definitions: u64,
    pub declarations: u64,
    pub call_edges_resolved: u64,
    pub call_edges_unresolved: u64,
    pub override_edges_resolved: u64,
    pub override_edges_unresolved: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionRow {
    pub id: i64,
    pub key: FunctionKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationRow {
    pub id: i64,
    pub key: FunctionKey,
    pub def_ref: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRow {
    pub caller: i64,
    pub callee: i64,
    pub line: u32,
    pub column: u32,
    pub is_virtual: bool,
}

/// The persisted cross-unit fact store.
pub struct FactIndex {
    conn: Connection,
    path: Option<PathBuf>,
}

impl FactIndex {
    /// Opens the store, creating the schema only when the file did not exist.
    ///
    /// A failed first-use initialization removes the half-created file so the
    /// next process starts from a clean slate.
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let fresh = !path.exists();
        if fresh {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                // Connection::open reports the failure; keep the cause in the log.
                if let Err(err) = fs::create_dir_all(parent) {
                    warn!(
                        path = %parent.display(),
                        error = %err,
                        "cannot create store directory"
                    );
                }
            }
        }

        let store_open = |source: rusqlite::Error| MergeError::StoreOpen {
            path: path.to_path_buf(),
            source,
        };
        let conn = Connection::open(path).map_err(store_open)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_open)?;
        apply_pragmas(&conn).map_err(store_open)?;

        if fresh {
            debug!(path = %path.display(), "creating fact store schema");
            if let Err(err) = create_schema(&conn) {
                drop(conn);
                discard_store_files(path);
                return Err(MergeError::SchemaCreation(err));
            }
        }

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, MergeError> {
        let store_open = |source: rusqlite::Error| MergeError::StoreOpen {
            path: PathBuf::from(":memory:"),
            source,
        };
        let conn = Connection::open_in_memory().map_err(store_open)?;
        apply_pragmas(&conn).map_err(store_open)?;
        create_schema(&conn).map_err(MergeError::SchemaCreation)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies one batch inside a single `BEGIN IMMEDIATE` transaction.
    /// Nothing from the batch is visible unless the commit succeeds.
    pub fn merge_batch(
        &mut self,
        batch: &FactBatch,
        options: MergeOptions,
    ) -> Result<MergeReport, MergeError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(MergeError::Transaction)?;
        let report = apply_batch(&tx, batch, options).map_err(MergeError::Transaction)?;
        tx.commit().map_err(MergeError::Transaction)?;
        Ok(report)
    }

    pub fn relation_counts(&self) -> rusqlite::Result<RelationCounts> {
        let count = |table: &str| -> rusqlite::Result<u64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n.max(0) as u64)
        };
        Ok(RelationCounts {
            definitions: count("definitions")?,
            declarations: count("declarations")?,
            call_edges_resolved: count("call_edges_resolved")?,
            call_edges_unresolved: count("call_edges_unresolved")?,
            override_edges_resolved: count("override_edges_resolved")?,
            override_edges_unresolved: count("override_edges_unresolved")?,
        })
    }

    pub fn definition_id(&self, key: &FunctionKey) -> rusqlite::Result<Option<i64>> {
        merge::definition_id(&self.conn, key)
    }

    pub fn declaration(&self, key: &FunctionKey) -> rusqlite::Result<Option<DeclarationRow>> {
        let Some(id) = merge::declaration_id(&self.conn, key)? else {
            return Ok(None);
        };
        let def_ref = self.conn.query_row(
            "SELECT def_ref FROM declarations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(DeclarationRow {
            id,
            key: key.clone(),
            def_ref,
        }))
    }

    pub fn definitions(&self) -> rusqlite::Result<Vec<DefinitionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, unit_path, signature, begin_line, end_line
             FROM definitions ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DefinitionRow {
                id: row.get(0)?,
                key: FunctionKey::new(
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ),
            });
        }
        Ok(out)
    }

    pub fn declarations(&self) -> rusqlite::Result<Vec<DeclarationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, unit_path, signature, begin_line, end_line, def_ref
             FROM declarations ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DeclarationRow {
                id: row.get(0)?,
                key: FunctionKey::new(
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ),
                def_ref: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn resolved_calls(&self) -> rusqlite::Result<Vec<CallRow>> {
        self.call_rows("call_edges_resolved")
    }

    pub fn unresolved_calls(&self) -> rusqlite::Result<Vec<CallRow>> {
        self.call_rows("call_edges_unresolved")
    }

    fn call_rows(&self, table: &str) -> rusqlite::Result<Vec<CallRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT caller, callee, line, col, is_virtual FROM {table}
             ORDER BY caller ASC, line ASC, col ASC, callee ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CallRow {
                caller: row.get(0)?,
                callee: row.get(1)?,
                line: row.get(2)?,
                column: row.get(3)?,
                is_virtual: row.get(4)?,
            });
        }
        Ok(out)
    }

    /// `(def, base_def)` pairs.
    pub fn resolved_overrides(&self) -> rusqlite::Result<Vec<(i64, i64)>> {
        self.pairs("SELECT def, base_def FROM override_edges_resolved ORDER BY def, base_def")
    }

    /// `(def, base_decl)` pairs.
    pub fn unresolved_overrides(&self) -> rusqlite::Result<Vec<(i64, i64)>> {
        self.pairs("SELECT def, base_decl FROM override_edges_unresolved ORDER BY def, base_decl")
    }

    fn pairs(&self, sql: &str) -> rusqlite::Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Closes the handle, logging rather than failing if SQLite refuses.
    pub fn close(self) {
        if let Err((_, err)) = self.conn.close() {
            let path = self.path.as_deref().unwrap_or(Path::new(":memory:"));
            warn!(path = %path.display(), error = %err, "failed to close fact store cleanly");
        }
    }
}

fn discard_store_files(path: &Path) {
    for candidate in [path.to_path_buf(), journal_path(path)] {
        if candidate.exists() {
            if let Err(err) = fs::remove_file(&candidate) {
                warn!(path = %candidate.display(), error = %err, "cannot remove partial store");
            }
        }
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}
