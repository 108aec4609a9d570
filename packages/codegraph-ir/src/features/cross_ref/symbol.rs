//! Role-bit classification and the ephemeral on-disk symbol table used to
//! join definitions against occurrences without holding every symbol in
//! process memory.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{CodegraphError, Result};

pub const ROLE_DEFINITION: i32 = 1;
pub const ROLE_REFERENCE: i32 = 8;
pub const ROLE_READ: i32 = 16;
pub const ROLE_WRITE: i32 = 32;
pub const ROLE_OVERRIDE: i32 = 64;
pub const ROLE_IMPLEMENTATION: i32 = 128;

/// Maps a SCIP-style role bitmask to the verb an edge is labeled with.
/// Definition wins over everything else, then override/implementation,
/// then write/read, with a plain call as the fallback.
pub fn relation_verb(role_mask: i32) -> &'static str {
    if role_mask & ROLE_DEFINITION != 0 {
        "defines"
    } else if role_mask & ROLE_OVERRIDE != 0 {
        "overrides"
    } else if role_mask & ROLE_IMPLEMENTATION != 0 {
        "implements"
    } else if role_mask & ROLE_WRITE != 0 {
        "writes_to"
    } else if role_mask & ROLE_READ != 0 {
        "reads_from"
    } else {
        "calls"
    }
}

/// A single occurrence's resolved location, as reported by the external
/// indexer: 0-based `(start_line, start_col, end_line, end_col)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

/// Ephemeral SQLite-backed symbol table: `(symbol, scope_file) -> location`.
///
/// Created fresh per resolver run in a temp file and deleted when dropped.
/// Non-local symbols are stored under the empty scope so a lookup that
/// misses the current file's local scope can still fall back to a global
/// definition.
pub struct DiskSymbolTable {
    conn: Connection,
    path: std::path::PathBuf,
    pending: Vec<(String, String, String, u32, u32, u32, u32)>,
    inserted: usize,
}

const FLUSH_THRESHOLD: usize = 10_000;

impl DiskSymbolTable {
    pub fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("codegraph-symtab-{}.db", uuid::Uuid::new_v4()));
        let conn = Connection::open(&path).map_err(|e| CodegraphError::internal(format!("opening symbol table: {e}")))?;
        conn.execute_batch(
            "PRAGMA synchronous = OFF;
             PRAGMA journal_mode = MEMORY;
             CREATE TABLE defs (
                 symbol TEXT NOT NULL,
                 scope_file TEXT NOT NULL,
                 file_path TEXT NOT NULL,
                 start_line INTEGER NOT NULL,
                 start_col INTEGER NOT NULL,
                 end_line INTEGER NOT NULL,
                 end_col INTEGER NOT NULL,
                 PRIMARY KEY (symbol, scope_file)
             );",
        )
        .map_err(|e| CodegraphError::internal(format!("creating symbol table schema: {e}")))?;
        Ok(Self {
            conn,
            path,
            pending: Vec::new(),
            inserted: 0,
        })
    }

    /// Records a definition occurrence. `is_local` symbols are scoped to
    /// `file_path`; everything else is stored under the global scope too.
    pub fn add(&mut self, symbol: &str, file_path: &str, range: SymbolRange, is_local: bool) -> Result<()> {
        let scope = if is_local { file_path } else { "" };
        self.pending
            .push((symbol.to_string(), scope.to_string(), file_path.to_string(), range.start_line, range.start_col, range.end_line, range.end_col));
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction()
            .map_err(|e| CodegraphError::internal(format!("starting symbol table transaction: {e}")))?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO defs VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)")
                .map_err(|e| CodegraphError::internal(format!("preparing symbol insert: {e}")))?;
            for row in self.pending.drain(..) {
                self.inserted += 1;
                stmt.execute(params![row.0, row.1, row.2, row.3, row.4, row.5, row.6])
                    .map_err(|e| CodegraphError::internal(format!("inserting symbol row: {e}")))?;
            }
        }
        tx.commit().map_err(|e| CodegraphError::internal(format!("committing symbol table transaction: {e}")))?;
        Ok(())
    }

    /// Looks up `symbol` first under `current_file`'s local scope, then
    /// falls back to the global scope.
    pub fn get(&self, symbol: &str, current_file: &str) -> Result<Option<(String, SymbolRange)>> {
        let local = self
            .conn
            .query_row(
                "SELECT file_path, start_line, start_col, end_line, end_col FROM defs WHERE symbol = ?1 AND scope_file = ?2",
                params![symbol, current_file],
                row_to_location,
            )
            .optional()
            .map_err(|e| CodegraphError::internal(format!("looking up local symbol: {e}")))?;
        if local.is_some() {
            return Ok(local);
        }
        self.conn
            .query_row(
                "SELECT file_path, start_line, start_col, end_line, end_col FROM defs WHERE symbol = ?1 AND scope_file = ''",
                params![symbol],
                row_to_location,
            )
            .optional()
            .map_err(|e| CodegraphError::internal(format!("looking up global symbol: {e}")))
    }

    pub fn definitions_found(&self) -> usize {
        self.inserted
    }
}

fn row_to_location(row: &rusqlite::Row) -> rusqlite::Result<(String, SymbolRange)> {
    Ok((
        row.get(0)?,
        SymbolRange {
            start_line: row.get(1)?,
            start_col: row.get(2)?,
            end_line: row.get(3)?,
            end_col: row.get(4)?,
        },
    ))
}

impl Drop for DiskSymbolTable {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> SymbolRange {
        SymbolRange {
            start_line: sl,
            start_col: sc,
            end_line: el,
            end_col: ec,
        }
    }

    #[test]
    fn role_mask_prioritizes_definition_over_everything() {
        assert_eq!(relation_verb(ROLE_DEFINITION | ROLE_REFERENCE), "defines");
        assert_eq!(relation_verb(ROLE_OVERRIDE), "overrides");
        assert_eq!(relation_verb(ROLE_IMPLEMENTATION), "implements");
        assert_eq!(relation_verb(ROLE_WRITE), "writes_to");
        assert_eq!(relation_verb(ROLE_READ), "reads_from");
        assert_eq!(relation_verb(ROLE_REFERENCE), "calls");
    }

    #[test]
    fn local_lookup_falls_back_to_global_scope() {
        let mut table = DiskSymbolTable::new().unwrap();
        table.add("pkg.Foo#bar().", "b.py", range(10, 0, 10, 3), false).unwrap();
        table.flush().unwrap();

        let hit = table.get("pkg.Foo#bar().", "a.py").unwrap();
        assert_eq!(hit.unwrap().0, "b.py");
    }

    #[test]
    fn local_scope_shadows_global_lookup() {
        let mut table = DiskSymbolTable::new().unwrap();
        table.add("local 1", "a.py", range(1, 0, 1, 1), true).unwrap();
        table.add("local 1", "b.py", range(2, 0, 2, 1), true).unwrap();
        table.flush().unwrap();

        let hit = table.get("local 1", "a.py").unwrap().unwrap();
        assert_eq!(hit.1.start_line, 1);
        let miss = table.get("local 1", "c.py").unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn definitions_found_counts_all_inserts() {
        let mut table = DiskSymbolTable::new().unwrap();
        table.add("s1", "a.py", range(0, 0, 0, 1), false).unwrap();
        table.add("s2", "a.py", range(1, 0, 1, 1), false).unwrap();
        table.flush().unwrap();
        assert_eq!(table.definitions_found(), 2);
    }
}
