//! Declared data model of the shared store.
//!
//! Revision scripts are the source of truth for what the store looks like at a
//! given revision. This declaration is what the code expects at head and is
//! what `migrate revision --autogenerate` diffs against a live store.

/// A declared column: name plus its SQLite column definition.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub decl: &'static str,
}

/// A declared index with its full `CREATE INDEX` statement.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub sql: &'static str,
}

/// A declared table.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub indexes: &'static [IndexDef],
}

impl TableDef {
    /// `CREATE TABLE` statement for this table.
    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("    {} {}", c.name, c.decl))
            .collect();
        format!("CREATE TABLE {} (\n{}\n)", self.name, columns.join(",\n"))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

const fn col(name: &'static str, decl: &'static str) -> ColumnDef {
    ColumnDef { name, decl }
}

static WORK_UNITS: TableDef = TableDef {
    name: "work_units",
    columns: &[
        col("id", "INTEGER PRIMARY KEY"),
        col("kind", "TEXT NOT NULL"),
        col("payload", "TEXT NOT NULL"),
        col(
            "state",
            "TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'claimed', 'completed', 'failed_terminal'))",
        ),
        col("attempts", "INTEGER NOT NULL DEFAULT 0"),
        col("max_attempts", "INTEGER NOT NULL"),
        col("claimed_by", "TEXT"),
        col("claim_token", "INTEGER NOT NULL DEFAULT 0"),
        col("lease_expires_at", "INTEGER"),
        col("available_at", "INTEGER NOT NULL"),
        col("last_error", "TEXT"),
        col("result", "TEXT"),
        col("created_at", "INTEGER NOT NULL"),
        col("updated_at", "INTEGER NOT NULL"),
        col("completed_at", "INTEGER"),
        col("dedupe_key", "TEXT"),
    ],
    indexes: &[
        IndexDef {
            name: "idx_work_units_claimable",
            sql: "CREATE INDEX idx_work_units_claimable ON work_units(state, available_at, id)",
        },
        IndexDef {
            name: "idx_work_units_lease",
            sql: "CREATE INDEX idx_work_units_lease ON work_units(state, lease_expires_at)",
        },
        IndexDef {
            name: "idx_work_units_dedupe",
            sql: "CREATE UNIQUE INDEX idx_work_units_dedupe ON work_units(kind, dedupe_key) WHERE dedupe_key IS NOT NULL AND state IN ('pending', 'claimed')",
        },
    ],
};

static WORK_ATTEMPTS: TableDef = TableDef {
    name: "work_attempts",
    columns: &[
        col("id", "INTEGER PRIMARY KEY"),
        col(
            "unit_id",
            "INTEGER NOT NULL REFERENCES work_units(id) ON DELETE CASCADE",
        ),
        col("attempt", "INTEGER NOT NULL"),
        col("worker_id", "TEXT NOT NULL"),
        col("claimed_at", "INTEGER NOT NULL"),
        col("finished_at", "INTEGER"),
        col("outcome", "TEXT"),
        col("error", "TEXT"),
    ],
    indexes: &[IndexDef {
        name: "idx_work_attempts_unit",
        sql: "CREATE INDEX idx_work_attempts_unit ON work_attempts(unit_id, attempt)",
    }],
};

static DECLARED: [&TableDef; 2] = [&WORK_UNITS, &WORK_ATTEMPTS];

/// Tables the code expects at the head revision.
pub fn declared() -> &'static [&'static TableDef] {
    &DECLARED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_create_table() {
        let sql = WORK_ATTEMPTS.create_sql();
        assert!(sql.starts_with("CREATE TABLE work_attempts ("));
        assert!(sql.contains("    worker_id TEXT NOT NULL,"));
        assert!(sql.ends_with("error TEXT\n)"));
    }

    #[test]
    fn declares_both_tables() {
        let names: Vec<_> = declared().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["work_units", "work_attempts"]);
        assert!(WORK_UNITS.column("dedupe_key").is_some());
    }
}
