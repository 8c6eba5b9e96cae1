//! Revision authoring: diff the declared model against a live store and write
//! a new revision pair.
//!
//! This is a design-time tool. Nothing here runs inside the API, bot or
//! worker processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::SqlitePool;

use super::runner::VERSION_TABLE;
use super::{MigrationError, RevisionId};
use crate::model::TableDef;

/// A column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

impl LiveColumn {
    /// Best-effort column definition for re-adding this column.
    fn add_decl(&self) -> String {
        let mut decl = self.decl_type.clone();
        if let Some(default) = &self.default {
            decl.push_str(&format!(" DEFAULT {default}"));
            if self.not_null {
                decl.push_str(" NOT NULL");
            }
        }
        decl
    }
}

/// A table as it exists in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable {
    pub sql: String,
    pub columns: Vec<LiveColumn>,
    /// Index name to `CREATE INDEX` statement.
    pub indexes: BTreeMap<String, String>,
}

/// Structure of the store outside the migrator's own bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    pub tables: BTreeMap<String, LiveTable>,
}

impl LiveSchema {
    /// Read tables, columns and explicit indexes from the store.
    pub async fn introspect(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let tables: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT name, sql FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?
            ORDER BY name
            "#,
        )
        .bind(VERSION_TABLE)
        .fetch_all(pool)
        .await?;

        let mut schema = LiveSchema::default();
        for (name, sql) in tables {
            let columns: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
                r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid"#,
            )
            .bind(&name)
            .fetch_all(pool)
            .await?;

            let indexes: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT name, sql FROM sqlite_master
                WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL
                ORDER BY name
                "#,
            )
            .bind(&name)
            .fetch_all(pool)
            .await?;

            schema.tables.insert(
                name,
                LiveTable {
                    sql,
                    columns: columns
                        .into_iter()
                        .map(|(name, decl_type, not_null, default, pk)| LiveColumn {
                            name,
                            decl_type,
                            not_null: not_null != 0,
                            default,
                            primary_key: pk != 0,
                        })
                        .collect(),
                    indexes: indexes.into_iter().map(|(n, s)| (n, normalize(&s))).collect(),
                },
            );
        }
        Ok(schema)
    }

    /// Structure with the table statements removed, for comparing stores
    /// whose `CREATE TABLE` text was rewritten by `ALTER TABLE`.
    pub fn structure(&self) -> BTreeMap<String, (Vec<LiveColumn>, BTreeMap<String, String>)> {
        self.tables
            .iter()
            .map(|(name, t)| (name.clone(), (t.columns.clone(), t.indexes.clone())))
            .collect()
    }
}

/// One structural difference between model and store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    CreateTable {
        name: String,
        sql: String,
    },
    DropTable {
        name: String,
        sql: String,
        indexes: Vec<String>,
    },
    AddColumn {
        table: String,
        column: String,
        decl: String,
    },
    DropColumn {
        table: String,
        column: LiveColumn,
    },
    CreateIndex {
        name: String,
        sql: String,
    },
    DropIndex {
        name: String,
        sql: String,
    },
}

impl Change {
    fn up(&self) -> Vec<String> {
        match self {
            Self::CreateTable { sql, .. } => vec![sql.clone()],
            Self::DropTable { name, .. } => vec![format!("DROP TABLE {name}")],
            Self::AddColumn {
                table,
                column,
                decl,
            } => vec![format!("ALTER TABLE {table} ADD COLUMN {column} {decl}")],
            Self::DropColumn { table, column } => {
                vec![format!("ALTER TABLE {table} DROP COLUMN {}", column.name)]
            }
            Self::CreateIndex { sql, .. } => vec![sql.clone()],
            Self::DropIndex { name, .. } => vec![format!("DROP INDEX {name}")],
        }
    }

    fn down(&self) -> Vec<String> {
        match self {
            Self::CreateTable { name, .. } => vec![format!("DROP TABLE {name}")],
            Self::DropTable { sql, indexes, .. } => {
                let mut stmts = vec![sql.clone()];
                stmts.extend(indexes.iter().cloned());
                stmts
            }
            Self::AddColumn { table, column, .. } => {
                vec![format!("ALTER TABLE {table} DROP COLUMN {column}")]
            }
            Self::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {table} ADD COLUMN {} {}",
                column.name,
                column.add_decl()
            )],
            Self::CreateIndex { name, .. } => vec![format!("DROP INDEX {name}")],
            Self::DropIndex { sql, .. } => vec![sql.clone()],
        }
    }

    /// Application order: removals before additions so names can be reused.
    fn rank(&self) -> u8 {
        match self {
            Self::DropIndex { .. } => 0,
            Self::DropColumn { .. } => 1,
            Self::DropTable { .. } => 2,
            Self::CreateTable { .. } => 3,
            Self::AddColumn { .. } => 4,
            Self::CreateIndex { .. } => 5,
        }
    }
}

/// Changes that bring `live` in line with `declared`, in application order.
pub fn diff(declared: &[&TableDef], live: &LiveSchema) -> Vec<Change> {
    let mut changes = Vec::new();

    for table in declared {
        match live.tables.get(table.name) {
            None => changes.push(Change::CreateTable {
                name: table.name.to_string(),
                sql: table.create_sql(),
            }),
            Some(existing) => {
                for column in table.columns {
                    if !existing.columns.iter().any(|c| c.name == column.name) {
                        changes.push(Change::AddColumn {
                            table: table.name.to_string(),
                            column: column.name.to_string(),
                            decl: column.decl.to_string(),
                        });
                    }
                }
                for column in &existing.columns {
                    if table.column(&column.name).is_none() {
                        changes.push(Change::DropColumn {
                            table: table.name.to_string(),
                            column: column.clone(),
                        });
                    }
                }
                for (name, sql) in &existing.indexes {
                    if !table.indexes.iter().any(|i| i.name == name) {
                        changes.push(Change::DropIndex {
                            name: name.clone(),
                            sql: sql.clone(),
                        });
                    }
                }
            }
        }

        let existing_indexes = live.tables.get(table.name).map(|t| &t.indexes);
        for index in table.indexes {
            if !existing_indexes.is_some_and(|idx| idx.contains_key(index.name)) {
                changes.push(Change::CreateIndex {
                    name: index.name.to_string(),
                    sql: index.sql.to_string(),
                });
            }
        }
    }

    for (name, table) in &live.tables {
        if !declared.iter().any(|t| t.name == name) {
            changes.push(Change::DropTable {
                name: name.clone(),
                sql: table.sql.clone(),
                indexes: table.indexes.values().cloned().collect(),
            });
        }
    }

    changes.sort_by_key(Change::rank);
    changes
}

/// Render `(up, down)` scripts for a list of changes. The down script undoes
/// the changes in reverse order.
pub fn render(changes: &[Change]) -> (String, String) {
    let up: Vec<String> = changes.iter().flat_map(Change::up).collect();
    let down: Vec<String> = changes.iter().rev().flat_map(Change::down).collect();
    (join_script(&up), join_script(&down))
}

fn join_script(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{s};\n"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A revision pair written to disk.
#[derive(Debug, Clone)]
pub struct GeneratedRevision {
    pub id: RevisionId,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
    pub changes: usize,
}

/// Write a new revision pair into `dir`.
///
/// With `live = Some(pool)` the scripts contain the diff between the declared
/// model and that store; otherwise both scripts are empty templates.
pub async fn generate(
    dir: &Path,
    message: &str,
    declared: &[&TableDef],
    live: Option<&SqlitePool>,
) -> Result<GeneratedRevision, MigrationError> {
    let changes = match live {
        Some(pool) => diff(declared, &LiveSchema::introspect(pool).await?),
        None => Vec::new(),
    };
    let (up, down) = render(&changes);

    fs::create_dir_all(dir)?;
    let id = next_revision_id(dir)?;
    let stem = format!("{id}_{}", slugify(message));
    let up_path = dir.join(format!("{stem}.up.sql"));
    let down_path = dir.join(format!("{stem}.down.sql"));

    fs::write(&up_path, format!("-- {message}\n{up}"))?;
    fs::write(&down_path, format!("-- revert: {message}\n{down}"))?;

    tracing::info!(
        revision = %id,
        changes = changes.len(),
        path = %up_path.display(),
        "revision written"
    );

    Ok(GeneratedRevision {
        id,
        up_path,
        down_path,
        changes: changes.len(),
    })
}

/// Successor of the highest numeric id in `dir`, zero padded to four digits.
fn next_revision_id(dir: &Path) -> Result<RevisionId, MigrationError> {
    let mut highest = 0u32;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".sql") {
            continue;
        }
        if let Some(n) = name.split('_').next().and_then(|p| p.parse::<u32>().ok()) {
            highest = highest.max(n);
        }
    }
    Ok(RevisionId(format!("{:04}", highest + 1)))
}

fn slugify(message: &str) -> String {
    let slug: String = message
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        "revision".to_string()
    } else {
        slug
    }
}

/// Collapse whitespace so index statements compare by content.
fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
