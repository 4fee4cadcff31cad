use std::path::Path;

use anyhow::{anyhow, Context, Result};
use knowledge_kernel_core::{FlatRule, ItemId, KnowledgeTree, SelectionResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS knowledge_tree (
  tree_id TEXT PRIMARY KEY CHECK (tree_id = 'current'),
  version INTEGER NOT NULL CHECK (version >= 1),
  last_modified TEXT NOT NULL,
  tree_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_rules (
  rule_id TEXT PRIMARY KEY,
  rule_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS selection_results (
  selection_id TEXT PRIMARY KEY,
  generated_at TEXT NOT NULL,
  result_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_selection_results_generated_at
  ON selection_results(generated_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed knowledge store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Load the current knowledge tree snapshot, if one has been saved.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or the JSON fails to decode.
    pub fn load_tree(&self) -> Result<Option<KnowledgeTree>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tree_json FROM knowledge_tree WHERE tree_id = 'current'")?;
        let value = stmt.query_row([], |row| row.get::<_, String>(0)).optional()?;

        match value {
            Some(json) => {
                let tree = serde_json::from_str(&json)
                    .context("failed to deserialize stored knowledge tree")?;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    /// Replace the single current knowledge tree snapshot.
    ///
    /// # Errors
    /// Returns an error when serialization or the write transaction fails.
    pub fn save_tree(&mut self, tree: &KnowledgeTree) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO knowledge_tree(tree_id, version, last_modified, tree_json)
             VALUES ('current', ?1, ?2, ?3)
             ON CONFLICT(tree_id) DO UPDATE SET
               version = excluded.version,
               last_modified = excluded.last_modified,
               tree_json = excluded.tree_json",
            params![
                i64::from(tree.version),
                rfc3339(tree.last_modified)?,
                serde_json::to_string(tree).context("failed to serialize knowledge tree")?,
            ],
        )
        .context("failed to persist knowledge tree snapshot")?;
        tx.commit().context("failed to commit tree transaction")?;
        Ok(())
    }

    /// Persist one validated legacy flat rule.
    ///
    /// # Errors
    /// Returns an error when validation fails or the write transaction fails.
    pub fn write_flat_rule(&mut self, rule: &FlatRule) -> Result<()> {
        rule.item.validate().map_err(|err| anyhow!("rule validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO legacy_rules(rule_id, rule_json, created_at) VALUES (?1, ?2, ?3)",
            params![
                rule.item.item_id.to_string(),
                serde_json::to_string(rule).context("failed to serialize flat rule")?,
                rfc3339(rule.item.created_at)?,
            ],
        )
        .context("failed to insert legacy rule")?;
        tx.commit().context("failed to commit rule transaction")?;
        Ok(())
    }

    /// Load all persisted legacy flat rules in a stable order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_flat_rules(&self) -> Result<Vec<FlatRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_json FROM legacy_rules ORDER BY created_at ASC, rule_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut rules = Vec::new();
        for row in rows {
            let raw = row?;
            let parsed = serde_json::from_str::<FlatRule>(&raw)
                .context("failed to deserialize legacy rule row")?;
            rules.push(parsed);
        }
        Ok(rules)
    }

    /// Persist one selection result under its deterministic selection id.
    ///
    /// # Errors
    /// Returns an error when the id is empty, serialization fails, or the write fails.
    pub fn save_selection_result(&mut self, result: &SelectionResult) -> Result<()> {
        if result.selection_id.trim().is_empty() {
            return Err(anyhow!("selection result is missing a selection_id"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT OR REPLACE INTO selection_results(selection_id, generated_at, result_json)
             VALUES (?1, ?2, ?3)",
            params![
                result.selection_id,
                rfc3339(result.audit.generated_at)?,
                serde_json::to_string(result).context("failed to serialize selection result")?,
            ],
        )
        .context("failed to persist selection result")?;
        tx.commit().context("failed to commit selection result transaction")?;
        Ok(())
    }

    /// Retrieve a persisted selection result by its identifier.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_selection_result(&self, selection_id: &str) -> Result<Option<SelectionResult>> {
        let mut stmt = self
            .conn
            .prepare("SELECT result_json FROM selection_results WHERE selection_id = ?1")?;
        let value =
            stmt.query_row(params![selection_id], |row| row.get::<_, String>(0)).optional()?;

        match value {
            Some(json) => {
                let result = serde_json::from_str(&json)
                    .context("failed to deserialize stored selection result")?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

/// Parse a stored item id column back into an [`ItemId`].
///
/// # Errors
/// Returns an error when the stored string is not a valid ULID.
pub fn parse_item_id(raw: &str) -> Result<ItemId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(ItemId(parsed))
}
