//! Schema Loader
//!
//! Read-only introspection of the target PostgreSQL database into an
//! immutable `SchemaModel` snapshot, cached with a TTL and an explicit
//! invalidation hook. The translation path never mutates a snapshot.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Immutable snapshot of the database schema. Shared across requests behind
/// an `Arc`; refreshes publish a whole new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaModel {
    tables: Vec<Table>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl SchemaModel {
    pub fn new(tables: Vec<Table>) -> Self {
        let mut index = HashMap::new();
        for (i, table) in tables.iter().enumerate() {
            let key = table.name.to_lowercase();
            if index.contains_key(&key) {
                warn!("duplicate table name in schema snapshot: {}", table.name);
                continue;
            }
            index.insert(key, i);
        }
        Self { tables, index }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| &self.tables[i])
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Seam for the orchestrator: the production loader introspects Postgres,
/// tests substitute a fixed snapshot.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<SchemaModel>>;
    fn invalidate(&self);
}

struct CachedSnapshot {
    model: Arc<SchemaModel>,
    loaded_at: Instant,
}

/// Introspects `information_schema` and caches the resulting snapshot.
pub struct PgSchemaLoader {
    pool: PgPool,
    ttl: Duration,
    cache: RwLock<Option<CachedSnapshot>>,
}

impl PgSchemaLoader {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn introspect(&self) -> Result<SchemaModel> {
        let column_rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name,
                   column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable
            FROM information_schema.columns
            WHERE table_schema = 'public'
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NlqError::SchemaUnavailable(e.to_string()))?;

        let columns: Vec<(String, String, String, String)> = column_rows
            .iter()
            .map(|row| {
                (
                    row.get("table_name"),
                    row.get("column_name"),
                    row.get("data_type"),
                    row.get("is_nullable"),
                )
            })
            .collect();

        let fk_rows = sqlx::query(
            r#"
            SELECT tc.table_name::text AS table_name,
                   kcu.column_name::text AS column_name,
                   ccu.table_name::text AS ref_table,
                   ccu.column_name::text AS ref_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = 'public'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NlqError::SchemaUnavailable(e.to_string()))?;

        let foreign_keys: Vec<(String, String, String, String)> = fk_rows
            .iter()
            .map(|row| {
                (
                    row.get("table_name"),
                    row.get("column_name"),
                    row.get("ref_table"),
                    row.get("ref_column"),
                )
            })
            .collect();

        let model = build_model(columns, foreign_keys);
        info!(tables = model.tables().len(), "schema snapshot loaded");
        Ok(model)
    }
}

#[async_trait]
impl SchemaProvider for PgSchemaLoader {
    async fn load(&self) -> Result<Arc<SchemaModel>> {
        {
            let guard = self
                .cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    debug!("schema cache hit");
                    return Ok(Arc::clone(&cached.model));
                }
            }
        }

        // Cache miss or stale: introspect outside any lock, then publish.
        let model = Arc::new(self.introspect().await?);
        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(CachedSnapshot {
            model: Arc::clone(&model),
            loaded_at: Instant::now(),
        });
        Ok(model)
    }

    fn invalidate(&self) {
        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
        debug!("schema cache invalidated");
    }
}

/// Fold introspection rows into tables. Pure so it can be tested without a
/// database connection.
pub fn build_model(
    columns: Vec<(String, String, String, String)>,
    foreign_keys: Vec<(String, String, String, String)>,
) -> SchemaModel {
    let mut tables: Vec<Table> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (table_name, column_name, data_type, is_nullable) in columns {
        let idx = *index.entry(table_name.clone()).or_insert_with(|| {
            tables.push(Table {
                name: table_name.clone(),
                columns: Vec::new(),
                foreign_keys: Vec::new(),
            });
            tables.len() - 1
        });
        tables[idx].columns.push(Column {
            name: column_name,
            data_type,
            nullable: is_nullable.eq_ignore_ascii_case("yes"),
        });
    }

    for (table_name, column, ref_table, ref_column) in foreign_keys {
        if let Some(&idx) = index.get(&table_name) {
            tables[idx].foreign_keys.push(ForeignKey {
                column,
                ref_table,
                ref_column,
            });
        }
    }

    SchemaModel::new(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<(String, String, String, String)> {
        vec![
            ("objects".into(), "id".into(), "integer".into(), "NO".into()),
            ("objects".into(), "name".into(), "text".into(), "YES".into()),
            (
                "vendors".into(),
                "vendor_id".into(),
                "integer".into(),
                "NO".into(),
            ),
            (
                "vendors".into(),
                "vendor_name".into(),
                "character varying".into(),
                "YES".into(),
            ),
        ]
    }

    #[test]
    fn build_model_groups_columns_by_table() {
        let model = build_model(sample_rows(), vec![]);
        assert_eq!(model.tables().len(), 2);
        let objects = model.table("objects").unwrap();
        assert_eq!(objects.columns.len(), 2);
        assert!(objects.column("name").unwrap().nullable);
        assert!(!objects.column("id").unwrap().nullable);
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let model = build_model(sample_rows(), vec![]);
        assert!(model.table("OBJECTS").is_some());
        assert!(model.table("Objects").unwrap().column("NAME").is_some());
        assert!(model.table("object_types").is_none());
    }

    #[test]
    fn foreign_keys_attach_to_owning_table() {
        let fks = vec![(
            "objects".to_string(),
            "vendor_id".to_string(),
            "vendors".to_string(),
            "vendor_id".to_string(),
        )];
        let model = build_model(sample_rows(), fks);
        let objects = model.table("objects").unwrap();
        assert_eq!(objects.foreign_keys.len(), 1);
        assert_eq!(objects.foreign_keys[0].ref_table, "vendors");
    }
}
