use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::{Document, DocumentStore, Filter, FindOptions, IndexSpec, ReplaceSession};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A value bound into a filter clause.
#[derive(Debug, Clone)]
enum Param {
    Text(String),
    Int(i64),
    Real(f64),
    Bool(bool),
}

/// Document store on SQLite: one table per collection, one JSON document per row.
///
/// Fields are addressed with `json_extract`, and indexes are expression
/// indexes over the same expressions so filtered reads can use them.
pub struct SqliteStore {
    pool: SqlitePool,
    tables: Mutex<HashSet<String>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database named by `url`, e.g.
    /// `sqlite://gtfs.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url '{url}'"))?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database '{url}'"))?;
        info!(in_memory, "Connected to document store");

        Ok(Self {
            pool,
            tables: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_table(&self, collection: &str) -> Result<()> {
        check_identifier(collection)?;
        if self.known_table(collection) {
            return Ok(());
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {collection} (id INTEGER PRIMARY KEY AUTOINCREMENT, doc TEXT NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create collection {collection}"))?;

        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(collection.to_string());
        }
        Ok(())
    }

    fn known_table(&self, collection: &str) -> bool {
        self.tables
            .lock()
            .map(|tables| tables.contains(collection))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.ensure_table(collection).await?;
        check_identifier(&index.name)?;

        let columns = index
            .fields
            .iter()
            .map(|f| field_expr(f))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let unique = if index.unique { "UNIQUE " } else { "" };
        let sql = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {collection}_{name} ON {collection} ({columns})",
            name = index.name
        );

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create index {} on {collection}", index.name))?;
        debug!(collection, index = %index.name, unique = index.unique, "Index ensured");
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64> {
        self.ensure_table(collection).await?;
        let mut tx = self.pool.begin().await?;
        let count = insert_docs(&mut tx, collection, docs).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.ensure_table(collection).await?;
        let (clause, params) = where_clause(filter)?;
        let sql = format!("DELETE FROM {collection}{clause}");
        let result = bind_all(sqlx::query(&sql), params)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete from {collection} failed"))?;
        Ok(result.rows_affected())
    }

    async fn upsert_one(&self, collection: &str, filter: &Filter, set: Document) -> Result<()> {
        self.ensure_table(collection).await?;
        let (clause, params) = where_clause(filter)?;
        let select = format!("SELECT id, doc FROM {collection}{clause} ORDER BY id LIMIT 1");

        let mut tx = self.pool.begin().await?;
        let existing = bind_all(sqlx::query(&select), params)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let mut doc: Document = serde_json::from_str(row.try_get::<&str, _>("doc")?)?;
                doc.extend(set);
                sqlx::query(&format!("UPDATE {collection} SET doc = ? WHERE id = ?"))
                    .bind(serde_json::to_string(&doc)?)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                let mut doc: Document = filter
                    .clauses()
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                doc.extend(set);
                insert_docs(&mut tx, collection, vec![doc]).await?;
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("upsert into {collection} failed"))?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.ensure_table(collection).await?;
        let (clause, params) = where_clause(filter)?;
        // LIMIT -1 means no limit in SQLite
        let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!("SELECT doc FROM {collection}{clause} ORDER BY id LIMIT {limit}");

        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query on {collection} failed"))?;

        rows.iter()
            .map(|row| {
                let doc: Document = serde_json::from_str(row.try_get::<&str, _>("doc")?)?;
                Ok(options.apply_projection(doc))
            })
            .collect()
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.ensure_table(collection).await?;
        let (clause, params) = where_clause(filter)?;
        let sql = format!("SELECT COUNT(*) AS n FROM {collection}{clause}");
        let row = bind_all(sqlx::query(&sql), params)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn begin_replace(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<Box<dyn ReplaceSession>> {
        self.ensure_table(collection).await?;
        let (clause, params) = where_clause(&filter)?;

        let mut tx = self.pool.begin().await?;
        let sql = format!("DELETE FROM {collection}{clause}");
        let deleted = bind_all(sqlx::query(&sql), params)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to clear {collection}"))?
            .rows_affected();
        debug!(collection, deleted, "Cleared documents for replacement");

        Ok(Box::new(SqliteReplace {
            tx,
            collection: collection.to_string(),
            inserted: 0,
        }))
    }
}

/// Replacement running inside one SQLite transaction; rolled back on drop.
struct SqliteReplace {
    tx: Transaction<'static, Sqlite>,
    collection: String,
    inserted: u64,
}

#[async_trait]
impl ReplaceSession for SqliteReplace {
    async fn insert_many(&mut self, docs: Vec<Document>) -> Result<()> {
        self.inserted += insert_docs(&mut self.tx, &self.collection, docs).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let SqliteReplace {
            tx,
            collection,
            inserted,
        } = *self;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit replacement of {collection}"))?;
        Ok(inserted)
    }
}

async fn insert_docs(
    conn: &mut SqliteConnection,
    collection: &str,
    docs: Vec<Document>,
) -> Result<u64> {
    let sql = format!("INSERT INTO {collection} (doc) VALUES (?)");
    let mut count = 0;
    for doc in docs {
        sqlx::query(&sql)
            .bind(serde_json::to_string(&doc)?)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("insert into {collection} failed"))?;
        count += 1;
    }
    Ok(count)
}

/// Collection, index and field names are spliced into SQL, so only plain identifiers pass.
fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid identifier '{name}'");
    }
    Ok(())
}

fn field_expr(field: &str) -> Result<String> {
    check_identifier(field)?;
    Ok(format!("json_extract(doc, '$.{field}')"))
}

fn where_clause(filter: &Filter) -> Result<(String, Vec<Param>)> {
    if filter.clauses().is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for (field, value) in filter.clauses() {
        let expr = field_expr(field)?;
        let param = match value {
            Value::Null => {
                conditions.push(format!("{expr} IS NULL"));
                continue;
            }
            Value::String(s) => Param::Text(s.clone()),
            Value::Bool(b) => Param::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Param::Int(i),
                None => Param::Real(n.as_f64().unwrap_or_default()),
            },
            Value::Array(_) | Value::Object(_) => {
                bail!("unsupported filter value for field '{field}': {value}")
            }
        };
        conditions.push(format!("{expr} = ?"));
        params.push(param);
    }

    Ok((format!(" WHERE {}", conditions.join(" AND ")), params))
}

fn bind_all(mut query: SqliteQuery<'_>, params: Vec<Param>) -> SqliteQuery<'_> {
    for param in params {
        query = match param {
            Param::Text(s) => query.bind(s),
            Param::Int(i) => query.bind(i),
            Param::Real(f) => query.bind(f),
            Param::Bool(b) => query.bind(b),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataType;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_identifiers_are_validated() {
        assert!(check_identifier("gtfs_stop_times").is_ok());
        assert!(check_identifier("stops; DROP TABLE x").is_err());
        assert!(check_identifier("1stops").is_err());
        assert!(check_identifier("").is_err());
    }

    #[test]
    fn test_where_clause_binds_each_value() {
        let filter = Filter::data_type(DataType::Regular)
            .eq("stop_sequence", 3)
            .eq("parent_station", Value::Null);
        let (clause, params) = where_clause(&filter).unwrap();
        assert_eq!(
            clause,
            " WHERE json_extract(doc, '$.data_type') = ? AND json_extract(doc, '$.stop_sequence') = ? AND json_extract(doc, '$.parent_station') IS NULL"
        );
        assert_eq!(params.len(), 2);
    }

    #[tokio::test]
    async fn test_find_filters_limits_and_projects() {
        let store = memory_store().await;
        store
            .insert_many(
                "gtfs_stop_times",
                vec![
                    doc(json!({"trip_id": "T1", "stop_id": "A1", "stop_sequence": 1, "data_type": "regular"})),
                    doc(json!({"trip_id": "T2", "stop_id": "A1", "stop_sequence": 4, "data_type": "regular"})),
                    doc(json!({"trip_id": "T9", "stop_id": "A1", "stop_sequence": 1, "data_type": "supplemented"})),
                ],
            )
            .await
            .unwrap();

        let filter = Filter::data_type(DataType::Regular).eq("stop_id", "A1");
        let all = store
            .find("gtfs_stop_times", &filter, &FindOptions::new().project(&["trip_id"]))
            .await
            .unwrap();
        assert_eq!(all, vec![doc(json!({"trip_id": "T1"})), doc(json!({"trip_id": "T2"}))]);

        let capped = store
            .find("gtfs_stop_times", &filter, &FindOptions::new().limit(1))
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);

        let by_number = Filter::new().eq("stop_sequence", 4);
        assert_eq!(store.count("gtfs_stop_times", &by_number).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_scoped_by_data_type() {
        let store = memory_store().await;
        store
            .ensure_index("gtfs_stops", &IndexSpec::unique(&["data_type", "stop_id"]))
            .await
            .unwrap();
        // second call is a no-op
        store
            .ensure_index("gtfs_stops", &IndexSpec::unique(&["data_type", "stop_id"]))
            .await
            .unwrap();

        store
            .insert_many(
                "gtfs_stops",
                vec![
                    doc(json!({"stop_id": "A", "data_type": "regular"})),
                    doc(json!({"stop_id": "A", "data_type": "supplemented"})),
                ],
            )
            .await
            .unwrap();

        let dup = store
            .insert_many("gtfs_stops", vec![doc(json!({"stop_id": "A", "data_type": "regular"}))])
            .await;
        assert!(dup.is_err());
        assert_eq!(store.count("gtfs_stops", &Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replace_commits_atomically() {
        let store = memory_store().await;
        store
            .insert_many(
                "gtfs_routes",
                vec![
                    doc(json!({"route_id": "R1", "data_type": "regular"})),
                    doc(json!({"route_id": "R1", "data_type": "supplemented"})),
                ],
            )
            .await
            .unwrap();

        let mut session = store
            .begin_replace("gtfs_routes", Filter::data_type(DataType::Regular))
            .await
            .unwrap();
        session
            .insert_many(vec![doc(json!({"route_id": "R2", "data_type": "regular"}))])
            .await
            .unwrap();
        session
            .insert_many(vec![doc(json!({"route_id": "R3", "data_type": "regular"}))])
            .await
            .unwrap();
        assert_eq!(session.commit().await.unwrap(), 2);

        let regular = store
            .find("gtfs_routes", &Filter::data_type(DataType::Regular), &FindOptions::new())
            .await
            .unwrap();
        let ids: Vec<_> = regular.iter().map(|d| d["route_id"].clone()).collect();
        assert_eq!(ids, vec![json!("R2"), json!("R3")]);
        assert_eq!(
            store
                .count("gtfs_routes", &Filter::data_type(DataType::Supplemented))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_dropped_replace_rolls_back() {
        let store = memory_store().await;
        store
            .insert_many("gtfs_trips", vec![doc(json!({"trip_id": "T1", "data_type": "regular"}))])
            .await
            .unwrap();

        {
            let _session = store
                .begin_replace("gtfs_trips", Filter::data_type(DataType::Regular))
                .await
                .unwrap();
        }

        assert_eq!(store.count("gtfs_trips", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_a_single_document() {
        let store = memory_store().await;
        let filter = Filter::data_type(DataType::Supplemented);
        store
            .upsert_one("gtfs_metadata", &filter, doc(json!({"is_supplemented": true, "source_url": "a"})))
            .await
            .unwrap();
        store
            .upsert_one("gtfs_metadata", &filter, doc(json!({"source_url": "b"})))
            .await
            .unwrap();

        let docs = store
            .find("gtfs_metadata", &Filter::new(), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(
            docs,
            vec![doc(json!({"data_type": "supplemented", "is_supplemented": true, "source_url": "b"}))]
        );
    }
}
