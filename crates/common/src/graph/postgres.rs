//! Postgres graph store
//!
//! Reads the tables maintained by the indexing collaborator:
//!
//! | table | columns read |
//! |-------|--------------|
//! | `entities` | id, name, normalized_name, entity_type, community_id, importance, description |
//! | `relationships` | source_id, target_id, kind, weight |
//! | `chunks` | id, text, document_id, document_title, page_start, page_end, section |
//! | `entity_text_units` | entity_id, chunk_id, position |
//! | `community_reports` | id, community_id, title, summary |
//!
//! Every batch is sent as one statement with positional parameters.

use super::GraphStore;
use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::models::{AggregateSummary, Chunk, EdgeKind, Entity, EvidencePayload, GraphEdge, TextUnit};
use crate::text::normalize_name;
use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult, Statement, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Read connection pool (replica preferred)
#[derive(Clone)]
pub struct GraphDbPool {
    /// Primary connection
    pub primary: DatabaseConnection,

    /// Read replica connection (optional)
    pub replica: Option<DatabaseConnection>,
}

impl GraphDbPool {
    /// Create a new pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to graph store...");
        let primary = Self::open(&config.url, config, "primary").await?;

        let replica = match config.read_url {
            Some(ref read_url) => {
                info!("Connecting to graph store read replica...");
                Some(Self::open(read_url, config, "replica").await?)
            }
            None => None,
        };

        info!("Graph store connections established");
        Ok(Self { primary, replica })
    }

    async fn open(url: &str, config: &DatabaseConfig, role: &str) -> Result<DatabaseConnection> {
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to {}: {}", role, e),
            })
    }

    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        self.read()
            .execute(Statement::from_string(DbBackend::Postgres, "SELECT 1"))
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Health check failed: {}", e),
            })?;
        Ok(())
    }
}

/// `$start, $start+1, ...` for `count` positional parameters
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn uuid_values(ids: &[Uuid]) -> Vec<Value> {
    ids.iter().map(|id| Value::from(*id)).collect()
}

fn entity_from_row(row: &QueryResult) -> Result<Entity> {
    let community: Option<i64> = row.try_get("", "community_id")?;
    let importance: Option<f64> = row.try_get("", "importance")?;

    let mut entity = Entity::new(
        row.try_get("", "id")?,
        row.try_get::<String>("", "name")?,
        row.try_get::<String>("", "entity_type")?,
    )
    .with_importance(importance.unwrap_or(0.0) as f32);
    if let Some(community) = community {
        entity = entity.with_community(community as u64);
    }
    Ok(entity)
}

const ENTITY_COLUMNS: &str = "id, name, entity_type, community_id, importance";

/// Graph store backed by the indexing collaborator's Postgres schema
#[derive(Clone)]
pub struct PgGraphStore {
    db: GraphDbPool,
}

impl PgGraphStore {
    pub fn new(db: GraphDbPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &GraphDbPool {
        &self.db
    }

    async fn query(&self, sql: String, values: Vec<Value>) -> Result<Vec<QueryResult>> {
        self.db
            .read()
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await
            .map_err(AppError::from)
    }

    async fn linked_chunks(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, EvidencePayload)>> {
        let sql = format!(
            "SELECT l.entity_id, c.id, c.text, c.document_id, c.document_title, \
                    c.page_start, c.page_end, c.section \
             FROM entity_text_units l \
             JOIN chunks c ON c.id = l.chunk_id \
             WHERE l.entity_id IN ({}) \
             ORDER BY l.entity_id, l.position",
            placeholders(1, ids.len())
        );

        let rows = self.query(sql, uuid_values(ids)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut chunk = Chunk::new(
                row.try_get("", "id")?,
                row.try_get("", "document_id")?,
                row.try_get::<String>("", "document_title")?,
                row.try_get::<String>("", "text")?,
            );
            let start: Option<i32> = row.try_get("", "page_start")?;
            let end: Option<i32> = row.try_get("", "page_end")?;
            if let (Some(start), Some(end)) = (start, end) {
                chunk = chunk.with_pages(start.max(0) as u32, end.max(0) as u32);
            }
            if let Some(section) = row.try_get::<Option<String>>("", "section")? {
                chunk = chunk.with_section(section);
            }
            out.push((row.try_get("", "entity_id")?, EvidencePayload::Chunk(chunk)));
        }
        Ok(out)
    }

    async fn entity_descriptions(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, EvidencePayload)>> {
        let sql = format!(
            "SELECT {}, description FROM entities \
             WHERE id IN ({}) AND description IS NOT NULL",
            ENTITY_COLUMNS,
            placeholders(1, ids.len())
        );

        let rows = self.query(sql, uuid_values(ids)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = entity_from_row(&row)?;
            let description: String = row.try_get("", "description")?;
            out.push((entity.id, EvidencePayload::Entity { entity, description }));
        }
        Ok(out)
    }

    async fn community_reports(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, EvidencePayload)>> {
        let sql = format!(
            "SELECT e.id AS entity_id, r.id, r.community_id, r.title, r.summary \
             FROM community_reports r \
             JOIN entities e ON e.community_id = r.community_id \
             WHERE e.id IN ({})",
            placeholders(1, ids.len())
        );

        let rows = self.query(sql, uuid_values(ids)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let community: i64 = row.try_get("", "community_id")?;
            out.push((
                row.try_get("", "entity_id")?,
                EvidencePayload::Aggregate(AggregateSummary {
                    id: row.try_get("", "id")?,
                    community_id: community as u64,
                    title: row.try_get("", "title")?,
                    summary: row.try_get("", "summary")?,
                }),
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>> {
        let mut keys: Vec<String> = Vec::with_capacity(names.len());
        for key in names.iter().map(|n| normalize_name(n)) {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {}, normalized_name FROM entities WHERE normalized_name IN ({}) ORDER BY id",
            ENTITY_COLUMNS,
            placeholders(1, keys.len())
        );
        let values = keys.iter().map(|k| Value::from(k.clone())).collect();
        let rows = self.query(sql, values).await?;

        // Restore the order of the requested names
        let mut by_name: HashMap<String, Vec<Entity>> = HashMap::new();
        for row in rows {
            let key: String = row.try_get("", "normalized_name")?;
            by_name.entry(key).or_default().push(entity_from_row(&row)?);
        }

        let mut found: Vec<Entity> = Vec::new();
        for key in &keys {
            for entity in by_name.remove(key).unwrap_or_default() {
                if !found.iter().any(|e| e.id == entity.id) {
                    found.push(entity);
                }
            }
        }
        Ok(found)
    }

    async fn get_entities(&self, ids: &[Uuid]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM entities WHERE id IN ({})",
            ENTITY_COLUMNS,
            placeholders(1, ids.len())
        );
        let rows = self.query(sql, uuid_values(ids)).await?;

        let mut by_id: HashMap<Uuid, Entity> = HashMap::with_capacity(rows.len());
        for row in rows {
            let entity = entity_from_row(&row)?;
            by_id.insert(entity.id, entity);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn neighbors(&self, frontier: &[Uuid], kinds: &[EdgeKind]) -> Result<Vec<GraphEdge>> {
        if frontier.is_empty() || kinds.is_empty() {
            return Ok(Vec::new());
        }

        let n = frontier.len();
        let sql = format!(
            "SELECT source_id, target_id, kind, weight FROM relationships \
             WHERE (source_id IN ({}) OR target_id IN ({})) AND kind IN ({}) \
             ORDER BY source_id, target_id, kind",
            placeholders(1, n),
            placeholders(n + 1, n),
            placeholders(2 * n + 1, kinds.len())
        );
        let mut values = uuid_values(frontier);
        values.extend(uuid_values(frontier));
        values.extend(kinds.iter().map(|k| Value::from(k.as_str())));

        let rows = self.query(sql, values).await?;
        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let source: Uuid = row.try_get("", "source_id")?;
            let target: Uuid = row.try_get("", "target_id")?;
            let raw_kind: String = row.try_get("", "kind")?;
            let kind: EdgeKind = raw_kind
                .parse()
                .map_err(|message: String| AppError::GraphStore { message })?;
            let weight = row.try_get::<Option<f64>>("", "weight")?.unwrap_or(1.0) as f32;

            if frontier.contains(&source) {
                edges.push(GraphEdge { source, target, kind, weight });
            }
            if frontier.contains(&target) && source != target {
                edges.push(GraphEdge {
                    source: target,
                    target: source,
                    kind,
                    weight,
                });
            }
        }
        Ok(edges)
    }

    async fn text_units(&self, entity_ids: &[Uuid]) -> Result<Vec<TextUnit>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let (chunks, descriptions, reports) = futures::try_join!(
            self.linked_chunks(entity_ids),
            self.entity_descriptions(entity_ids),
            self.community_reports(entity_ids),
        )?;

        let mut grouped: HashMap<Uuid, Vec<EvidencePayload>> = HashMap::new();
        for (entity_id, payload) in chunks.into_iter().chain(descriptions).chain(reports) {
            grouped.entry(entity_id).or_default().push(payload);
        }

        let mut units = Vec::new();
        for id in entity_ids {
            for payload in grouped.remove(id).unwrap_or_default() {
                units.push(TextUnit {
                    entity_id: *id,
                    payload,
                });
            }
        }
        Ok(units)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 2), "$4, $5");
        assert_eq!(placeholders(1, 0), "");
    }
}
