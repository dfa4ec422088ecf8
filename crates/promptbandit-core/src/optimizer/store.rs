//! Durable storage for templates, history and sessions
//!
//! The engine writes behind: storage is updated after in-memory state has
//! changed and a failed write never rolls that state back.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use super::session::Session;
use super::types::{PerformanceRecord, PromptTemplate, SelectionRecord, TemplateStats};
use crate::error::{Error, Result};

/// Storage adapter consumed by the optimizer
#[async_trait]
pub trait OptimizerStore: Send + Sync {
    /// Every persisted template with its statistics
    async fn load_templates(&self) -> Result<Vec<PromptTemplate>>;

    /// Insert or update one template
    ///
    /// Stored statistics are only replaced by ones with at least as many uses.
    async fn save_template(&self, template: &PromptTemplate) -> Result<()>;

    /// Insert or update many templates in one transaction
    async fn save_templates(&self, templates: &[PromptTemplate]) -> Result<()>;

    /// Update the statistics of stored templates, leaving their definition
    /// and activation alone; `total_uses` never goes backwards
    async fn save_template_stats(&self, templates: &[PromptTemplate]) -> Result<()>;

    async fn count_templates(&self) -> Result<u64>;

    async fn append_performance(&self, record: &PerformanceRecord) -> Result<()>;

    async fn append_selection(&self, record: &SelectionRecord) -> Result<()>;

    /// Performance records in sequence order, optionally for one template
    async fn load_performance(&self, template_id: Option<&str>) -> Result<Vec<PerformanceRecord>>;

    /// Number of performance records per template id
    async fn performance_counts(&self) -> Result<BTreeMap<String, u64>>;

    /// Selection records in sequence order
    async fn load_selections(&self) -> Result<Vec<SelectionRecord>>;

    /// Highest persisted history sequence (0 when empty)
    async fn last_sequence(&self) -> Result<u64>;

    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn load_sessions(&self) -> Result<Vec<Session>>;
}

/// SQL to create the optimizer tables
pub const CREATE_OPTIMIZER_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS prompt_templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL,
    version TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    expected_performance REAL NOT NULL DEFAULT 0.5,
    created_at TEXT NOT NULL,
    total_uses INTEGER NOT NULL DEFAULT 0,
    total_reward REAL NOT NULL DEFAULT 0.0,
    success_count INTEGER NOT NULL DEFAULT 0,
    average_reward REAL NOT NULL DEFAULT 0.0,
    confidence_lower REAL NOT NULL DEFAULT 0.0,
    confidence_upper REAL NOT NULL DEFAULT 1.0,
    last_used_at TEXT,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_prompt_templates_category ON prompt_templates(category);

CREATE TABLE IF NOT EXISTS performance_records (
    id TEXT PRIMARY KEY,
    sequence INTEGER NOT NULL,
    template_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    composite_score REAL NOT NULL,
    record_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_performance_records_template ON performance_records(template_id);
CREATE INDEX IF NOT EXISTS idx_performance_records_sequence ON performance_records(sequence);

CREATE TABLE IF NOT EXISTS selection_records (
    id TEXT PRIMARY KEY,
    sequence INTEGER NOT NULL,
    token_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    is_exploration INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_selection_records_sequence ON selection_records(sequence);

CREATE TABLE IF NOT EXISTS optimization_sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    session_json TEXT NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

const UPSERT_TEMPLATE_SQL: &str = r#"
INSERT INTO prompt_templates (
    id, name, content, category, version, is_active, description,
    expected_performance, created_at, total_uses, total_reward, success_count,
    average_reward, confidence_lower, confidence_upper, last_used_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
ON CONFLICT(id) DO UPDATE SET
    name = excluded.name,
    is_active = excluded.is_active,
    description = excluded.description,
    expected_performance = excluded.expected_performance,
    updated_at = CURRENT_TIMESTAMP
"#;

const UPDATE_TEMPLATE_STATS_SQL: &str = r#"
UPDATE prompt_templates SET
    total_uses = ?,
    total_reward = ?,
    success_count = ?,
    average_reward = ?,
    confidence_lower = ?,
    confidence_upper = ?,
    last_used_at = ?,
    updated_at = CURRENT_TIMESTAMP
WHERE id = ? AND total_uses <= ?
"#;

/// SQLite-backed optimizer store
#[derive(Debug, Clone)]
pub struct SqliteOptimizerStore {
    pool: SqlitePool,
}

impl SqliteOptimizerStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (and create if needed) a database file
    pub async fn connect(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let url = format!("sqlite://{}?mode=rwc", database_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(Self { pool })
    }

    /// Private in-memory database, one connection so every query sees it
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(Error::DatabaseError)?;
        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_OPTIMIZER_TABLES_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        info!("Optimizer tables initialized");
        Ok(())
    }

    fn template_from_row(row: &SqliteRow) -> PromptTemplate {
        PromptTemplate {
            id: row.get("id"),
            name: row.get("name"),
            content: row.get("content"),
            category: row.get("category"),
            version: row.get("version"),
            is_active: row.get::<i64, _>("is_active") != 0,
            description: row.get("description"),
            expected_performance: row.get("expected_performance"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            stats: TemplateStats {
                total_uses: row.get::<i64, _>("total_uses") as u64,
                total_reward: row.get("total_reward"),
                success_count: row.get::<i64, _>("success_count") as u64,
                average_reward: row.get("average_reward"),
                confidence_lower: row.get("confidence_lower"),
                confidence_upper: row.get("confidence_upper"),
                last_used_at: row.get::<Option<DateTime<Utc>>, _>("last_used_at"),
            },
        }
    }

    fn bind_template<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        template: &'q PromptTemplate,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(&template.id)
            .bind(&template.name)
            .bind(&template.content)
            .bind(&template.category)
            .bind(&template.version)
            .bind(template.is_active)
            .bind(&template.description)
            .bind(template.expected_performance)
            .bind(template.created_at)
            .bind(template.stats.total_uses as i64)
            .bind(template.stats.total_reward)
            .bind(template.stats.success_count as i64)
            .bind(template.stats.average_reward)
            .bind(template.stats.confidence_lower)
            .bind(template.stats.confidence_upper)
            .bind(template.stats.last_used_at)
    }

    fn bind_stats<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        template: &'q PromptTemplate,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(template.stats.total_uses as i64)
            .bind(template.stats.total_reward)
            .bind(template.stats.success_count as i64)
            .bind(template.stats.average_reward)
            .bind(template.stats.confidence_lower)
            .bind(template.stats.confidence_upper)
            .bind(template.stats.last_used_at)
            .bind(&template.id)
            .bind(template.stats.total_uses as i64)
    }
}

#[async_trait]
impl OptimizerStore for SqliteOptimizerStore {
    async fn load_templates(&self) -> Result<Vec<PromptTemplate>> {
        let rows = sqlx::query("SELECT * FROM prompt_templates ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let templates: Vec<PromptTemplate> = rows.iter().map(Self::template_from_row).collect();
        debug!(count = templates.len(), "Loaded prompt templates");
        Ok(templates)
    }

    async fn save_template(&self, template: &PromptTemplate) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;
        Self::bind_template(sqlx::query(UPSERT_TEMPLATE_SQL), template)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        Self::bind_stats(sqlx::query(UPDATE_TEMPLATE_STATS_SQL), template)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        tx.commit().await.map_err(Error::DatabaseError)?;

        debug!(
            template_id = %template.id,
            total_uses = template.stats.total_uses,
            "Saved prompt template"
        );
        Ok(())
    }

    async fn save_templates(&self, templates: &[PromptTemplate]) -> Result<()> {
        if templates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;
        for template in templates {
            Self::bind_template(sqlx::query(UPSERT_TEMPLATE_SQL), template)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;
            Self::bind_stats(sqlx::query(UPDATE_TEMPLATE_STATS_SQL), template)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;
        }
        tx.commit().await.map_err(Error::DatabaseError)?;

        info!(count = templates.len(), "Saved batch of prompt templates");
        Ok(())
    }

    async fn save_template_stats(&self, templates: &[PromptTemplate]) -> Result<()> {
        if templates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;
        let mut updated = 0u64;
        for template in templates {
            updated += Self::bind_stats(sqlx::query(UPDATE_TEMPLATE_STATS_SQL), template)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?
                .rows_affected();
        }
        tx.commit().await.map_err(Error::DatabaseError)?;

        debug!(
            count = templates.len(),
            updated = updated,
            "Saved template statistics"
        );
        Ok(())
    }

    async fn count_templates(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM prompt_templates")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn append_performance(&self, record: &PerformanceRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO performance_records (
                id, sequence, template_id, session_id, composite_score, record_json, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.sequence as i64)
        .bind(&record.template_id)
        .bind(&record.session_id)
        .bind(record.reward.composite_score)
        .bind(json)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    async fn append_selection(&self, record: &SelectionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO selection_records (
                id, sequence, token_id, template_id, session_id, is_exploration, record_json, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.sequence as i64)
        .bind(record.token_id.to_string())
        .bind(&record.template_id)
        .bind(&record.session_id)
        .bind(record.is_exploration)
        .bind(json)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    async fn load_performance(&self, template_id: Option<&str>) -> Result<Vec<PerformanceRecord>> {
        let rows = match template_id {
            Some(id) => {
                sqlx::query(
                    "SELECT record_json FROM performance_records WHERE template_id = ? ORDER BY sequence",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT record_json FROM performance_records ORDER BY sequence")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| serde_json::from_str(row.get::<&str, _>("record_json")).map_err(Error::from))
            .collect()
    }

    async fn performance_counts(&self) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT template_id, COUNT(*) AS count FROM performance_records GROUP BY template_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("template_id"),
                    row.get::<i64, _>("count") as u64,
                )
            })
            .collect())
    }

    async fn load_selections(&self) -> Result<Vec<SelectionRecord>> {
        let rows = sqlx::query("SELECT record_json FROM selection_records ORDER BY sequence")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| serde_json::from_str(row.get::<&str, _>("record_json")).map_err(Error::from))
            .collect()
    }

    async fn last_sequence(&self) -> Result<u64> {
        let row = sqlx::query("SELECT MAX(sequence) AS last FROM performance_records")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.get::<Option<i64>, _>("last").unwrap_or(0) as u64)
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string(session)?;
        sqlx::query(
            r#"
            INSERT INTO optimization_sessions (id, name, is_active, session_json, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                is_active = excluded.is_active,
                session_json = excluded.session_json,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(session.is_active)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        debug!(session_id = %session.id, "Saved optimization session");
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT session_json FROM optimization_sessions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| serde_json::from_str(row.get::<&str, _>("session_json")).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::seed::default_templates;
    use crate::optimizer::stats::ConfidenceModel;
    use crate::optimizer::types::{
        Algorithm, CandidateSource, MabConfig, RewardComponents, SelectionReason, StatsDelta,
    };
    use tempfile::{TempDir, tempdir};
    use uuid::Uuid;

    async fn create_test_store() -> (SqliteOptimizerStore, TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_optimizer.db");

        let store = SqliteOptimizerStore::connect(&db_path).await.unwrap();
        store.init().await.unwrap();

        (store, dir)
    }

    fn performance(sequence: u64, template_id: &str) -> PerformanceRecord {
        PerformanceRecord {
            id: Uuid::new_v4(),
            sequence,
            template_id: template_id.to_string(),
            session_id: "default".to_string(),
            reward: RewardComponents::zero(),
            context: serde_json::json!({"category": "constitutional"}),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_template_round_trip_keeps_stats() {
        let (store, _temp) = create_test_store().await;
        let model = ConfidenceModel::from_config(&MabConfig::default());

        let mut template = default_templates().remove(0);
        for _ in 0..6 {
            template.stats.record(&StatsDelta::from_reward(0.9, 0.8), &model);
        }
        store.save_template(&template).await.unwrap();

        let loaded = store.load_templates().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, template.id);
        assert_eq!(loaded[0].content, template.content);
        assert_eq!(loaded[0].stats.total_uses, 6);
        assert_eq!(loaded[0].stats.success_count, 6);
        assert!((loaded[0].stats.average_reward - 0.9).abs() < 1e-9);
        assert!(loaded[0].stats.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_template() {
        let (store, _temp) = create_test_store().await;
        store.save_templates(&default_templates()).await.unwrap();
        assert_eq!(store.count_templates().await.unwrap(), 4);

        let template = default_templates().remove(1).inactive();
        store.save_template(&template).await.unwrap();

        assert_eq!(store.count_templates().await.unwrap(), 4);
        let loaded = store.load_templates().await.unwrap();
        let safety = loaded.iter().find(|t| t.id == template.id).unwrap();
        assert!(!safety.is_active);
    }

    #[tokio::test]
    async fn test_stats_save_keeps_activation_and_never_regresses() {
        let (store, _temp) = create_test_store().await;
        let model = ConfidenceModel::from_config(&MabConfig::default());

        let original = default_templates().remove(0);
        store.save_template(&original.clone().inactive()).await.unwrap();

        // copy taken before the deactivation, but with newer stats
        let mut newer = original.clone();
        for _ in 0..4 {
            newer.stats.record(&StatsDelta::from_reward(0.9, 0.8), &model);
        }
        store.save_template_stats(std::slice::from_ref(&newer)).await.unwrap();

        let mut older = original;
        older.stats.record(&StatsDelta::from_reward(0.1, 0.8), &model);
        store.save_template_stats(std::slice::from_ref(&older)).await.unwrap();

        let loaded = store.load_templates().await.unwrap();
        assert!(!loaded[0].is_active);
        assert_eq!(loaded[0].stats.total_uses, 4);
        assert!((loaded[0].stats.average_reward - 0.9).abs() < 1e-9);

        // a full save carries activation but not older stats
        store.save_template(&older).await.unwrap();
        let loaded = store.load_templates().await.unwrap();
        assert!(loaded[0].is_active);
        assert_eq!(loaded[0].stats.total_uses, 4);
    }

    #[tokio::test]
    async fn test_stats_save_ignores_unknown_templates() {
        let store = SqliteOptimizerStore::in_memory().await.unwrap();
        store.init().await.unwrap();

        store.save_template_stats(&default_templates()).await.unwrap();
        assert_eq!(store.count_templates().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_is_ordered_and_filtered() {
        let store = SqliteOptimizerStore::in_memory().await.unwrap();
        store.init().await.unwrap();

        store.append_performance(&performance(2, "b")).await.unwrap();
        store.append_performance(&performance(1, "a")).await.unwrap();
        store.append_performance(&performance(3, "a")).await.unwrap();

        let all = store.load_performance(None).await.unwrap();
        let sequences: Vec<u64> = all.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.load_performance(Some("a")).await.unwrap().len(), 2);
        assert_eq!(store.last_sequence().await.unwrap(), 3);

        let counts = store.performance_counts().await.unwrap();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn test_selection_record_round_trip() {
        let store = SqliteOptimizerStore::in_memory().await.unwrap();
        store.init().await.unwrap();
        assert_eq!(store.last_sequence().await.unwrap(), 0);

        let record = SelectionRecord {
            id: Uuid::new_v4(),
            sequence: 1,
            token_id: Uuid::new_v4(),
            template_id: "constitutional_v1_0".to_string(),
            template_hash: "abc".to_string(),
            session_id: "default".to_string(),
            algorithm: Algorithm::Ucb1,
            reason: SelectionReason::Unexplored,
            candidate_source: CandidateSource::Category,
            candidates_considered: 1,
            is_exploration: true,
            stats_at_selection: TemplateStats::default(),
            context: serde_json::Value::Null,
            selected_at: Utc::now(),
            outcome: RewardComponents::zero(),
            recorded_at: Utc::now(),
        };
        store.append_selection(&record).await.unwrap();

        let loaded = store.load_selections().await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn test_sessions_round_trip() {
        let store = SqliteOptimizerStore::in_memory().await.unwrap();
        store.init().await.unwrap();

        let mut session = Session::new("s-1", "nightly", Algorithm::ThompsonSampling);
        store.save_session(&session).await.unwrap();
        session.is_active = false;
        store.save_session(&session).await.unwrap();

        let loaded = store.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].is_active);
        assert_eq!(loaded[0].name, "nightly");
    }
}
