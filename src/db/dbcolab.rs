use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Error as SqlxError, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, error, info};

use super::store::{apply_to_cells, cells_by_id, DiagramStore, HistoryOutcome, PersistedMutation, StoreError};
use crate::models::{Cell, DiagramKey, DiagramSnapshot};

/// Undo entries kept per diagram, older ones are pruned on write
const MAX_HISTORY: i64 = 100;

const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS diagrams (
        id UUID PRIMARY KEY,
        threat_model_id UUID NOT NULL,
        cells JSONB NOT NULL DEFAULT '[]'::jsonb,
        update_vector BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diagram_history (
        id BIGSERIAL PRIMARY KEY,
        diagram_id UUID NOT NULL REFERENCES diagrams(id) ON DELETE CASCADE,
        direction TEXT NOT NULL CHECK (direction IN ('undo', 'redo')),
        cells JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS diagram_history_lookup ON diagram_history (diagram_id, direction, id)",
];

#[derive(Debug, Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Undo => "undo",
            Direction::Redo => "redo",
        }
    }

    fn opposite(self) -> Self {
        match self {
            Direction::Undo => Direction::Redo,
            Direction::Redo => Direction::Undo,
        }
    }
}

/// Postgres backed diagram store
pub struct PgDiagramStore {
    pool: PgPool,
}

impl PgDiagramStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Create the diagram tables if they are missing
    pub async fn ensure_schema(&self) -> Result<(), SqlxError> {
        for statement in SCHEMA_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn begin(&self, key: &DiagramKey) -> Result<Transaction<'static, Postgres>, StoreError> {
        match self.pool.begin().await {
            Ok(tx) => Ok(tx),
            Err(e) => {
                error!(
                    "Failed to acquire connection from pool for diagram {}: {}. Pool state: {} idle, {} total",
                    key,
                    e,
                    self.pool.num_idle(),
                    self.pool.size()
                );
                Err(e.into())
            }
        }
    }

    /// Lock the diagram row for the rest of the transaction
    async fn lock_diagram(
        tx: &mut Transaction<'static, Postgres>,
        key: &DiagramKey,
    ) -> Result<(Vec<Cell>, u64), StoreError> {
        let row = sqlx::query(
            "SELECT cells, update_vector FROM diagrams WHERE id = $1 AND threat_model_id = $2 FOR UPDATE",
        )
        .bind(key.diagram_id)
        .bind(key.threat_model_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let Json(cells): Json<Vec<Cell>> = row.try_get("cells")?;
        let update_vector: i64 = row.try_get("update_vector")?;
        Ok((cells, update_vector.max(0) as u64))
    }

    async fn push_history(
        tx: &mut Transaction<'static, Postgres>,
        key: &DiagramKey,
        direction: Direction,
        cells: Vec<Cell>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO diagram_history (diagram_id, direction, cells) VALUES ($1, $2, $3)")
            .bind(key.diagram_id)
            .bind(direction.as_str())
            .bind(Json(cells))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn write_cells(
        tx: &mut Transaction<'static, Postgres>,
        key: &DiagramKey,
        cells: Vec<Cell>,
        update_vector: Option<u64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE diagrams
            SET cells = $2, update_vector = COALESCE($3, update_vector), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(key.diagram_id)
        .bind(Json(cells))
        .bind(update_vector.map(|uv| uv as i64))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn step_history(&self, key: &DiagramKey, direction: Direction) -> Result<HistoryOutcome, StoreError> {
        let mut tx = self.begin(key).await?;
        let (current, _) = Self::lock_diagram(&mut tx, key).await?;

        let entry = sqlx::query(
            r#"
            SELECT id, cells FROM diagram_history
            WHERE diagram_id = $1 AND direction = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(key.diagram_id)
        .bind(direction.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = entry else {
            tx.commit().await?;
            return Ok(HistoryOutcome::Empty);
        };
        let entry_id: i64 = entry.try_get("id")?;
        let Json(restored): Json<Vec<Cell>> = entry.try_get("cells")?;

        sqlx::query("DELETE FROM diagram_history WHERE id = $1")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        Self::push_history(&mut tx, key, direction.opposite(), current).await?;
        Self::write_cells(&mut tx, key, restored.clone(), None).await?;
        tx.commit().await?;

        debug!(diagram = %key, direction = direction.as_str(), "history step applied");
        Ok(HistoryOutcome::Applied(restored))
    }
}

#[async_trait]
impl DiagramStore for PgDiagramStore {
    async fn load(&self, key: &DiagramKey) -> Result<Option<DiagramSnapshot>, StoreError> {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "Loading diagram {}. Pool connections: {} idle, {} in use",
            key,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );

        let row = sqlx::query("SELECT cells, update_vector FROM diagrams WHERE id = $1 AND threat_model_id = $2")
            .bind(key.diagram_id)
            .bind(key.threat_model_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(cells): Json<Vec<Cell>> = row.try_get("cells")?;
        let update_vector: i64 = row.try_get("update_vector")?;
        Ok(Some(DiagramSnapshot { update_vector: update_vector.max(0) as u64, cells }))
    }

    async fn apply_mutation(&self, key: &DiagramKey, mutation: &PersistedMutation) -> Result<(), StoreError> {
        let mut tx = self.begin(key).await?;
        let (cells, stored_vector) = Self::lock_diagram(&mut tx, key).await?;

        if mutation.update_vector <= stored_vector {
            debug!(diagram = %key, update_vector = mutation.update_vector, "mutation already stored");
            tx.commit().await?;
            return Ok(());
        }

        let mut next = cells_by_id(cells.clone());
        apply_to_cells(&mut next, &mutation.cells);

        Self::push_history(&mut tx, key, Direction::Undo, cells).await?;
        sqlx::query("DELETE FROM diagram_history WHERE diagram_id = $1 AND direction = 'redo'")
            .bind(key.diagram_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            DELETE FROM diagram_history
            WHERE diagram_id = $1 AND direction = 'undo' AND id NOT IN (
                SELECT id FROM diagram_history
                WHERE diagram_id = $1 AND direction = 'undo'
                ORDER BY id DESC
                LIMIT $2
            )
            "#,
        )
        .bind(key.diagram_id)
        .bind(MAX_HISTORY)
        .execute(&mut *tx)
        .await?;
        Self::write_cells(&mut tx, key, next.into_values().collect(), Some(mutation.update_vector)).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_snapshot(&self, key: &DiagramKey, snapshot: &DiagramSnapshot) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE diagrams
            SET cells = $3, update_vector = $4, updated_at = now()
            WHERE id = $1 AND threat_model_id = $2 AND update_vector <= $4
            "#,
        )
        .bind(key.diagram_id)
        .bind(key.threat_model_id)
        .bind(Json(&snapshot.cells))
        .bind(snapshot.update_vector as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(diagram = %key, update_vector = snapshot.update_vector, "snapshot not newer than stored state");
        }
        Ok(())
    }

    async fn undo(&self, key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        self.step_history(key, Direction::Undo).await
    }

    async fn redo(&self, key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        self.step_history(key, Direction::Redo).await
    }
}
