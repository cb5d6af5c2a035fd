use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::{Cell, CellOperation, CellOperationKind, DiagramKey, DiagramSnapshot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("diagram '{0}' not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An accepted diagram operation, stamped with the version it produced
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMutation {
    pub update_vector: u64,
    pub cells: Vec<CellOperation>,
}

/// Result of asking the store to step its history
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    /// History moved; these are the canonical cells afterwards
    Applied(Vec<Cell>),
    /// Nothing left to undo or redo
    Empty,
    /// The backing store keeps no history
    Unsupported,
}

/// Durable home of diagrams.
///
/// Writes are idempotent on `update_vector`: anything not newer than the
/// stored version is skipped, so the persistence worker may retry freely.
#[async_trait]
pub trait DiagramStore: Send + Sync {
    async fn load(&self, key: &DiagramKey) -> Result<Option<DiagramSnapshot>, StoreError>;

    async fn apply_mutation(&self, key: &DiagramKey, mutation: &PersistedMutation) -> Result<(), StoreError>;

    /// Overwrite the stored cells without recording history.
    async fn save_snapshot(&self, key: &DiagramKey, snapshot: &DiagramSnapshot) -> Result<(), StoreError>;

    async fn undo(&self, _key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        Ok(HistoryOutcome::Unsupported)
    }

    async fn redo(&self, _key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        Ok(HistoryOutcome::Unsupported)
    }
}

/// Replay accepted cell operations onto stored cells.
///
/// The store may lag the live state after failed writes, so this never
/// refuses: adds and updates upsert, removes of missing cells are ignored.
pub fn apply_to_cells(cells: &mut BTreeMap<String, Cell>, ops: &[CellOperation]) {
    for op in ops {
        match (op.operation, &op.data) {
            (CellOperationKind::Add | CellOperationKind::Update, Some(cell)) => {
                cells.insert(op.id.clone(), cell.clone());
            }
            (CellOperationKind::Remove, _) => {
                cells.remove(&op.id);
            }
            _ => {}
        }
    }
}

pub fn cells_by_id(cells: Vec<Cell>) -> BTreeMap<String, Cell> {
    cells.into_iter().map(|c| (c.id.clone(), c)).collect()
}
