use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

use super::store::{apply_to_cells, cells_by_id, DiagramStore, HistoryOutcome, PersistedMutation, StoreError};
use crate::models::{Cell, DiagramKey, DiagramSnapshot};

/// Depth of the undo stack kept per diagram
const MAX_HISTORY: usize = 100;

#[derive(Debug, Default)]
struct MemoryDiagram {
    cells: BTreeMap<String, Cell>,
    update_vector: u64,
    undo: Vec<BTreeMap<String, Cell>>,
    redo: Vec<BTreeMap<String, Cell>>,
}

/// Process local diagram store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryDiagramStore {
    diagrams: Mutex<HashMap<DiagramKey, MemoryDiagram>>,
    autocreate: bool,
}

impl MemoryDiagramStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that treats every unknown diagram as an empty one, for local development
    pub fn autocreate() -> Self {
        Self { autocreate: true, ..Self::default() }
    }

    /// Register a diagram so sessions can be opened on it
    pub fn insert_diagram(&self, key: DiagramKey, snapshot: DiagramSnapshot) {
        if let Ok(mut diagrams) = self.diagrams.lock() {
            diagrams.insert(key, MemoryDiagram {
                cells: cells_by_id(snapshot.cells),
                update_vector: snapshot.update_vector,
                ..MemoryDiagram::default()
            });
        }
    }

    fn with_diagram<T>(
        &self,
        key: &DiagramKey,
        f: impl FnOnce(&mut MemoryDiagram) -> T,
    ) -> Result<T, StoreError> {
        let mut diagrams = self
            .diagrams
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let diagram = diagrams
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(f(diagram))
    }
}

#[async_trait]
impl DiagramStore for MemoryDiagramStore {
    async fn load(&self, key: &DiagramKey) -> Result<Option<DiagramSnapshot>, StoreError> {
        match self.with_diagram(key, |d| DiagramSnapshot {
            update_vector: d.update_vector,
            cells: d.cells.values().cloned().collect(),
        }) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StoreError::NotFound(_)) if self.autocreate => {
                debug!(diagram = %key, "creating empty diagram");
                self.insert_diagram(*key, DiagramSnapshot::default());
                Ok(Some(DiagramSnapshot::default()))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_mutation(&self, key: &DiagramKey, mutation: &PersistedMutation) -> Result<(), StoreError> {
        self.with_diagram(key, |d| {
            if mutation.update_vector <= d.update_vector {
                debug!(diagram = %key, update_vector = mutation.update_vector, "mutation already stored");
                return;
            }
            d.undo.push(d.cells.clone());
            if d.undo.len() > MAX_HISTORY {
                d.undo.remove(0);
            }
            d.redo.clear();
            apply_to_cells(&mut d.cells, &mutation.cells);
            d.update_vector = mutation.update_vector;
        })
    }

    async fn save_snapshot(&self, key: &DiagramKey, snapshot: &DiagramSnapshot) -> Result<(), StoreError> {
        self.with_diagram(key, |d| {
            if snapshot.update_vector < d.update_vector {
                return;
            }
            d.cells = cells_by_id(snapshot.cells.clone());
            d.update_vector = snapshot.update_vector;
        })
    }

    async fn undo(&self, key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        self.with_diagram(key, |d| match d.undo.pop() {
            Some(previous) => {
                let current = std::mem::replace(&mut d.cells, previous);
                d.redo.push(current);
                HistoryOutcome::Applied(d.cells.values().cloned().collect())
            }
            None => HistoryOutcome::Empty,
        })
    }

    async fn redo(&self, key: &DiagramKey) -> Result<HistoryOutcome, StoreError> {
        self.with_diagram(key, |d| match d.redo.pop() {
            Some(next) => {
                let current = std::mem::replace(&mut d.cells, next);
                d.undo.push(current);
                HistoryOutcome::Applied(d.cells.values().cloned().collect())
            }
            None => HistoryOutcome::Empty,
        })
    }
}
