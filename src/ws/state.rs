use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::models::{
    Cell, CellOperationKind, CellPatchOperation, DiagramSnapshot, RejectionReason, MIN_CELL_HEIGHT, MIN_CELL_WIDTH,
};

/// A malformed operation, reported to the sender with `operation_rejected`
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    pub reason: RejectionReason,
    pub message: String,
}

impl ValidationError {
    fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApplyError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The operation assumed a diagram shape that no longer holds
    #[error("conflict on cell '{cell_id}': {message}")]
    Conflict { cell_id: String, message: String },
    #[error("operation does not change the diagram")]
    NoStateChange,
}

impl ApplyError {
    pub fn reason(&self) -> RejectionReason {
        match self {
            ApplyError::Invalid(e) => e.reason,
            ApplyError::Conflict { .. } => RejectionReason::ConflictDetected,
            ApplyError::NoStateChange => RejectionReason::NoStateChange,
        }
    }
}

/// Check the shape of a patch without looking at the diagram
pub fn validate_patch(patch: &CellPatchOperation) -> Result<(), ValidationError> {
    if patch.kind != CellPatchOperation::PATCH {
        return Err(ValidationError::new(
            RejectionReason::InvalidOperationType,
            format!("unsupported operation type '{}'", patch.kind),
        ));
    }
    if patch.cells.is_empty() {
        return Err(ValidationError::new(RejectionReason::EmptyOperation, "operation contains no cells"));
    }

    for op in &patch.cells {
        if op.id.trim().is_empty() {
            return Err(ValidationError::new(RejectionReason::ValidationFailed, "cell id must not be empty"));
        }
        if op.operation == CellOperationKind::Remove {
            continue;
        }
        let Some(cell) = &op.data else {
            return Err(ValidationError::new(
                RejectionReason::ValidationFailed,
                format!("{} of cell '{}' carries no data", op.operation, op.id),
            ));
        };
        if cell.id != op.id {
            return Err(ValidationError::new(
                RejectionReason::ValidationFailed,
                format!("cell data id '{}' does not match operation id '{}'", cell.id, op.id),
            ));
        }
        validate_geometry(cell)?;
    }
    Ok(())
}

fn validate_geometry(cell: &Cell) -> Result<(), ValidationError> {
    let g = &cell.geometry;
    if ![g.x, g.y, g.width, g.height].iter().all(|v| v.is_finite()) {
        return Err(ValidationError::new(
            RejectionReason::ValidationFailed,
            format!("cell '{}' has a non-finite geometry", cell.id),
        ));
    }
    if g.width < MIN_CELL_WIDTH || g.height < MIN_CELL_HEIGHT {
        return Err(ValidationError::new(
            RejectionReason::ValidationFailed,
            format!(
                "cell '{}' is {}x{}, minimum is {}x{}",
                cell.id, g.width, g.height, MIN_CELL_WIDTH, MIN_CELL_HEIGHT
            ),
        ));
    }
    Ok(())
}

/// Authoritative cells of one diagram and their version.
///
/// Owned by exactly one diagram actor; nothing else reads or writes it.
#[derive(Debug, Clone, Default)]
pub struct DiagramState {
    cells: BTreeMap<String, Cell>,
    update_vector: u64,
}

impl DiagramState {
    pub fn from_snapshot(snapshot: DiagramSnapshot) -> Self {
        Self {
            cells: snapshot.cells.into_iter().map(|c| (c.id.clone(), c)).collect(),
            update_vector: snapshot.update_vector,
        }
    }

    pub fn update_vector(&self) -> u64 {
        self.update_vector
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.cells.values().cloned().collect()
    }

    pub fn snapshot(&self) -> DiagramSnapshot {
        DiagramSnapshot { update_vector: self.update_vector, cells: self.cells() }
    }

    /// Apply every sub-operation of `patch` or none of them.
    ///
    /// Sub-operations see the effects of earlier ones in the same patch.
    /// Returns the new update vector, which moves by exactly one.
    pub fn apply(&mut self, patch: &CellPatchOperation) -> Result<u64, ApplyError> {
        validate_patch(patch)?;

        // dry run against an overlay so a late failure leaves no trace
        let mut staged: HashMap<&str, Option<&Cell>> = HashMap::new();
        let mut changed = false;
        for op in &patch.cells {
            let current = match staged.get(op.id.as_str()) {
                Some(cell) => *cell,
                None => self.cells.get(&op.id),
            };
            match op.operation {
                CellOperationKind::Add => {
                    if current.is_some() {
                        return Err(ApplyError::Conflict {
                            cell_id: op.id.clone(),
                            message: format!("cell '{}' already exists", op.id),
                        });
                    }
                    staged.insert(&op.id, op.data.as_ref());
                    changed = true;
                }
                CellOperationKind::Update => {
                    let Some(existing) = current else {
                        return Err(ApplyError::Conflict {
                            cell_id: op.id.clone(),
                            message: format!("cell '{}' does not exist", op.id),
                        });
                    };
                    if op.data.as_ref() != Some(existing) {
                        changed = true;
                    }
                    staged.insert(&op.id, op.data.as_ref());
                }
                CellOperationKind::Remove => {
                    if current.is_none() {
                        return Err(ApplyError::Conflict {
                            cell_id: op.id.clone(),
                            message: format!("cell '{}' does not exist", op.id),
                        });
                    }
                    staged.insert(&op.id, None);
                    changed = true;
                }
            }
        }
        if !changed {
            return Err(ApplyError::NoStateChange);
        }

        for op in &patch.cells {
            match (op.operation, &op.data) {
                (CellOperationKind::Remove, _) => {
                    self.cells.remove(&op.id);
                }
                (_, Some(cell)) => {
                    self.cells.insert(op.id.clone(), cell.clone());
                }
                (_, None) => {}
            }
        }
        self.update_vector += 1;
        Ok(self.update_vector)
    }

    /// Adopt cells handed back by the store after undo or redo
    pub fn replace_cells(&mut self, cells: Vec<Cell>) -> u64 {
        self.cells = cells.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.update_vector += 1;
        self.update_vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellOperation, Geometry};

    fn cell(id: &str, x: f64) -> Cell {
        Cell {
            id: id.to_string(),
            shape: "process".to_string(),
            geometry: Geometry { x, y: 100.0, width: 80.0, height: 60.0 },
            label: None,
            attrs: Default::default(),
        }
    }

    #[test]
    fn add_bumps_version_once_per_message() {
        let mut state = DiagramState::default();
        let uv = state
            .apply(&CellPatchOperation::patch(vec![
                CellOperation::add(cell("c1", 0.0)),
                CellOperation::add(cell("c2", 0.0)),
                CellOperation::add(cell("c3", 0.0)),
            ]))
            .unwrap();
        assert_eq!(uv, 1);
        assert_eq!(state.cells().len(), 3);
    }

    #[test]
    fn duplicate_add_is_a_conflict() {
        let mut state = DiagramState::default();
        state.apply(&CellPatchOperation::patch(vec![CellOperation::add(cell("c1", 0.0))])).unwrap();
        let err = state
            .apply(&CellPatchOperation::patch(vec![CellOperation::add(cell("c1", 10.0))]))
            .unwrap_err();
        assert_eq!(err.reason(), RejectionReason::ConflictDetected);
        assert_eq!(state.update_vector(), 1);
        assert_eq!(state.cells(), vec![cell("c1", 0.0)]);
    }

    #[test]
    fn late_failure_leaves_no_partial_application() {
        let mut state = DiagramState::default();
        let err = state
            .apply(&CellPatchOperation::patch(vec![
                CellOperation::add(cell("c1", 0.0)),
                CellOperation::remove("missing"),
            ]))
            .unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
        assert!(state.cells().is_empty());
        assert_eq!(state.update_vector(), 0);
    }

    #[test]
    fn sub_operations_see_earlier_ones() {
        let mut state = DiagramState::default();
        state
            .apply(&CellPatchOperation::patch(vec![
                CellOperation::add(cell("c1", 0.0)),
                CellOperation::update(cell("c1", 25.0)),
            ]))
            .unwrap();
        assert_eq!(state.cells(), vec![cell("c1", 25.0)]);

        let err = state
            .apply(&CellPatchOperation::patch(vec![
                CellOperation::remove("c1"),
                CellOperation::update(cell("c1", 30.0)),
            ]))
            .unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
    }

    #[test]
    fn identical_update_is_no_state_change() {
        let mut state = DiagramState::from_snapshot(DiagramSnapshot { update_vector: 7, cells: vec![cell("c1", 0.0)] });
        let err = state
            .apply(&CellPatchOperation::patch(vec![CellOperation::update(cell("c1", 0.0))]))
            .unwrap_err();
        assert_eq!(err, ApplyError::NoStateChange);
        assert_eq!(state.update_vector(), 7);
    }

    #[test]
    fn validation_reasons() {
        let wrong_type = CellPatchOperation { kind: "replace".into(), cells: vec![CellOperation::remove("c1")] };
        assert_eq!(validate_patch(&wrong_type).unwrap_err().reason, RejectionReason::InvalidOperationType);

        let empty = CellPatchOperation::patch(vec![]);
        assert_eq!(validate_patch(&empty).unwrap_err().reason, RejectionReason::EmptyOperation);

        let mut tiny = cell("c1", 0.0);
        tiny.geometry.width = 10.0;
        let err = validate_patch(&CellPatchOperation::patch(vec![CellOperation::add(tiny)])).unwrap_err();
        assert_eq!(err.reason, RejectionReason::ValidationFailed);

        let mut mismatched = CellOperation::update(cell("c1", 0.0));
        mismatched.id = "c2".into();
        assert!(validate_patch(&CellPatchOperation::patch(vec![mismatched])).is_err());

        let no_data = CellOperation { id: "c1".into(), operation: CellOperationKind::Add, data: None };
        assert!(validate_patch(&CellPatchOperation::patch(vec![no_data])).is_err());

        let mut nan = cell("c1", 0.0);
        nan.geometry.x = f64::NAN;
        assert!(validate_patch(&CellPatchOperation::patch(vec![CellOperation::add(nan)])).is_err());
    }

    #[test]
    fn snapshot_reproduces_internal_cells() {
        let mut state = DiagramState::default();
        state
            .apply(&CellPatchOperation::patch(vec![
                CellOperation::add(cell("b", 0.0)),
                CellOperation::add(cell("a", 0.0)),
            ]))
            .unwrap();
        let snapshot = state.snapshot();
        let rebuilt = DiagramState::from_snapshot(snapshot.clone());
        assert_eq!(rebuilt.cells(), state.cells());
        assert_eq!(rebuilt.update_vector(), snapshot.update_vector);
    }
}
