use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use utoipa::ToSchema;

/// Smallest width a shape may be resized to.
pub const MIN_CELL_WIDTH: f64 = 40.0;

/// Smallest height a shape may be resized to.
pub const MIN_CELL_HEIGHT: f64 = 30.0;

/// Position and size of a cell on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A single shape on a diagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Cell {
    pub id: String,
    pub shape: String,
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Shape specific attributes, passed through untouched
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[schema(value_type = Object)]
    pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CellOperationKind {
    Add,
    Update,
    Remove,
}

impl fmt::Display for CellOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellOperationKind::Add => write!(f, "add"),
            CellOperationKind::Update => write!(f, "update"),
            CellOperationKind::Remove => write!(f, "remove"),
        }
    }
}

/// One cell level change inside a diagram operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CellOperation {
    pub id: String,
    pub operation: CellOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Cell>,
}

impl CellOperation {
    pub fn add(cell: Cell) -> Self {
        Self { id: cell.id.clone(), operation: CellOperationKind::Add, data: Some(cell) }
    }

    pub fn update(cell: Cell) -> Self {
        Self { id: cell.id.clone(), operation: CellOperationKind::Update, data: Some(cell) }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self { id: id.into(), operation: CellOperationKind::Remove, data: None }
    }
}

/// The batch of cell changes carried by a `diagram_operation` frame.
/// `kind` must be `"patch"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CellPatchOperation {
    #[serde(rename = "type")]
    pub kind: String,
    pub cells: Vec<CellOperation>,
}

impl CellPatchOperation {
    pub const PATCH: &'static str = "patch";

    pub fn patch(cells: Vec<CellOperation>) -> Self {
        Self { kind: Self::PATCH.to_string(), cells }
    }
}

/// Versioned full state of a diagram
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct DiagramSnapshot {
    pub update_vector: u64,
    pub cells: Vec<Cell>,
}
