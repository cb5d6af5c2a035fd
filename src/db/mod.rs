pub mod dbcolab;
pub mod memstore;
pub mod store;

pub use dbcolab::PgDiagramStore;
pub use memstore::MemoryDiagramStore;
pub use store::{DiagramStore, HistoryOutcome, PersistedMutation, StoreError};
