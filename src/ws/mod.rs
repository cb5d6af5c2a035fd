pub mod connctx;
pub mod gateway;
mod history;
pub mod persist;
mod presence;
pub mod registry;
pub mod router;
pub mod state;
pub mod sync;

pub use connctx::{connection_channel, ConnectionHandle, DisconnectReason};
pub use registry::{CollaborationSession, RegistryError, SessionRegistry};
pub use router::DiagramHandle;
