pub mod collab;
pub mod diagnostics;
pub mod health;
pub mod ws;

pub use collab::*;
pub use diagnostics::*;
pub use health::*;
pub use ws::*;
