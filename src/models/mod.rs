pub mod diagnostics;
pub mod diagram;
pub mod error;
pub mod health;
pub mod messages;
pub mod session;

pub use diagnostics::*;
pub use diagram::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use session::*;
