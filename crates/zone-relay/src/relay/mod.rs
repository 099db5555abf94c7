//! Per-connection relay sessions and their registry.

pub mod registry;
pub mod session;

pub use registry::SessionRegistry;
pub use session::{RelaySession, SessionContext, SessionOutcome, SessionSettings, SessionState};
