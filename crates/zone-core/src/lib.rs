//! zone-core: shared protocol library for the device event relay.
//!
//! Provides the auth message and device binding types, numeric secret
//! normalisation, the relay error type, and the abstract downstream
//! transport contract.

pub mod error;
pub mod messages;
pub mod secret;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{ZoneError, ZoneResult};
pub use messages::{AuthRequest, DeviceBinding, UpstreamEvent, UpstreamTarget};
pub use secret::NumericSecret;
pub use transport::{DownstreamTransport, Received};
