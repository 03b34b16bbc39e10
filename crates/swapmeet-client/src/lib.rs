//! Client side of the swapmeet chat: an explicitly owned gateway connection,
//! the REST backend, and the two controllers that keep a chat view and an
//! inbox consistent across reconnects and duplicate deliveries.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod inbox;
pub mod session;

pub use backend::{ChatBackend, HttpBackend};
pub use config::ClientConfig;
pub use error::ClientError;
pub use gateway::{EventChannel, GatewayClient, ReconnectPolicy};
pub use inbox::InboxController;
pub use session::{ChatSession, SessionState};
