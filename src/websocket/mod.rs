//! WebSocket push layer
//!
//! Producers (chain listener, trade router, ledger writes) publish
//! `PushEvent`s into a lock-free queue; the fan-out dispatcher delivers each
//! event to the connections subscribed to its channel.

pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod messages;

pub use connection::{ConnectionId, ConnectionRegistry, PushError};
pub use dispatcher::{DispatchReport, FanOutDispatcher};
pub use handler::ws_handler;
pub use messages::{Envelope, EventPublisher, PushEvent};
