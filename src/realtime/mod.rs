//! Realtime change feed: wire protocol, transports, the reconnecting
//! subscription manager and the cache invalidation handler.

pub mod invalidation;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use invalidation::{InvalidationHandler, InvalidationOutcome};
pub use manager::{ChannelMachine, ChannelState, RealtimeManager};
pub use protocol::{ChangeEvent, ChangeKind, ChannelMessage};
pub use transport::{ChannelConnection, ChannelTransport, HttpStreamTransport};
