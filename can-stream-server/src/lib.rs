//! Live CAN frame distribution over WebSocket
//!
//! - [`distributor`] owns the session table and fans frames out to observers
//! - [`server`] exposes the distributor at `/ws` (plus `/health`)
//! - [`client`] is the reconnecting consumer side of the same protocol
//! - [`source`] defines where frames come from
//!
//! Frames are decoded with [`can_frame_decoder`].

pub mod client;
pub mod config;
pub mod distributor;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod source;

/// `tokio::time::interval` panics on a zero period; timers never go below this
pub(crate) const MIN_TIMER_PERIOD: std::time::Duration = std::time::Duration::from_millis(1);

pub use client::{ClientConfig, ClientError, ClientEvent, ClientStats, ConnectionState, ReconnectingClient};
pub use distributor::{Distributor, DistributorConfig, DistributorHandle, HealthReport};
pub use protocol::{ClientMessage, DistributorStats, InterfaceInfo, ProtocolError, ServerMessage};
pub use queue::BoundedQueue;
pub use server::{ServerConfig, ServerHandle};
pub use session::{ClientSession, SessionHandle};
pub use source::{ChannelSource, FrameSource, SimulatedSource, SourceError, SourceEvent};
