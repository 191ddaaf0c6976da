//! Push channel: one session per mounted surface.
//!
//! `ChannelManager` owns the surface → session registry. Each
//! `PushSession` is driven by its own task which connects through a
//! [`Transport`], rejoins every room in the session's set before reading
//! again, decodes frames at the boundary and hands typed events to the
//! session's handlers. Events pushed while disconnected are lost; the
//! conversation index's authoritative refresh closes that gap.

mod backoff;
mod connection;
mod driver;
mod handlers;
mod manager;
mod session;
mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use connection::{create_tls_config, WebSocketTransport};
pub use handlers::{Handler, HandlerId};
pub use manager::ChannelManager;
pub use session::{PushSession, SurfaceId};
pub use transport::{Transport, TransportLink};
