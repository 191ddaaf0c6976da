use async_trait::async_trait;

use crate::error::TransportError;
use crate::protocol::ChannelSignal;

/// Opens push-channel connections. One call is one underlying transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, auth_token: &str) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// A single live connection.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, signal: &ChannelSignal) -> Result<(), TransportError>;

    /// Next text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
