//! WebSocket transport for push sessions
//!
//! Handles TLS configuration and the authenticated upgrade request.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::RootCertStore;
use snafu::ResultExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::transport::{Transport, TransportLink};
use crate::error::{
    ConnectSnafu, EncodeSignalSnafu, InvalidEndpointSnafu, ReceiveSnafu, SendSnafu,
    TransportError,
};
use crate::protocol::{encode_signal, ChannelSignal};
use crate::validation;

/// Create a rustls client config with webpki root certificates for
/// cross-platform compatibility
pub fn create_tls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Arc::new(config)
}

/// Production transport: one WebSocket per push session.
pub struct WebSocketTransport {
    url: String,
    tls: Arc<rustls::ClientConfig>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        if let Err(details) = validation::validate_push_url(&url) {
            return InvalidEndpointSnafu {
                stage: "websocket_transport",
                url,
                details,
            }
            .fail();
        }
        Ok(Self {
            url,
            tls: create_tls_config(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, auth_token: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let stage = "connect";
        let url = self.url.clone();

        let mut request = url
            .as_str()
            .into_client_request()
            .context(ConnectSnafu { stage, url: url.clone() })?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth_token)).map_err(|e| {
            InvalidEndpointSnafu {
                stage,
                url: url.clone(),
                details: format!("auth token is not a valid header value: {}", e),
            }
            .build()
        })?;
        request.headers_mut().insert("Authorization", bearer);

        // the connector is ignored for ws:// URLs
        let connector = Connector::Rustls(self.tls.clone());
        let (stream, response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
                .await
                .context(ConnectSnafu { stage, url: url.clone() })?;
        debug!(%url, status = %response.status(), "push channel connected");

        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, signal: &ChannelSignal) -> Result<(), TransportError> {
        let stage = "send_signal";
        let text = encode_signal(signal).context(EncodeSignalSnafu { stage })?;
        trace!(frame = %text, "sending signal");
        self.stream
            .send(WsMessage::Text(text))
            .await
            .context(SendSnafu { stage })
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "push channel closed by server");
                    return None;
                }
                // ping/pong are answered by tungstenite; binary frames are not part of the protocol
                Ok(_) => continue,
                Err(source) => {
                    return Some(Err(source).context(ReceiveSnafu { stage: "recv_frame" }))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "push channel close failed");
        }
    }
}
