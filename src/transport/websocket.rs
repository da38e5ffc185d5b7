//! WebSocket transport based on `tokio-tungstenite`.
//!
//! This only deals with connecting (including the auth extension's part of the handshake),
//!  turning inbound data frames into payloads and classifying errors. Ping / pong is handled
//!  by tungstenite.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::endpoint::EndpointDescriptor;
use crate::transport::auth::{AuthExtension, HandshakeRequest};
use crate::transport::{Transport, TransportConnection, TransportError};

/// Parameters that are passed through to the WebSocket handshake and protocol implementation
#[derive(Clone)]
pub struct WebSocketOptions {
    pub auth: Option<Arc<dyn AuthExtension>>,
    pub origin: Option<String>,
    pub subprotocols: Vec<String>,
    /// Raw `Sec-WebSocket-Extensions` offers, e.g. for negotiating compression. The server's
    ///  choice must be supported by the underlying protocol implementation.
    pub extensions: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub write_buffer_size: usize,
    pub max_write_buffer_size: usize,
    pub disable_nagle: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        WebSocketOptions {
            auth: None,
            origin: None,
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            extra_headers: Vec::new(),
            max_message_size: Some(1 << 20),
            max_frame_size: Some(1 << 20),
            write_buffer_size: 1 << 16,
            max_write_buffer_size: usize::MAX,
            disable_nagle: true,
        }
    }
}

impl WebSocketOptions {
    fn protocol_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = self.max_message_size;
        config.max_frame_size = self.max_frame_size;
        config.write_buffer_size = self.write_buffer_size;
        config.max_write_buffer_size = self.max_write_buffer_size;
        config
    }
}

pub struct WebSocketTransport {
    options: WebSocketOptions,
}

impl WebSocketTransport {
    pub fn new(options: WebSocketOptions) -> WebSocketTransport {
        WebSocketTransport {
            options,
        }
    }

    async fn handshake_request(&self, endpoint: &EndpointDescriptor) -> Result<HandshakeRequest, TransportError> {
        let url = endpoint.to_url()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let mut request = url.as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("failed to build upgrade request: {}", e)))?;

        if let Some(origin) = &self.options.origin {
            insert_header(&mut request, "origin", origin)?;
        }
        if !self.options.subprotocols.is_empty() {
            insert_header(&mut request, "sec-websocket-protocol", &self.options.subprotocols.join(", "))?;
        }
        if !self.options.extensions.is_empty() {
            insert_header(&mut request, "sec-websocket-extensions", &self.options.extensions.join(", "))?;
        }
        for (name, value) in &self.options.extra_headers {
            insert_header(&mut request, name, value)?;
        }

        if let Some(auth) = &self.options.auth {
            auth.on_handshake(endpoint, &mut request).await
                .map_err(|e| TransportError::Handshake(format!("auth extension failed: {}", e)))?;
        }

        Ok(request)
    }
}

fn insert_header(request: &mut HandshakeRequest, name: &str, value: &str) -> Result<(), TransportError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::Handshake(format!("invalid header name {:?}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::Handshake(format!("invalid value for header {}: {}", name, e)))?;
    request.headers_mut().insert(name, value);
    Ok(())
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn TransportConnection>, TransportError> {
        let request = self.handshake_request(endpoint).await?;

        debug!(%endpoint, "opening websocket connection");
        let (stream, response) = connect_async_with_config(request, Some(self.options.protocol_config()), self.options.disable_nagle).await
            .map_err(classify_connect_error)?;
        debug!(%endpoint, status = %response.status(), "websocket connection established");

        Ok(Box::new(WebSocketConnection {
            stream,
            closed: false,
        }))
    }
}

fn classify_connect_error(e: WsError) -> TransportError {
    match e {
        WsError::Http(response) => TransportError::Handshake(format!("server rejected upgrade with status {}", response.status())),
        WsError::Url(e) => TransportError::Connect(format!("invalid url: {}", e)),
        WsError::Tls(e) => TransportError::Handshake(format!("tls: {}", e)),
        WsError::Protocol(e) => TransportError::Handshake(e.to_string()),
        WsError::Io(e) => TransportError::Connect(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

fn classify_receive_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ClosedByRemote("connection closed".to_string()),
        WsError::Io(e) => TransportError::ConnectionLost(e.to_string()),
        WsError::Protocol(e) => TransportError::Protocol(e.to_string()),
        WsError::Capacity(e) => TransportError::Protocol(e.to_string()),
        WsError::Utf8 => TransportError::Protocol("invalid utf-8 in text frame".to_string()),
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn recv_next(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "received close frame");
                    self.closed = true;
                    return Ok(None);
                }
                Some(Ok(msg)) => {
                    trace!("skipping control frame {:?}", msg);
                }
                Some(Err(e)) => return Err(classify_receive_error(e)),
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match SinkExt::close(&mut self.stream).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => {
                warn!("error closing websocket connection: {}", e);
                Err(classify_receive_error(e))
            }
        }
    }
}
