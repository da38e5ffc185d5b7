use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::endpoint::EndpointDescriptor;

/// The opening handshake's HTTP upgrade request, as it is about to be sent
pub type HandshakeRequest = Request;

/// Extension point for authentication: it gets to modify the upgrade request before it is sent,
///  typically adding an `Authorization` header or a cookie. It is invoked for every connection
///  attempt, including reconnects, so it can refresh short-lived credentials.
///
/// Failing here fails the connection attempt with a handshake error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthExtension: Send + Sync + 'static {
    async fn on_handshake(&self, endpoint: &EndpointDescriptor, request: &mut HandshakeRequest) -> anyhow::Result<()>;
}

/// Adds a fixed header to every handshake, e.g. a pre-computed `Authorization: Bearer ...`
pub struct StaticHeaderAuth {
    name: HeaderName,
    value: HeaderValue,
}
impl StaticHeaderAuth {
    pub fn new(name: &str, value: &str) -> anyhow::Result<StaticHeaderAuth> {
        let mut value = HeaderValue::from_str(value)?;
        value.set_sensitive(true);

        Ok(StaticHeaderAuth {
            name: HeaderName::from_bytes(name.as_bytes())?,
            value,
        })
    }

    pub fn bearer(token: &str) -> anyhow::Result<StaticHeaderAuth> {
        Self::new("authorization", &format!("Bearer {}", token))
    }
}

#[async_trait]
impl AuthExtension for StaticHeaderAuth {
    async fn on_handshake(&self, _endpoint: &EndpointDescriptor, request: &mut HandshakeRequest) -> anyhow::Result<()> {
        request.headers_mut()
            .insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}
