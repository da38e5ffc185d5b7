use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};
use url::Url;

/// The remote resource a channel is subscribed to. This is a plain value: the channel compares and
///  swaps it, but never looks inside beyond turning it into a URL for the transport.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct EndpointDescriptor {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    /// in order of appearance; keys may repeat (e.g. several `webId` parameters)
    pub query: Vec<(String, String)>,
}

impl EndpointDescriptor {
    pub fn new(scheme: &str, host: &str, path: &str) -> EndpointDescriptor {
        EndpointDescriptor {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port: None,
            path: path.to_string(),
            query: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<EndpointDescriptor> {
        let url = Url::parse(raw)?;
        let host = url.host_str()
            .ok_or_else(|| anyhow!("endpoint {} has no host", raw))?;

        let result = EndpointDescriptor {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
            path: url.path().to_string(),
            query: url.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        };
        result.validate()?;
        Ok(result)
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> EndpointDescriptor {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: &str, value: impl ToString) -> EndpointDescriptor {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "wss"
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheme != "ws" && self.scheme != "wss" {
            bail!("unsupported scheme '{}' - a streaming endpoint needs 'ws' or 'wss'", self.scheme);
        }
        if self.host.trim().is_empty() {
            bail!("endpoint has an empty host");
        }
        if self.port == Some(0) {
            bail!("endpoint has port 0");
        }
        Ok(())
    }

    pub fn to_url(&self) -> anyhow::Result<Url> {
        self.validate()?;

        let mut url = Url::parse(&format!("{}://{}", self.scheme, self.host))?;
        url.set_port(self.port)
            .map_err(|_| anyhow!("cannot set port {:?} on {}", self.port, self.host))?;
        url.set_path(&self.path);
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}

impl Display for EndpointDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_url() {
            Ok(url) => write!(f, "{}", url),
            Err(_) => write!(f, "{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}
