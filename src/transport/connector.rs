//! Opens raw connections to the configured proxy server

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::Transport;

/// Dials the proxy server through a [`Transport`] with a deadline.
///
/// Refused or unroutable connects become `ServerUnreachable`, a missed
/// deadline becomes `ConnectionTimeout`.
#[derive(Clone)]
pub struct ProxyConnector {
    transport: Arc<dyn Transport>,
    server: Address,
    timeout: Duration,
}

impl ProxyConnector {
    pub fn new(transport: Arc<dyn Transport>, server: Address, timeout: Duration) -> Self {
        Self {
            transport,
            server,
            timeout,
        }
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    pub async fn open(&self) -> Result<Stream> {
        match tokio::time::timeout(self.timeout, self.transport.connect(&self.server)).await {
            Ok(Ok(stream)) => {
                debug!("Connected to proxy {}", self.server);
                Ok(stream)
            }
            Ok(Err(Error::Io(e))) => {
                Err(Error::ServerUnreachable(format!("{}: {}", self.server, e)))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionTimeout),
        }
    }
}
