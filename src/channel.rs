//! Transport seam used by session negotiation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::Message;
use crate::protocol::SecurityProtocol;

/// Address of a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn uri(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request/reply channel.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Send a request and wait for its reply.
    async fn request(&self, message: Message, timeout: Duration) -> Result<Message, Error>;

    async fn close(&self, timeout: Duration) -> Result<(), Error>;
}

/// Opens request channels to remote endpoints.
#[async_trait]
pub trait RequestChannelFactory: Send + Sync {
    async fn create_channel(
        &self,
        to: &EndpointAddress,
        via: Option<&EndpointAddress>,
        timeout: Duration,
    ) -> Result<Arc<dyn RequestChannel>, Error>;
}

/// How the negotiation exchange itself is carried: the channel factory and
/// an optional protocol securing the RST/RSTR messages.
#[derive(Clone)]
pub struct BootstrapBinding {
    pub channel_factory: Arc<dyn RequestChannelFactory>,
    pub protocol: Option<Arc<SecurityProtocol>>,
}

impl BootstrapBinding {
    pub fn new(channel_factory: Arc<dyn RequestChannelFactory>) -> Self {
        Self {
            channel_factory,
            protocol: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<SecurityProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

impl fmt::Debug for BootstrapBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapBinding")
            .field("secured", &self.protocol.is_some())
            .finish_non_exhaustive()
    }
}
