use std::time::Duration;

use async_trait::async_trait;
use dyn_clone::DynClone;

use crate::{Document, SdamError, ServerAddress};

/// Options handed to a [`Connector`] for each new connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// True for the dedicated heartbeat and RTT connections, which never carry application
    /// traffic.
    pub monitoring: bool,
}

/// An established connection to one node. Encoding and the socket live behind this trait.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Runs `command` against database `db` and returns the raw reply, `ok: 0` included.
    async fn command(&mut self, db: &str, command: Document) -> Result<Document, SdamError>;

    /// Releases the connection. `force` skips any graceful shutdown.
    async fn destroy(&mut self, force: bool);
}

/// Opens connections. Cloned into every pool and monitor of a topology.
#[async_trait]
pub trait Connector: DynClone + Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        address: &ServerAddress,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, SdamError>;
}

dyn_clone::clone_trait_object!(Connector);
