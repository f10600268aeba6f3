use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use tokio::sync::{Mutex, Semaphore};
use tracing::instrument;

use crate::{ConnectOptions, Connection, Connector, Document, SdamError, ServerAddress};

/// Application connections to one node.
///
/// Connections are checked out for a single command and checked back in afterwards. Clearing
/// the pool bumps its generation; connections from an older generation are destroyed instead
/// of being reused.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    address: ServerAddress,
    connector: Box<dyn Connector>,
    options: ConnectOptions,
    idle: Mutex<Vec<(u32, Box<dyn Connection>)>>,
    generation: AtomicU32,
    permits: Semaphore,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        address: ServerAddress,
        connector: Box<dyn Connector>,
        options: ConnectOptions,
        max_pool_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                address,
                connector,
                options,
                idle: Mutex::new(Vec::new()),
                generation: AtomicU32::new(0),
                permits: Semaphore::new(max_pool_size.max(1)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Runs one command on a pooled connection and returns the raw reply.
    #[instrument(level = "trace", name = "ConnectionPool - Command", skip(self, command), fields(address = %self.inner.address))]
    pub async fn command(&self, db: &str, command: Document) -> Result<Document, SdamError> {
        if self.is_closed() {
            return Err(SdamError::ServerClosed(self.inner.address.clone()));
        }
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| SdamError::ServerClosed(self.inner.address.clone()))?;

        let (generation, mut connection) = self.check_out().await?;
        match connection.command(db, command).await {
            Ok(reply) => {
                self.check_in(generation, connection).await;
                Ok(reply)
            }
            Err(e) => {
                tracing::debug!(
                    "Command on `{}` failed, destroying the connection. Caused by: {}",
                    self.inner.address,
                    e
                );
                connection.destroy(true).await;
                Err(e)
            }
        }
    }

    /// Invalidates every connection currently in the pool.
    pub async fn clear(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            "Clearing pool for `{}`, now at generation {}",
            self.inner.address,
            generation
        );
        let stale: Vec<_> = self.inner.idle.lock().await.drain(..).collect();
        for (_, mut connection) in stale {
            connection.destroy(false).await;
        }
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let idle: Vec<_> = self.inner.idle.lock().await.drain(..).collect();
        for (_, mut connection) in idle {
            connection.destroy(false).await;
        }
    }

    async fn check_out(&self) -> Result<(u32, Box<dyn Connection>), SdamError> {
        let current = self.generation();
        loop {
            let candidate = self.inner.idle.lock().await.pop();
            match candidate {
                Some((generation, connection)) if generation == current => {
                    return Ok((generation, connection))
                }
                Some((_, mut stale)) => stale.destroy(false).await,
                None => break,
            }
        }

        let connection = connect(&*self.inner.connector, &self.inner.address, &self.inner.options).await?;
        Ok((current, connection))
    }

    async fn check_in(&self, generation: u32, mut connection: Box<dyn Connection>) {
        if self.is_closed() || generation != self.generation() {
            connection.destroy(false).await;
            return;
        }
        self.inner.idle.lock().await.push((generation, connection));
    }
}

/// Opens a connection, bounded by the connect timeout.
pub(crate) async fn connect(
    connector: &dyn Connector,
    address: &ServerAddress,
    options: &ConnectOptions,
) -> Result<Box<dyn Connection>, SdamError> {
    match tokio::time::timeout(options.connect_timeout, connector.connect(address, options)).await {
        Ok(result) => result,
        Err(_) => Err(SdamError::network_timeout(format!(
            "connecting to `{}` timed out after {} ms",
            address,
            options.connect_timeout.as_millis()
        ))),
    }
}
