use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use tokio::runtime::Handle;

use crate::config::{AutoConnectionConfig, ConnectionConfig};
use crate::connection::{AutoConnection, Connection};
use crate::device::{SharedDevice, WeakDevice};
use crate::error::ConnectionError;
use crate::util::traits::{ConnectionFactory, ConnectionListener, PoolExtension};

/// A connection variant a [`ConnectionPool`] can manage.
pub trait PooledConnection: Send + Sync {
    fn connection(&self) -> &Connection;

    /// Makes the connection unusable. Called once when the pool is released.
    fn release(&self) {
        self.connection().release();
    }
}

impl PooledConnection for Connection {
    fn connection(&self) -> &Connection {
        self
    }
}

impl PooledConnection for AutoConnection {
    fn connection(&self) -> &Connection {
        AutoConnection::connection(self)
    }

    fn release(&self) {
        AutoConnection::release(self);
    }
}

/**
Lazily creates and caches one connection per device id.

Connections are built by a pluggable factory the first time a device is
requested; later requests for the same id return the cached connection,
re-pointed at the given device. After [`release`](Self::release) the pool
hands out nothing.
 */
pub struct ConnectionPool<C> {
    connections: DashMap<u64, Arc<C>>,
    factory: Box<dyn ConnectionFactory<C>>,
    extension: RwLock<Option<Arc<dyn PoolExtension<C>>>>,
    runtime: Handle,
    released: AtomicBool,
}

impl<C: PooledConnection + 'static> ConnectionPool<C> {
    pub fn new(factory: impl ConnectionFactory<C> + 'static, runtime: Handle) -> Self {
        ConnectionPool {
            connections: DashMap::new(),
            factory: Box::new(factory),
            extension: RwLock::new(None),
            runtime,
            released: AtomicBool::new(false),
        }
    }

    /// Installs the hook run for each connection created from now on.
    pub fn set_extension(&self, extension: Option<Arc<dyn PoolExtension<C>>>) {
        *self.extension.write().unwrap_or_else(PoisonError::into_inner) = extension;
    }

    /**
    Returns the connection for `device`, creating it on first use.

    An existing connection is re-pointed at `device` so a changed address is
    used by its next connect. A new connection is handed to the extension
    before any caller can see it. When two callers race to create the same id,
    one connection wins and the other is released unused.
     */
    pub fn get(&self, device: &SharedDevice) -> Result<Arc<C>, ConnectionError> {
        if self.is_released() {
            return Err(ConnectionError::PoolReleased);
        }
        let id = device.id();
        let connection = match self.find(id) {
            Some(existing) => {
                existing.connection().set_device(device);
                existing
            }
            None => self.create(device),
        };

        // `release` may have drained the map between the check and the insert.
        if self.is_released() {
            if self.connections.remove(&id).is_some() {
                connection.release();
            }
            return Err(ConnectionError::PoolReleased);
        }
        Ok(connection)
    }

    fn create(&self, device: &SharedDevice) -> Arc<C> {
        let id = device.id();
        let candidate = Arc::new(self.factory.create(device, &self.runtime));
        let extension = self
            .extension
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(extension) = extension {
            extension.on_connection_created(device, &candidate);
        }

        match self.connections.entry(id) {
            Entry::Occupied(entry) => {
                let winner = entry.get().clone();
                drop(entry);
                debug!("pool: device {:#x} was created concurrently", id);
                candidate.release();
                winner.connection().set_device(device);
                winner
            }
            Entry::Vacant(entry) => {
                entry.insert(candidate.clone());
                debug!("pool: created connection for device {:#x}", id);
                candidate
            }
        }
    }

    /// Cached connection for `id`, without creating one.
    pub fn find(&self, id: u64) -> Option<Arc<C>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<C>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Disconnects and drops every pooled connection. Each connection is
    /// released exactly once; calling this again does nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        info!("pool: releasing {} connections", ids.len());
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.release();
            }
        }
    }
}

impl ConnectionPool<Connection> {
    /// Pool of plain connections.
    pub fn basic(config: ConnectionConfig, runtime: Handle) -> Self {
        ConnectionPool::new(
            move |device: &SharedDevice, runtime: &Handle| {
                Connection::new(device, config.clone(), runtime.clone())
            },
            runtime,
        )
    }
}

impl ConnectionPool<AutoConnection> {
    /// Pool of connections that disconnect when idle.
    pub fn auto(config: AutoConnectionConfig, runtime: Handle) -> Self {
        ConnectionPool::new(
            move |device: &SharedDevice, runtime: &Handle| {
                AutoConnection::new(device, config.clone(), runtime.clone())
            },
            runtime,
        )
    }
}

/// Keeps the `online` flag of each device in step with its connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnlineStatusExtension;

struct OnlineStatusListener {
    device: WeakDevice,
}

impl OnlineStatusListener {
    fn set_online(&self, online: bool) {
        if let Some(device) = self.device.upgrade() {
            device.write().set_online(online);
        }
    }
}

impl ConnectionListener for OnlineStatusListener {
    fn on_connected(&self, _device_id: u64) {
        self.set_online(true);
    }

    fn on_disconnected(&self, _device_id: u64, _cause: Option<&ConnectionError>) {
        self.set_online(false);
    }
}

impl<C: PooledConnection> PoolExtension<C> for OnlineStatusExtension {
    fn on_connection_created(&self, device: &SharedDevice, connection: &Arc<C>) {
        connection.connection().add_interceptor(Arc::new(OnlineStatusListener {
            device: device.downgrade(),
        }));
    }
}
