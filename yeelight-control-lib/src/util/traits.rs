use std::sync::Arc;

use tokio::runtime::Handle;

use crate::device::device_map::DeviceMap;
use crate::device::{Device, SharedDevice};
use crate::error::ConnectionError;
use crate::protocol::command::Command;
use crate::protocol::reply::Reply;

/// Observer of a single connection.
///
/// Callbacks for one connection are delivered in order from a dispatcher task,
/// never from the caller of a connection method. Every method has an empty
/// default so implementors only pick the events they need.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, _device_id: u64) {}

    /// The session ended. `cause` is `None` for an explicit disconnect.
    fn on_disconnected(&self, _device_id: u64, _cause: Option<&ConnectionError>) {}

    /// A frame was received: a command result or a property notification.
    fn on_response(&self, _device_id: u64, _reply: &Reply) {}

    /// Opening the connection failed, or writing `failed_command` failed.
    fn on_connection_error(
        &self,
        _device_id: u64,
        _error: &ConnectionError,
        _failed_command: Option<&Command>,
    ) {
    }
}

/// Observer of the discovery scanner.
pub trait ScanListener: Send + Sync {
    /// A device announced itself, or answered a probe sent by a rescan.
    fn on_device_announced(&self, device: Device);

    fn on_discovery_completed(&self, _devices: &DeviceMap) {}
}

impl<F> ScanListener for F
where
    F: Fn(Device) + Send + Sync,
{
    fn on_device_announced(&self, device: Device) {
        self(device)
    }
}

/// Hook run by a pool for every connection it creates, e.g. to attach
/// interceptors uniformly.
pub trait PoolExtension<C>: Send + Sync {
    fn on_connection_created(&self, device: &SharedDevice, connection: &Arc<C>);
}

impl<C, F> PoolExtension<C> for F
where
    F: Fn(&SharedDevice, &Arc<C>) + Send + Sync,
{
    fn on_connection_created(&self, device: &SharedDevice, connection: &Arc<C>) {
        self(device, connection)
    }
}

/// Creates the connections of a pool.
pub trait ConnectionFactory<C>: Send + Sync {
    fn create(&self, device: &SharedDevice, runtime: &Handle) -> C;
}

impl<C, F> ConnectionFactory<C> for F
where
    F: Fn(&SharedDevice, &Handle) -> C + Send + Sync,
{
    fn create(&self, device: &SharedDevice, runtime: &Handle) -> C {
        self(device, runtime)
    }
}
