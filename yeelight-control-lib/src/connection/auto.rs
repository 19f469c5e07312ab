use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use log::debug;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::AutoConnectionConfig;
use crate::connection::{Connection, ConnectionState, ListenerId, PendingReply, WeakConnection};
use crate::device::SharedDevice;
use crate::error::ConnectionError;
use crate::protocol::command::Command;
use crate::protocol::reply::Reply;
use crate::util::traits::ConnectionListener;

/// Disconnects a connection once nothing was sent or received for a while.
struct IdleTimer {
    idle: Duration,
    connection: WeakConnection,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl IdleTimer {
    fn restart(&self) {
        let connection = self.connection.clone();
        let idle = self.idle;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(connection) = connection.upgrade() {
                if connection.disconnect() {
                    debug!(
                        "device {:#x}: idle for {:?}, disconnected",
                        connection.device_id(),
                        idle
                    );
                }
            }
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel(&self) {
        let previous = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Interceptor that drives the idle timer from connection events.
struct IdlePolicy {
    timer: Weak<IdleTimer>,
    connection: WeakConnection,
}

impl IdlePolicy {
    /// A connection whose device was dropped has nobody left to report to.
    fn device_dropped(&self) -> bool {
        match self.connection.upgrade() {
            Some(connection) if connection.device().is_none() => {
                debug!(
                    "device {:#x}: device was dropped, disconnecting",
                    connection.device_id()
                );
                connection.disconnect();
                true
            }
            _ => false,
        }
    }
}

impl ConnectionListener for IdlePolicy {
    fn on_connected(&self, _device_id: u64) {
        if self.device_dropped() {
            return;
        }
        if let Some(timer) = self.timer.upgrade() {
            timer.restart();
        }
    }

    fn on_disconnected(&self, _device_id: u64, _cause: Option<&ConnectionError>) {
        if let Some(timer) = self.timer.upgrade() {
            timer.cancel();
        }
    }

    fn on_response(&self, _device_id: u64, _reply: &Reply) {
        if self.device_dropped() {
            return;
        }
        if let Some(timer) = self.timer.upgrade() {
            timer.restart();
        }
    }
}

/**
A [`Connection`] that closes its socket after a period of inactivity.

The idle timer starts when the session is established and restarts on every
successful [`send`](Self::send) and every received frame. On expiry the
connection is disconnected without a cause; the next
[`send_connecting`](Self::send_connecting) opens a new session.
 */
pub struct AutoConnection {
    connection: Connection,
    timer: Arc<IdleTimer>,
    policy: ListenerId,
}

impl AutoConnection {
    pub fn new(device: &SharedDevice, config: AutoConnectionConfig, runtime: Handle) -> Self {
        let idle = config.idle_timeout();
        let connection = Connection::new(device, config.connection, runtime.clone());
        let timer = Arc::new(IdleTimer {
            idle,
            connection: connection.downgrade(),
            task: Mutex::new(None),
            runtime,
        });
        let policy = connection.add_interceptor(Arc::new(IdlePolicy {
            timer: Arc::downgrade(&timer),
            connection: connection.downgrade(),
        }));
        AutoConnection {
            connection,
            timer,
            policy,
        }
    }

    /// The underlying connection, for listeners and state queries.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn idle_timeout(&self) -> Duration {
        self.timer.idle
    }

    pub fn connect(&self) -> bool {
        self.connection.connect()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn next_command_id(&self) -> u32 {
        self.connection.next_command_id()
    }

    /// Sends on the current session and restarts the idle timer.
    pub fn send(&self, command: Command) -> Result<PendingReply, ConnectionError> {
        let pending = self.connection.send(command)?;
        self.timer.restart();
        Ok(pending)
    }

    /// Like [`send`](Self::send), but connects first when disconnected.
    pub async fn send_connecting(&self, command: Command) -> Result<PendingReply, ConnectionError> {
        if !self.connection.is_connected() {
            self.connection.connect_and_wait().await?;
        }
        self.send(command)
    }

    pub fn disconnect(&self) -> bool {
        self.timer.cancel();
        self.connection.disconnect()
    }

    pub fn release(&self) {
        self.timer.cancel();
        self.connection.remove_listener(self.policy);
        self.connection.release();
    }
}

impl std::fmt::Debug for AutoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoConnection")
            .field("connection", &self.connection)
            .field("idle_timeout", &self.timer.idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::device::{Device, DeviceModel};
    use tokio::net::TcpListener;

    fn config(idle_timeout_ms: u64) -> AutoConnectionConfig {
        AutoConnectionConfig {
            connection: ConnectionConfig::default(),
            idle_timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_idle_connection_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let device = SharedDevice::new(Device::new(7, DeviceModel::Mono, address.ip(), address.port()));
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let auto = AutoConnection::new(&device, config(100), Handle::current());
        let mut state = auto.connection().subscribe_state();
        auto.connection().connect_and_wait().await.unwrap();
        let _socket = server.await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(auto.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_connecting_opens_a_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let device = SharedDevice::new(Device::new(8, DeviceModel::Mono, address.ip(), address.port()));
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let auto = AutoConnection::new(&device, config(10_000), Handle::current());
        let pending = auto
            .send_connecting(Command::toggle(auto.next_command_id()))
            .await
            .unwrap();
        assert_eq!(pending.id(), 1);
        assert_eq!(auto.state(), ConnectionState::Connected);
        let _socket = server.await.unwrap();
        assert!(auto.disconnect());
    }
}
