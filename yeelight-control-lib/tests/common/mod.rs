#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use yeelight_control_lib::device::{Device, DeviceModel, SharedDevice};
use yeelight_control_lib::error::ConnectionError;
use yeelight_control_lib::protocol::{Command, Reply};
use yeelight_control_lib::util::traits::ConnectionListener;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn shared_device(id: u64, address: SocketAddr) -> SharedDevice {
    SharedDevice::new(Device::new(
        id,
        DeviceModel::Color,
        address.ip(),
        address.port(),
    ))
}

/// Loopback listener standing in for a light.
pub struct FakeDevice {
    listener: TcpListener,
}

impl FakeDevice {
    pub async fn bind() -> FakeDevice {
        FakeDevice {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub async fn accept(&self) -> FakeSession {
        let (socket, _) = tokio::time::timeout(EVENT_TIMEOUT, self.listener.accept())
            .await
            .unwrap()
            .unwrap();
        FakeSession::new(socket)
    }
}

/// Device side of one control session.
pub struct FakeSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeSession {
    fn new(socket: TcpStream) -> FakeSession {
        let (read, writer) = socket.into_split();
        FakeSession {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Next command written by the client, as JSON.
    pub async fn read_command(&mut self) -> serde_json::Value {
        let line = tokio::time::timeout(EVENT_TIMEOUT, self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("client closed the session");
        serde_json::from_str(&line).unwrap()
    }

    pub async fn write_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }
}

/// Listener events, reduced to comparable values.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected(u64),
    Disconnected(u64, Option<String>),
    Response(u64, Reply),
    Error(u64, String, Option<u32>),
}

pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Recorder>, Events) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { events }), Events { rx })
    }
}

impl ConnectionListener for Recorder {
    fn on_connected(&self, device_id: u64) {
        let _ = self.events.send(Event::Connected(device_id));
    }

    fn on_disconnected(&self, device_id: u64, cause: Option<&ConnectionError>) {
        let _ = self
            .events
            .send(Event::Disconnected(device_id, cause.map(ToString::to_string)));
    }

    fn on_response(&self, device_id: u64, reply: &Reply) {
        let _ = self.events.send(Event::Response(device_id, reply.clone()));
    }

    fn on_connection_error(
        &self,
        device_id: u64,
        error: &ConnectionError,
        failed_command: Option<&Command>,
    ) {
        let _ = self.events.send(Event::Error(
            device_id,
            error.to_string(),
            failed_command.map(Command::id),
        ));
    }
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a listener event")
            .expect("listener chain was dropped")
    }

    /// Asserts that no further event arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("unexpected event {:?}", event);
        }
    }
}

/// Address nothing listens on.
pub async fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
