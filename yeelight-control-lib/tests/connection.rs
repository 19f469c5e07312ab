mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use common::{closed_address, init_logging, shared_device, Event, FakeDevice, Recorder};
use yeelight_control_lib::config::{AutoConnectionConfig, ConnectionConfig};
use yeelight_control_lib::connection::pool::OnlineStatusExtension;
use yeelight_control_lib::connection::{
    AutoConnection, Connection, ConnectionPool, ConnectionState,
};
use yeelight_control_lib::error::ConnectionError;
use yeelight_control_lib::protocol::{Command, Prop};

const QUIET: Duration = Duration::from_millis(200);

#[tokio::test]
async fn test_notification_updates_device_and_fires_one_response() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x10, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x10));

    session
        .write_line(r#"{"method":"props","params":{"power":"on","bright":"42","ct":9000}}"#)
        .await;

    match events.next().await {
        Event::Response(0x10, reply) => {
            assert!(reply.is_notification());
            assert_eq!(reply.props.unwrap().get_int(Prop::Bright), Some(42));
        }
        other => panic!("unexpected event {:?}", other),
    }
    {
        let device = device.read();
        assert_eq!(device.power(), Some(true));
        assert_eq!(device.brightness(), Some(42));
        assert_eq!(device.color_temperature(), Some(6500));
    }
    events.assert_quiet(QUIET).await;
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_reply_is_correlated_and_duplicate_dropped() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x11, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x11));

    let pending = connection
        .send(Command::get_prop(7, &[Prop::Power, Prop::Name]))
        .unwrap();
    assert_eq!(connection.pending_count(), 1);
    let command = session.read_command().await;
    assert_eq!(command["id"], 7);
    assert_eq!(command["method"], "get_prop");

    session.write_line(r#"{"id":7,"result":["off","desk"]}"#).await;
    session.write_line(r#"{"id":7,"result":["on","desk"]}"#).await;

    let reply = pending.await.unwrap();
    assert_eq!(reply.id, Some(7));
    let props = reply.props.unwrap();
    assert_eq!(props.get_bool(Prop::Power), Some(false));
    assert_eq!(props.get_text(Prop::Name), Some("desk"));

    match events.next().await {
        Event::Response(0x11, reply) => assert_eq!(reply.id, Some(7)),
        other => panic!("unexpected event {:?}", other),
    }
    events.assert_quiet(QUIET).await;
    assert_eq!(connection.pending_count(), 0);
    assert_eq!(device.read().power(), Some(false));
}

#[tokio::test]
async fn test_error_reply_resolves_pending_command() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x12, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    let pending = connection.send(Command::toggle(3)).unwrap();
    session.read_command().await;
    session
        .write_line(r#"{"id":3,"error":{"code":-1,"message":"unsupported method"}}"#)
        .await;

    let reply = pending.await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.code, -1);
    assert_eq!(reply.message.as_deref(), Some("unsupported method"));
}

#[tokio::test]
async fn test_connect_and_disconnect_alternate() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x13, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    let mut sessions = Vec::new();
    for _ in 0..3 {
        assert!(connection.connect());
        assert!(!connection.connect());
        sessions.push(fake.accept().await);
        assert_eq!(events.next().await, Event::Connected(0x13));
        assert_eq!(connection.state(), ConnectionState::Connected);

        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        assert_eq!(events.next().await, Event::Disconnected(0x13, None));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
    events.assert_quiet(QUIET).await;

    let err = connection.send(Command::toggle(connection.next_command_id())).unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected(0x13)));
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn test_peer_close_ends_session_and_drains_pending() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x14, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x14));

    let pending = connection.send(Command::toggle(1)).unwrap();
    session.read_command().await;
    drop(session);

    assert!(matches!(pending.await, Err(ConnectionError::Closed(0x14))));
    assert_eq!(
        events.next().await,
        Event::Disconnected(0x14, Some(ConnectionError::ClosedByPeer.to_string()))
    );
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_failure_is_reported_as_error() {
    init_logging();
    let device = shared_device(0x15, closed_address().await);
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    let err = connection.connect_and_wait().await.unwrap_err();
    assert!(err.is_connect_error());
    match events.next().await {
        Event::Error(0x15, _, None) => {}
        other => panic!("unexpected event {:?}", other),
    }
    events.assert_quiet(QUIET).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_malformed_frame_does_not_end_session() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x16, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x16));

    session.write_line("{not json").await;
    session.write_line(r#"{"method":"props","params":{"name":"hall"}}"#).await;

    match events.next().await {
        Event::Response(0x16, reply) => assert!(reply.is_notification()),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(connection.is_connected());
    assert_eq!(device.read().name(), Some("hall"));
}

#[tokio::test]
async fn test_interceptors_run_before_primary_listener() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x17, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (interceptor, mut intercepted) = Recorder::new();
    let (primary, mut events) = Recorder::new();
    let id = connection.add_interceptor(interceptor);
    connection.set_listener(Some(primary));

    connection.connect_and_wait().await.unwrap();
    let _session = fake.accept().await;
    assert_eq!(intercepted.next().await, Event::Connected(0x17));
    assert_eq!(events.next().await, Event::Connected(0x17));

    assert!(connection.remove_listener(id));
    assert!(!connection.remove_listener(id));
    connection.disconnect();
    assert_eq!(events.next().await, Event::Disconnected(0x17, None));
    intercepted.assert_quiet(QUIET).await;
}

#[tokio::test]
async fn test_dropped_device_still_reports_notifications() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x18, fake.address());
    let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));

    connection.connect_and_wait().await.unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x18));

    drop(device);
    assert!(connection.device().is_none());
    session.write_line(r#"{"method":"props","params":{"power":"off"}}"#).await;
    match events.next().await {
        Event::Response(0x18, reply) => {
            assert!(reply.is_notification());
            assert_eq!(reply.props.unwrap().get_bool(Prop::Power), Some(false));
        }
        other => panic!("unexpected event {:?}", other),
    }
    events.assert_quiet(QUIET).await;
    assert!(connection.device().is_none());
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_pool_release_disconnects_each_connection_once() {
    init_logging();
    let first = FakeDevice::bind().await;
    let second = FakeDevice::bind().await;
    let devices = [
        shared_device(1, first.address()),
        shared_device(2, second.address()),
    ];
    let pool = ConnectionPool::basic(ConnectionConfig::default(), Handle::current());

    let mut recorders = Vec::new();
    for device in &devices {
        let connection = pool.get(device).unwrap();
        let (recorder, events) = Recorder::new();
        connection.set_listener(Some(recorder));
        connection.connect_and_wait().await.unwrap();
        recorders.push(events);
    }
    let _sessions = (first.accept().await, second.accept().await);
    assert_eq!(pool.connections().len(), 2);

    pool.release();
    pool.release();

    for (events, device) in recorders.iter_mut().zip(&devices) {
        assert_eq!(events.next().await, Event::Connected(device.id()));
        assert_eq!(events.next().await, Event::Disconnected(device.id(), None));
        events.assert_quiet(QUIET).await;
    }
    assert!(pool.is_empty());
    assert!(matches!(pool.get(&devices[0]), Err(ConnectionError::PoolReleased)));
}

#[tokio::test]
async fn test_online_extension_tracks_connection_state() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x20, fake.address());
    let pool = ConnectionPool::basic(ConnectionConfig::default(), Handle::current());
    pool.set_extension(Some(Arc::new(OnlineStatusExtension)));

    let connection = pool.get(&device).unwrap();
    let (recorder, mut events) = Recorder::new();
    connection.set_listener(Some(recorder));
    assert!(!device.read().is_online());

    connection.connect_and_wait().await.unwrap();
    let _session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x20));
    assert!(device.read().is_online());

    connection.disconnect();
    assert_eq!(events.next().await, Event::Disconnected(0x20, None));
    assert!(!device.read().is_online());
}

#[tokio::test]
async fn test_auto_connection_disconnects_when_idle() {
    init_logging();
    let fake = FakeDevice::bind().await;
    let device = shared_device(0x30, fake.address());
    let config = AutoConnectionConfig {
        connection: ConnectionConfig::default(),
        idle_timeout_ms: 500,
    };
    let auto = AutoConnection::new(&device, config, Handle::current());
    let (recorder, mut events) = Recorder::new();
    auto.connection().set_listener(Some(recorder));

    let pending = auto
        .send_connecting(Command::toggle(auto.next_command_id()))
        .await
        .unwrap();
    let mut session = fake.accept().await;
    assert_eq!(events.next().await, Event::Connected(0x30));

    let command = session.read_command().await;
    session
        .write_line(&format!(r#"{{"id":{},"result":["ok"]}}"#, command["id"]))
        .await;
    assert!(pending.await.unwrap().is_ok_ack());
    assert!(matches!(events.next().await, Event::Response(0x30, _)));

    assert_eq!(events.next().await, Event::Disconnected(0x30, None));
    assert_eq!(auto.state(), ConnectionState::Disconnected);
}
