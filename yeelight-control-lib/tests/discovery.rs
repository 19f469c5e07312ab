mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use common::{init_logging, EVENT_TIMEOUT};
use yeelight_control_lib::config::ScannerConfig;
use yeelight_control_lib::device::device_map::DeviceMap;
use yeelight_control_lib::device::Device;
use yeelight_control_lib::error::DiscoveryError;
use yeelight_control_lib::util::discovery::{Scanner, SEARCH_MESSAGE};
use yeelight_control_lib::util::traits::ScanListener;

fn advertisement(start_line: &str, id: u64, address: &str, power: &str) -> String {
    format!(
        "{}\r\nCache-Control: max-age=3600\r\nLocation: yeelight://{}:55443\r\nid: {:#018x}\r\nmodel: color\r\nfw_ver: 18\r\nsupport: get_prop set_power toggle\r\npower: {}\r\nbright: 80\r\n",
        start_line, address, id, power
    )
}

fn search_reply(id: u64, address: &str, power: &str) -> String {
    advertisement("HTTP/1.1 200 OK", id, address, power)
}

fn scanner_config(discovery_target: SocketAddr) -> ScannerConfig {
    ScannerConfig {
        discovery_target,
        listen_address: "127.0.0.1:0".parse().unwrap(),
        default_timeout_ms: 500,
        ..ScannerConfig::default()
    }
}

/// Answers the first probe it receives with `replies`, in order.
async fn fake_responder(replies: Vec<String>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buffer = [0; 1024];
        let (len, source) = socket.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], SEARCH_MESSAGE.as_bytes());
        for reply in replies {
            socket.send_to(reply.as_bytes(), source).await.unwrap();
        }
        // Keep the socket open until the scan window is over.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });
    address
}

async fn wait_until_scanning(scanner: &Scanner) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !scanner.is_scanning() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_discover_dedupes_replies_by_id() {
    init_logging();
    let target = fake_responder(vec![
        search_reply(1, "10.0.0.1", "off"),
        "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n".to_string(),
        search_reply(2, "10.0.0.2", "off"),
        search_reply(1, "10.0.0.11", "on"),
    ])
    .await;
    let scanner = Scanner::new(scanner_config(target), Handle::current());

    let devices = scanner.discover(None).await.unwrap();
    assert!(devices.error().is_none());
    assert_eq!(devices.len(), 2);
    let first = devices.get(1).unwrap();
    assert_eq!(first.power(), Some(true));
    assert_eq!(first.address().to_string(), "10.0.0.11");
    assert!(devices.devices().all(Device::is_discovered));
    assert!(scanner.last_discovery().is_some());
    assert!(!scanner.is_scanning());
}

#[tokio::test]
async fn test_concurrent_discover_is_not_started() {
    init_logging();
    let target = fake_responder(vec![
        search_reply(1, "10.0.0.1", "on"),
        search_reply(2, "10.0.0.2", "off"),
    ])
    .await;
    let scanner = Scanner::new(scanner_config(target), Handle::current());

    let running = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.discover(Some(Duration::from_millis(500))).await })
    };
    wait_until_scanning(&scanner).await;

    assert!(scanner.discover(Some(Duration::from_millis(50))).await.is_none());
    assert!(scanner.is_scanning());

    let devices = running.await.unwrap().unwrap();
    assert!(devices.error().is_none());
    assert_eq!(devices.len(), 2);
    assert!(devices.contains(1));
    assert!(devices.contains(2));
    assert_eq!(devices.get(1).unwrap().power(), Some(true));
}

#[tokio::test]
async fn test_stop_cancels_running_scan() {
    init_logging();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let scanner = Scanner::new(scanner_config(silent.local_addr().unwrap()), Handle::current());

    let running = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.discover(Some(Duration::from_secs(30))).await })
    };
    wait_until_scanning(&scanner).await;
    scanner.stop();

    let devices = tokio::time::timeout(EVENT_TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(devices.error().is_none());
    assert!(!scanner.is_scanning());
    scanner.stop();
}

#[tokio::test]
async fn test_socket_failure_is_reported_in_the_map() {
    init_logging();
    // Sending to the broadcast address without SO_BROADCAST is refused.
    let scanner = Scanner::new(
        scanner_config("255.255.255.255:1982".parse().unwrap()),
        Handle::current(),
    );

    let devices = scanner.discover(None).await.unwrap();
    assert!(matches!(devices.error(), Some(DiscoveryError::Io(_))));
    assert!(devices.is_empty());
    assert!(scanner.last_discovery().is_none());
}

#[tokio::test]
async fn test_listen_reports_each_announcement() {
    init_logging();
    let scanner = Scanner::new(
        scanner_config("127.0.0.1:9".parse().unwrap()),
        Handle::current(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let address = scanner
        .listen(Arc::new(move |device: Device| {
            let _ = tx.send(device);
        }))
        .unwrap();
    assert!(scanner.is_listening());
    assert!(matches!(
        scanner.listen(Arc::new(|_device: Device| {})),
        Err(DiscoveryError::AlreadyListening)
    ));

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"garbage", address).await.unwrap();
    let notify = advertisement("NOTIFY * HTTP/1.1", 0x2a, "10.0.0.42", "on");
    sender.send_to(notify.as_bytes(), address).await.unwrap();

    let device = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.id(), 0x2a);
    assert_eq!(device.brightness(), Some(80));
    assert!(device.is_discovered());

    scanner.stop();
    assert!(!scanner.is_listening());
    scanner.stop();
}

struct RescanRecorder {
    completed: mpsc::UnboundedSender<DeviceMap>,
}

impl ScanListener for RescanRecorder {
    fn on_device_announced(&self, _device: Device) {}

    fn on_discovery_completed(&self, devices: &DeviceMap) {
        let _ = self.completed.send(devices.clone());
    }
}

#[tokio::test]
async fn test_rescan_reports_completion_and_listens() {
    init_logging();
    let target = fake_responder(vec![search_reply(5, "10.0.0.5", "on")]).await;
    let scanner = Scanner::new(scanner_config(target), Handle::current());
    let (completed, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(RescanRecorder { completed });

    assert!(scanner.rescan(Some(Duration::from_millis(300)), listener.clone()));
    assert!(!scanner.rescan(None, listener));

    let devices = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert!(devices.contains(5));

    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !scanner.is_listening() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    scanner.stop();
}

#[tokio::test]
async fn test_stop_during_rescan_does_not_resume_listening() {
    init_logging();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let scanner = Scanner::new(scanner_config(silent.local_addr().unwrap()), Handle::current());
    let (completed, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(RescanRecorder { completed });

    assert!(scanner.rescan(Some(Duration::from_secs(2)), listener));
    wait_until_scanning(&scanner).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    scanner.stop();

    let devices = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(devices.is_empty());
    assert!(devices.error().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!scanner.is_scanning());
    assert!(!scanner.is_listening());
}
