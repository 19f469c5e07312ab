use std::cmp::max;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ScannerConfig;
use crate::device::device_map::DeviceMap;
use crate::device::Device;
use crate::error::{DiscoveryError, ProtocolError};
use crate::util::traits::ScanListener;

/// Search probe sent to the multicast group.
pub const SEARCH_MESSAGE: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST:239.255.255.250:1982\r\n\
MAN:\"ssdp:discover\"\r\n\
ST:wifi_bulb\r\n";

/**
Parses a search reply or a `NOTIFY` announcement into a device.

Both are HTTP-like header blocks. Header names are matched case-insensitively;
lines without a colon (the status line) are skipped.
 */
pub fn parse_advertisement(data: &[u8]) -> Result<Device, ProtocolError> {
    let text = String::from_utf8_lossy(data);
    if !text.contains("yeelight") {
        return Err(ProtocolError::Unexpected(
            "datagram is not a yeelight advertisement".to_string(),
        ));
    }
    let headers: HashMap<String, String> = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Device::from_headers(&headers)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ScannerInner {
    config: ScannerConfig,
    runtime: Handle,
    scanning: AtomicBool,
    /// Cancelled and replaced by `stop`.
    cancel: Mutex<CancellationToken>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    last_discovery: Mutex<Option<DateTime<Utc>>>,
}

/// Marks a scan as running for as long as it is alive.
struct ScanGuard {
    inner: Arc<ScannerInner>,
}

impl ScanGuard {
    fn acquire(inner: &Arc<ScannerInner>) -> Option<Self> {
        inner
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanGuard {
                inner: inner.clone(),
            })
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.inner.scanning.store(false, Ordering::Release);
    }
}

/**
Finds devices on the local network.

A scan sends one search probe and collects replies for a time window. At most
one scan runs at a time. Independently, the scanner can listen for the
announcements devices multicast when they come online or change state.
 */
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    pub fn new(config: ScannerConfig, runtime: Handle) -> Self {
        Scanner {
            inner: Arc::new(ScannerInner {
                config,
                runtime,
                scanning: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                listener_task: Mutex::new(None),
                last_discovery: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.inner.config
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::Acquire)
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.listener_task)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// When the last scan finished without an error.
    pub fn last_discovery(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_discovery)
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.inner.cancel).clone()
    }

    /**
    Scans for devices for `window`, or the configured default timeout.

    Returns `None` without touching the running scan when another scan is in
    progress. Socket failures do not abort with an error: the returned map
    carries the error next to the devices found before the failure. Devices
    that answer more than once keep their last answer.
     */
    pub async fn discover(&self, window: Option<Duration>) -> Option<DeviceMap> {
        let Some(guard) = ScanGuard::acquire(&self.inner) else {
            debug!("scan already in progress");
            return None;
        };
        Some(self.run_scan(guard, window, self.cancel_token()).await)
    }

    async fn run_scan(
        &self,
        _guard: ScanGuard,
        window: Option<Duration>,
        cancel: CancellationToken,
    ) -> DeviceMap {
        let window = window.unwrap_or_else(|| self.inner.config.default_timeout());
        let mut devices = DeviceMap::new();
        info!("discovery started, window {:?}", window);
        match self.collect_replies(window, &cancel, &mut devices).await {
            Ok(()) => {
                *lock(&self.inner.last_discovery) = Some(Utc::now());
                info!("discovery finished, {} devices", devices.len());
            }
            Err(e) => {
                error!("discovery failed: {}", e);
                devices.set_error(e.into());
            }
        }
        devices
    }

    async fn collect_replies(
        &self,
        window: Duration,
        cancel: &CancellationToken,
        devices: &mut DeviceMap,
    ) -> io::Result<()> {
        let target = self.inner.config.discovery_target;
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(SEARCH_MESSAGE.as_bytes(), target).await?;
        debug!("search probe sent to {}", target);

        let mut buffer = vec![0; self.inner.config.buffer_size];
        let timeout_end = Instant::now() + window;

        loop {
            let now = Instant::now();
            if now >= timeout_end {
                break;
            }
            let remaining_time = timeout_end - now;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("discovery cancelled");
                    break;
                }
                result = timeout(remaining_time, socket.recv_from(&mut buffer)) => result,
            };

            match result {
                Ok(Ok((number_of_bytes, source))) => {
                    match parse_advertisement(&buffer[..number_of_bytes]) {
                        Ok(mut device) => {
                            device.set_discovered(true);
                            if devices.insert(device.clone()).is_some() {
                                debug!("device {:#x} answered again", device.id());
                            } else {
                                info!("found device {}", device);
                            }
                        }
                        Err(e) => debug!("ignoring datagram from {}: {}", source, e),
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        Ok(())
    }

    /**
    Starts listening for announcements in the background.

    `listener` is called once per announcement with the announced device.
    Malformed datagrams are skipped. The multicast group is joined when the
    configured listen address is unspecified. Returns the bound address.
     */
    pub fn listen(&self, listener: Arc<dyn ScanListener>) -> Result<SocketAddr, DiscoveryError> {
        self.start_listening(listener, self.cancel_token())
    }

    /// Binds and spawns the listener unless `cancel` already fired.
    fn start_listening(
        &self,
        listener: Arc<dyn ScanListener>,
        cancel: CancellationToken,
    ) -> Result<SocketAddr, DiscoveryError> {
        let mut task = lock(&self.inner.listener_task);
        if task.as_ref().map_or(false, |task| !task.is_finished()) {
            return Err(DiscoveryError::AlreadyListening);
        }
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Stopped);
        }

        let config = &self.inner.config;
        let std_socket = std::net::UdpSocket::bind(config.listen_address)?;
        if config.listen_address.ip().is_unspecified() {
            std_socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
        }
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _runtime = self.inner.runtime.enter();
            UdpSocket::from_std(std_socket)?
        };
        let address = socket.local_addr()?;
        info!("listening for announcements on {}", address);

        *task = Some(self.inner.runtime.spawn(receive_announcements(
            socket,
            listener,
            cancel,
            config.buffer_size,
        )));
        Ok(address)
    }

    /// Cancels a running scan and stops listening. Safe to call at any time.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.cancel), CancellationToken::new());
        previous.cancel();
        if let Some(task) = lock(&self.inner.listener_task).take() {
            task.abort();
            debug!("announcement listener stopped");
        }
    }

    /**
    Runs a scan in the background, reports it through
    [`ScanListener::on_discovery_completed`] and then (re)starts listening
    with the same listener.

    Returns `false` and does nothing when a scan is already in progress. After
    [`stop`](Self::stop) the partial result is still reported but listening is
    not resumed.
     */
    pub fn rescan(&self, window: Option<Duration>, listener: Arc<dyn ScanListener>) -> bool {
        let Some(guard) = ScanGuard::acquire(&self.inner) else {
            return false;
        };
        let cancel = self.cancel_token();
        let scanner = self.clone();
        self.inner.runtime.spawn(async move {
            let devices = scanner.run_scan(guard, window, cancel.clone()).await;
            listener.on_discovery_completed(&devices);
            if cancel.is_cancelled() {
                debug!("scanner stopped, not resuming announcements");
                return;
            }
            if let Some(task) = lock(&scanner.inner.listener_task).take() {
                task.abort();
            }
            match scanner.start_listening(listener, cancel) {
                Ok(_) | Err(DiscoveryError::Stopped) => {}
                Err(e) => warn!("could not restart announcement listener: {}", e),
            }
        });
        true
    }
}

async fn receive_announcements(
    socket: UdpSocket,
    listener: Arc<dyn ScanListener>,
    cancel: CancellationToken,
    buffer_size: usize,
) {
    let mut buffer = vec![0; buffer_size];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((number_of_bytes, source)) => match parse_advertisement(&buffer[..number_of_bytes]) {
                Ok(mut device) => {
                    debug!("announcement from {}", device);
                    device.set_discovered(true);
                    listener.on_device_announced(device);
                }
                Err(e) => debug!("ignoring datagram from {}: {}", source, e),
            },
            Err(e) => {
                error!("announcement listener failed: {}", e);
                break;
            }
        }
    }
}

pub fn pretty_print_devices(devices: &DeviceMap) {
    let rows: Vec<[String; 6]> = devices
        .sorted()
        .into_iter()
        .map(|device| {
            [
                format!("{:#x}", device.id()),
                device.model().to_string(),
                device.endpoint().to_string(),
                match device.power() {
                    Some(true) => "on".to_string(),
                    Some(false) => "off".to_string(),
                    None => "-".to_string(),
                },
                device
                    .brightness()
                    .map_or_else(|| "-".to_string(), |brightness| brightness.to_string()),
                device.name().unwrap_or_default().to_string(),
            ]
        })
        .collect();

    let header = ["Device ID", "Model", "Address", "Power", "Bright", "Name"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = max(*width, cell.len());
        }
    }

    let print_row = |cells: [&str; 6]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width + 2))
            .collect();
        println!("{}", line.join(" ").trim_end());
    };

    print_row(header);
    let separator = widths.map(|width| "-".repeat(width));
    print_row(separator.each_ref().map(String::as_str));
    for row in &rows {
        print_row(row.each_ref().map(String::as_str));
    }
}
