//! # Yeelight Control Library
//!
//! `yeelight-control-lib` is a Rust library for controlling Yeelight smart lights over
//! their LAN protocol. It discovers devices on the local network, keeps persistent
//! control sessions to them, correlates replies with the commands that caused them and
//! tracks the property changes devices push on their own.
//!
//! This library is designed to be used by command-line tools or other client applications
//! that manage many lights at once.
//!
//! ## Features
//!
//! - Device discovery by multicast search, and listening for device announcements
//! - A device registry that merges fresh discovery data into long lived entries
//! - Per-device connections with listener callbacks, plus an idle-timeout variant
//! - A connection pool that creates one connection per device on demand
//!
//! ## Example
//!
//! Here is a simple example of how to discover lights and toggle each of them:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tokio::runtime::Handle;
//! use yeelight_control_lib::config::{AutoConnectionConfig, ScannerConfig};
//! use yeelight_control_lib::connection::ConnectionPool;
//! use yeelight_control_lib::device::device_map::DeviceRegistry;
//! use yeelight_control_lib::protocol::Command;
//! use yeelight_control_lib::util::discovery::Scanner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scanner = Scanner::new(ScannerConfig::default(), Handle::current());
//!     let devices = scanner
//!         .discover(Some(Duration::from_secs(2)))
//!         .await
//!         .unwrap_or_default();
//!
//!     let mut registry = DeviceRegistry::new();
//!     registry.merge_discovery(&devices);
//!
//!     let pool = ConnectionPool::auto(AutoConnectionConfig::default(), Handle::current());
//!     for device in registry.iter() {
//!         let connection = pool.get(device)?;
//!         let command = Command::toggle(connection.next_command_id());
//!         let reply = connection.send_connecting(command).await?.await?;
//!         println!("{:#x}: {:?}", device.id(), reply);
//!     }
//!
//!     pool.release();
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// Tunables for connections and the scanner, loadable from configuration files.
pub mod config;

// The `connection` module holds the per-device session state machine, the
// idle-timeout variant and the pool that hands out one connection per device.
//
// Example usage:
//
// ```
// let connection = Connection::new(&device, ConnectionConfig::default(), Handle::current());
// connection.connect_and_wait().await?;
// let reply = connection.send(Command::toggle(connection.next_command_id()))?.await?;
// ```
pub mod connection;

// Device snapshots, the registry they are merged into and the cache interface
// used to persist them between runs.
pub mod device;

pub mod error;

// Commands, replies and the codec that frames them on the control socket.
pub mod protocol;

// The discovery scanner and the listener traits shared across the library.
pub mod util;
