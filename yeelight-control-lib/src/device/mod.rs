use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use derivative::Derivative;
use palette::{Hsv, Srgb};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_DEVICE_PORT;
use crate::error::ProtocolError;
use crate::protocol::command::unpack_rgb;
use crate::protocol::method::{Effect, Method, MethodSet};
use crate::protocol::props::{ColorMode, Prop, PropMap};

pub mod device_map;

/// Product line of a device, as reported by the `model` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceModel {
    Mono,
    Color,
    Stripe,
    Ceiling,
    Bslamp,
    Other(String),
}

impl DeviceModel {
    pub fn name(&self) -> &str {
        match self {
            DeviceModel::Mono => "mono",
            DeviceModel::Color => "color",
            DeviceModel::Stripe => "stripe",
            DeviceModel::Ceiling => "ceiling",
            DeviceModel::Bslamp => "bslamp",
            DeviceModel::Other(name) => name,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            DeviceModel::Mono => "White bulb",
            DeviceModel::Color => "RGB bulb",
            DeviceModel::Stripe => "LED stripe",
            DeviceModel::Ceiling => "Ceiling light",
            DeviceModel::Bslamp => "Bedside lamp",
            DeviceModel::Other(name) => name,
        }
    }
}

impl From<String> for DeviceModel {
    fn from(name: String) -> Self {
        match name.as_str() {
            "mono" => DeviceModel::Mono,
            "color" => DeviceModel::Color,
            "stripe" => DeviceModel::Stripe,
            "ceiling" => DeviceModel::Ceiling,
            "bslamp" => DeviceModel::Bslamp,
            _ => DeviceModel::Other(name),
        }
    }
}

impl From<DeviceModel> for String {
    fn from(model: DeviceModel) -> Self {
        model.name().to_string()
    }
}

impl Display for DeviceModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Parses a device id as found in advertisements: `0x` prefixed hex or
/// decimal.
pub fn parse_device_id(raw: &str) -> Result<u64, ProtocolError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|_| ProtocolError::InvalidValue {
        field: "id",
        value: raw.to_string(),
    })
}

/// Snapshot of a single light.
///
/// Two devices are equal when their ids are equal; every other field is state
/// that changes over the lifetime of the device.
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug, PartialEq, Eq, Hash)]
pub struct Device {
    id: u64,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    model: DeviceModel,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    address: IpAddr,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    port: u16,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(default)]
    fw_ver: u32,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(default)]
    support: MethodSet,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(default)]
    props: PropMap,

    /// Transition used by commands built without an explicit effect.
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(skip)]
    default_effect: Effect,

    /// Whether a live connection to the device exists.
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(skip)]
    online: bool,

    /// Whether the device was seen by the current scan or announced itself
    /// since.
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    #[serde(skip)]
    discovered: bool,
}

impl Device {
    pub fn new(id: u64, model: DeviceModel, address: IpAddr, port: u16) -> Self {
        Device {
            id,
            model,
            address,
            port,
            fw_ver: 0,
            support: MethodSet::empty(),
            props: PropMap::new(),
            default_effect: Effect::DEFAULT,
            online: false,
            discovered: false,
        }
    }

    /**
    Builds a device from the headers of a discovery reply or an announcement.

    Header names must already be lowercase. `id` and `location` are required,
    every other header is optional and unknown headers are ignored.
     */
    pub fn from_headers(headers: &HashMap<String, String>) -> Result<Self, ProtocolError> {
        let id = headers
            .get("id")
            .ok_or(ProtocolError::MissingField("id"))
            .and_then(|id| parse_device_id(id))?;
        let location = headers
            .get("location")
            .ok_or(ProtocolError::MissingField("location"))?;
        let (address, port) = parse_location(location)?;

        let model = headers
            .get("model")
            .map(|model| DeviceModel::from(model.clone()))
            .unwrap_or_else(|| DeviceModel::Other(String::new()));
        let mut device = Device::new(id, model, address, port);
        device.fw_ver = headers
            .get("fw_ver")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        device.support = headers
            .get("support")
            .map(|support| MethodSet::parse(support))
            .unwrap_or_default();
        device.props = PropMap::from_pairs(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(device)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn fw_ver(&self) -> u32 {
        self.fw_ver
    }

    pub fn support(&self) -> MethodSet {
        self.support
    }

    pub fn supports(&self, method: &Method) -> bool {
        self.support.contains(method)
    }

    pub fn props(&self) -> &PropMap {
        &self.props
    }

    pub fn default_effect(&self) -> Effect {
        self.default_effect
    }

    pub fn set_default_effect(&mut self, effect: Effect) {
        self.default_effect = effect;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    pub fn set_discovered(&mut self, discovered: bool) {
        self.discovered = discovered;
    }

    /// Points the device at a new address. Returns whether it moved.
    pub fn set_endpoint(&mut self, address: IpAddr, port: u16) -> bool {
        if self.address == address && self.port == port {
            return false;
        }
        self.address = address;
        self.port = port;
        true
    }

    /// Applies a property update. Returns whether anything changed.
    pub fn apply_props(&mut self, props: &PropMap) -> bool {
        self.props.merge(props)
    }

    /// Copies the state reported by a fresher snapshot of the same device.
    pub fn copy_live_props(&mut self, other: &Device) -> bool {
        let mut changed = self.props.merge(&other.props);
        if other.fw_ver != 0 && other.fw_ver != self.fw_ver {
            self.fw_ver = other.fw_ver;
            changed = true;
        }
        if !other.support.is_empty() && other.support != self.support {
            self.support = other.support;
            changed = true;
        }
        changed
    }

    pub fn power(&self) -> Option<bool> {
        self.props.get_bool(Prop::Power)
    }

    pub fn brightness(&self) -> Option<u8> {
        self.props
            .get_int(Prop::Bright)
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn color_temperature(&self) -> Option<u16> {
        self.props.get_int(Prop::Ct).and_then(|v| u16::try_from(v).ok())
    }

    pub fn rgb(&self) -> Option<u32> {
        self.props.get_int(Prop::Rgb).and_then(|v| u32::try_from(v).ok())
    }

    pub fn color(&self) -> Option<Srgb<u8>> {
        self.rgb().map(unpack_rgb)
    }

    pub fn hue(&self) -> Option<u16> {
        self.props.get_int(Prop::Hue).and_then(|v| u16::try_from(v).ok())
    }

    pub fn saturation(&self) -> Option<u8> {
        self.props.get_int(Prop::Sat).and_then(|v| u8::try_from(v).ok())
    }

    /// Hue, saturation and brightness as a color value.
    pub fn hsv(&self) -> Option<Hsv> {
        let hue = self.hue()?;
        let saturation = self.saturation()?;
        let value = self.brightness().unwrap_or(100);
        Some(Hsv::new(
            f32::from(hue),
            f32::from(saturation) / 100.0,
            f32::from(value) / 100.0,
        ))
    }

    pub fn color_mode(&self) -> ColorMode {
        self.props
            .color_mode(Prop::ColorMode)
            .unwrap_or(ColorMode::Unknown)
    }

    pub fn is_flowing(&self) -> bool {
        self.props.get_int(Prop::Flowing) == Some(1)
    }

    pub fn name(&self) -> Option<&str> {
        self.props.get_text(Prop::Name).filter(|name| !name.is_empty())
    }

    pub fn background_power(&self) -> Option<bool> {
        self.props.get_bool(Prop::BgPower)
    }

    pub fn background_brightness(&self) -> Option<u8> {
        self.props
            .get_int(Prop::BgBright)
            .and_then(|v| u8::try_from(v).ok())
    }

    /// Human readable multi line summary.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "id = {:#x}\nmodel = {}\nendpoint = {}\nfw_ver = {}\nsupport = {}\nonline = {}\ndiscovered = {}\n",
            self.id,
            self.model,
            self.endpoint(),
            self.fw_ver,
            self.support,
            self.online,
            self.discovered
        );
        let mut props: Vec<_> = self.props.iter().collect();
        props.sort_by_key(|(prop, _)| **prop);
        for (prop, value) in props {
            out.push_str(&format!("{} = {}\n", prop, value.to_wire()));
        }
        out
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:#x} at {}", self.model, self.id, self.endpoint())
    }
}

fn parse_location(location: &str) -> Result<(IpAddr, u16), ProtocolError> {
    let invalid = || ProtocolError::InvalidValue {
        field: "location",
        value: location.to_string(),
    };
    let host = location
        .trim()
        .split_once("//")
        .map_or(location.trim(), |(_, host)| host);
    let (address, port) = match host.rsplit_once(':') {
        Some((address, port)) => (address, port.parse::<u16>().map_err(|_| invalid())?),
        None => (host, DEFAULT_DEVICE_PORT),
    };
    let address = address.parse::<IpAddr>().map_err(|_| invalid())?;
    Ok((address, port))
}

/// A device snapshot shared between a registry and the connection talking to
/// the device.
#[derive(Debug, Clone)]
pub struct SharedDevice(Arc<RwLock<Device>>);

impl SharedDevice {
    pub fn new(device: Device) -> Self {
        SharedDevice(Arc::new(RwLock::new(device)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Device> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Device> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.read().id()
    }

    pub fn snapshot(&self) -> Device {
        self.read().clone()
    }

    pub fn downgrade(&self) -> WeakDevice {
        WeakDevice(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &SharedDevice) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Device> for SharedDevice {
    fn from(device: Device) -> Self {
        SharedDevice::new(device)
    }
}

/// Back reference from a connection to its device. Does not keep the device
/// alive.
#[derive(Debug, Clone, Default)]
pub struct WeakDevice(Weak<RwLock<Device>>);

impl WeakDevice {
    pub fn upgrade(&self) -> Option<SharedDevice> {
        self.0.upgrade().map(SharedDevice)
    }
}
