use std::collections::hash_map::{Entry, Iter};
use std::collections::HashMap;

use log::{debug, info};

use crate::device::{Device, SharedDevice};
use crate::error::DiscoveryError;

/// Devices found by one discovery pass, keyed by id.
///
/// A map that carries an [`error`](Self::error) comes from a scan that failed
/// part way. The devices collected before the failure are still included.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    devices: HashMap<u64, Device>,
    error: Option<DiscoveryError>,
}

impl DeviceMap {
    pub fn new() -> Self {
        DeviceMap::default()
    }

    pub fn with_error(error: DiscoveryError) -> Self {
        DeviceMap {
            devices: HashMap::new(),
            error: Some(error),
        }
    }

    pub fn error(&self) -> Option<&DiscoveryError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: DiscoveryError) {
        self.error = Some(error);
    }

    /// Inserts a device, replacing an earlier entry with the same id.
    pub fn insert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.id(), device)
    }

    pub fn get(&self, id: u64) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, u64, Device> {
        self.devices.iter()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices ordered by id, for stable output.
    pub fn sorted(&self) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self.devices.values().collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    pub fn into_devices(self) -> HashMap<u64, Device> {
        self.devices
    }
}

impl FromIterator<Device> for DeviceMap {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut map = DeviceMap::new();
        for device in iter {
            map.insert(device);
        }
        map
    }
}

/// Result of merging a fresh snapshot into a [`DeviceRegistry`].
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The id was unknown, the snapshot was inserted.
    Inserted(SharedDevice),
    /// The id was known, its entry was updated in place.
    Updated {
        device: SharedDevice,
        props_changed: bool,
        moved: bool,
    },
}

impl MergeOutcome {
    pub fn device(&self) -> &SharedDevice {
        match self {
            MergeOutcome::Inserted(device) => device,
            MergeOutcome::Updated { device, .. } => device,
        }
    }
}

/// Long lived set of devices shared with connections.
///
/// Entries are never replaced once inserted. Fresh snapshots from discovery
/// and announcements are merged into the existing entry so a connection that
/// holds a reference to it keeps seeing updates.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u64, SharedDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Seeds the registry with devices loaded from a cache. They are neither
    /// online nor discovered.
    pub fn from_cache(cached: DeviceMap) -> Self {
        let mut registry = DeviceRegistry::new();
        for (id, mut device) in cached.into_devices() {
            device.set_online(false);
            device.set_discovered(false);
            registry.devices.insert(id, SharedDevice::new(device));
        }
        registry
    }

    pub fn get(&self, id: u64) -> Option<SharedDevice> {
        self.devices.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedDevice> {
        self.devices.values()
    }

    /**
    Merges a device that announced itself or answered a scan.

    Known ids keep their entry: properties are copied over, the address is
    re-pointed when it changed and the device is marked discovered. The online
    flag belongs to the connection and is left alone.
     */
    pub fn merge_announcement(&mut self, mut announced: Device) -> MergeOutcome {
        match self.devices.entry(announced.id()) {
            Entry::Occupied(entry) => {
                let device = entry.get().clone();
                let (props_changed, moved) = {
                    let mut current = device.write();
                    let props_changed = current.copy_live_props(&announced);
                    let moved = current.set_endpoint(announced.address(), announced.port());
                    current.set_discovered(true);
                    (props_changed, moved)
                };
                if moved {
                    info!("device {:#x} moved to {}", announced.id(), announced.endpoint());
                }
                MergeOutcome::Updated {
                    device,
                    props_changed,
                    moved,
                }
            }
            Entry::Vacant(entry) => {
                debug!("new device {}", announced);
                announced.set_discovered(true);
                let device = SharedDevice::new(announced);
                entry.insert(device.clone());
                MergeOutcome::Inserted(device)
            }
        }
    }

    /// Merges a whole discovery pass. When the pass succeeded, registered
    /// devices it did not see are marked as not discovered.
    pub fn merge_discovery(&mut self, map: &DeviceMap) -> Vec<MergeOutcome> {
        let outcomes: Vec<MergeOutcome> = map
            .devices()
            .map(|device| self.merge_announcement(device.clone()))
            .collect();
        if map.error().is_none() {
            for (id, device) in &self.devices {
                if !map.contains(*id) {
                    device.write().set_discovered(false);
                }
            }
        }
        outcomes
    }

    /// Copies the current state of every device, e.g. for storing it.
    pub fn snapshot(&self) -> DeviceMap {
        self.devices.values().map(SharedDevice::snapshot).collect()
    }
}

/// Storage for device lists between runs.
pub trait DeviceCache: Send + Sync {
    /// Returns `None` when nothing was stored yet.
    fn load_cached_devices(&self) -> anyhow::Result<Option<DeviceMap>>;

    fn store_devices(&self, devices: &DeviceMap) -> anyhow::Result<()>;
}
