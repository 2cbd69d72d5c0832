//! Known devices keyed by USN uuid.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use satip_core::{Device, DeviceId};

/// Device registry shared between the listener tasks and callers.
///
/// A uuid is reserved before its description is fetched, so a second
/// announcement that arrives while the fetch is in flight is recognised as
/// a duplicate.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
    pending: RwLock<HashSet<DeviceId>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for registration. Returns false if the device is already
    /// registered or another fetch holds the claim.
    pub fn reserve(&self, id: &DeviceId) -> bool {
        if self.devices.read().contains_key(id) {
            return false;
        }
        let mut pending = self.pending.write();
        if self.devices.read().contains_key(id) {
            return false;
        }
        pending.insert(id.clone())
    }

    /// Register a device whose uuid was reserved. Returns false if the
    /// reservation was dropped in the meantime, e.g. by a byebye.
    pub fn complete(&self, device: Device) -> bool {
        let mut pending = self.pending.write();
        if !pending.remove(&device.id) {
            return false;
        }
        self.devices.write().insert(device.id.clone(), device);
        true
    }

    /// Remove a device, registered or pending. Returns whether it was known.
    pub fn remove(&self, id: &DeviceId) -> bool {
        let mut pending = self.pending.write();
        let was_pending = pending.remove(id);
        let was_registered = self.devices.write().remove(id).is_some();
        was_pending || was_registered
    }

    /// Look up by uuid, with or without the `uuid:` prefix, ignoring case.
    pub fn find(&self, uuid: &str) -> Option<Device> {
        self.devices
            .read()
            .values()
            .find(|d| d.id.matches(uuid))
            .cloned()
    }

    /// Snapshot of all registered devices, ordered by id.
    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device::new(DeviceId::new(id), "10.0.0.5", "http://10.0.0.5:8080/desc.xml")
    }

    mod reservation {
        use super::*;

        #[test]
        fn second_reserve_is_refused() {
            let registry = DeviceRegistry::new();
            let id = DeviceId::new("uuid:ABC123");
            assert!(registry.reserve(&id));
            assert!(!registry.reserve(&id));
        }

        #[test]
        fn complete_registers_once() {
            let registry = DeviceRegistry::new();
            let id = DeviceId::new("uuid:ABC123");
            assert!(registry.reserve(&id));
            assert!(registry.complete(device("uuid:ABC123")));
            assert!(!registry.complete(device("uuid:ABC123")));
            assert!(!registry.reserve(&id));
            assert_eq!(registry.all().len(), 1);
        }

        #[test]
        fn complete_without_reservation_is_refused() {
            let registry = DeviceRegistry::new();
            assert!(!registry.complete(device("uuid:ABC123")));
            assert!(registry.all().is_empty());
        }

        #[test]
        fn remove_releases_claim() {
            let registry = DeviceRegistry::new();
            let id = DeviceId::new("uuid:ABC123");
            registry.reserve(&id);
            assert!(registry.remove(&id));
            assert!(registry.reserve(&id));
        }

        #[test]
        fn remove_during_fetch_drops_registration() {
            let registry = DeviceRegistry::new();
            let id = DeviceId::new("uuid:ABC123");
            registry.reserve(&id);
            assert!(registry.remove(&id));
            assert!(!registry.complete(device("uuid:ABC123")));
            assert!(registry.all().is_empty());
        }
    }

    mod lookup {
        use super::*;

        #[test]
        fn find_ignores_prefix_and_case() {
            let registry = DeviceRegistry::new();
            let id = DeviceId::new("uuid:ABC123");
            registry.reserve(&id);
            registry.complete(device("uuid:ABC123"));

            assert!(registry.find("uuid:ABC123").is_some());
            assert!(registry.find("abc123").is_some());
            assert!(registry.find("uuid:OTHER").is_none());
        }

        #[test]
        fn all_is_sorted_snapshot() {
            let registry = DeviceRegistry::new();
            for id in ["uuid:B", "uuid:A"] {
                registry.reserve(&DeviceId::new(id));
                registry.complete(device(id));
            }
            let ids: Vec<_> = registry.all().into_iter().map(|d| d.id.0).collect();
            assert_eq!(ids, vec!["uuid:A", "uuid:B"]);
        }

        #[test]
        fn remove_unknown_is_false() {
            let registry = DeviceRegistry::new();
            assert!(!registry.remove(&DeviceId::new("uuid:X")));
        }
    }
}
