//! CAM and service registries
//!
//! Both registries keep insertion order: CAM matching picks the first
//! registered slot that fits, and a full CAPMT resend walks services in the
//! order they were started. Services refer to CAMs by [`CamKey`] only, so a
//! CAM can be removed without leaving anything dangling.

use cam_protocol::Caid;

use crate::error::MuxError;
use crate::state::{AdapterId, CamKey, CamSlot, ServiceHandle, WatchedService};

/// Registered CAM slots
///
/// The same key may be registered more than once (a CAM that restarted
/// before its removal was reported); such entries coexist and receive the
/// same counter updates, each capped at its own capacity.
#[derive(Debug, Default, Clone)]
pub struct CamRegistry {
    slots: Vec<CamSlot>,
}

impl CamRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot
    pub fn register(&mut self, slot: CamSlot) -> Result<(), MuxError> {
        self.slots
            .try_reserve(1)
            .map_err(|_| MuxError::ResourceExhausted("CAM"))?;
        self.slots.push(slot);
        Ok(())
    }

    /// Remove every entry with `key`, returning how many were removed
    pub fn remove(&mut self, key: CamKey) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| s.key != key);
        before - self.slots.len()
    }

    /// Whether any entry has `key`
    pub fn contains(&self, key: CamKey) -> bool {
        self.slots.iter().any(|s| s.key == key)
    }

    /// First entry with `key`
    pub fn get(&self, key: CamKey) -> Option<&CamSlot> {
        self.slots.iter().find(|s| s.key == key)
    }

    /// Apply `f` to every entry with `key`
    ///
    /// `active_programs` never ends above an entry's `max_programs`, even when
    /// duplicates disagree on capacity.
    pub fn update(&mut self, key: CamKey, mut f: impl FnMut(&mut CamSlot)) {
        for slot in self.slots.iter_mut().filter(|s| s.key == key) {
            f(slot);
            slot.active_programs = slot.active_programs.min(slot.max_programs);
        }
    }

    /// First slot on `adapter` that can decrypt `caid`
    pub fn find_by_caid(&self, adapter: AdapterId, caid: Caid) -> Option<CamKey> {
        self.slots
            .iter()
            .find(|s| s.supports(adapter, caid))
            .map(|s| s.key)
    }

    /// Iterate in registration order
    pub fn iter(&self) -> impl Iterator<Item = &CamSlot> {
        self.slots.iter()
    }

    /// Number of entries (duplicates included)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no CAM is registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Services currently being watched
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: Vec<WatchedService>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service; returns `false` if it was already present
    pub fn start(&mut self, handle: ServiceHandle) -> Result<bool, MuxError> {
        if self.contains(handle) {
            return Ok(false);
        }
        self.services
            .try_reserve(1)
            .map_err(|_| MuxError::ResourceExhausted("service"))?;
        self.services.push(WatchedService::new(handle));
        Ok(true)
    }

    /// Remove a service
    pub fn remove(&mut self, handle: ServiceHandle) -> Option<WatchedService> {
        let pos = self.services.iter().position(|s| s.handle == handle)?;
        Some(self.services.remove(pos))
    }

    /// Whether the service is registered
    pub fn contains(&self, handle: ServiceHandle) -> bool {
        self.services.iter().any(|s| s.handle == handle)
    }

    /// Look up a service
    pub fn get(&self, handle: ServiceHandle) -> Option<&WatchedService> {
        self.services.iter().find(|s| s.handle == handle)
    }

    /// Look up a service mutably
    pub fn get_mut(&mut self, handle: ServiceHandle) -> Option<&mut WatchedService> {
        self.services.iter_mut().find(|s| s.handle == handle)
    }

    /// Drop the assignment of every service on `key`, returning their handles
    pub fn clear_assignments(&mut self, key: CamKey) -> Vec<ServiceHandle> {
        self.services
            .iter_mut()
            .filter(|s| s.is_on(key))
            .map(|s| {
                s.assigned_slot = None;
                s.handle
            })
            .collect()
    }

    /// Services assigned to `key`, in start order
    pub fn assigned_to(&self, key: CamKey) -> impl Iterator<Item = &WatchedService> {
        self.services.iter().filter(move |s| s.is_on(key))
    }

    /// Number of services assigned to `key`
    pub fn count_assigned(&self, key: CamKey) -> usize {
        self.assigned_to(key).count()
    }

    /// Iterate in start order
    pub fn iter(&self) -> impl Iterator<Item = &WatchedService> {
        self.services.iter()
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is watched
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(slot: u8) -> CamKey {
        CamKey::new(AdapterId(0), slot)
    }

    #[test]
    fn test_duplicate_registration_coexists() {
        let mut cams = CamRegistry::new();
        cams.register(CamSlot::new(key(0), &[0x0100], 2)).unwrap();
        cams.register(CamSlot::new(key(0), &[0x0500], 1)).unwrap();
        assert_eq!(cams.len(), 2);

        // Matching still sees both CAID sets
        assert_eq!(cams.find_by_caid(AdapterId(0), 0x0500), Some(key(0)));

        assert_eq!(cams.remove(key(0)), 2);
        assert!(cams.is_empty());
    }

    #[test]
    fn test_find_by_caid_respects_order_and_adapter() {
        let mut cams = CamRegistry::new();
        cams.register(CamSlot::new(CamKey::new(AdapterId(1), 0), &[0x0100], 1))
            .unwrap();
        cams.register(CamSlot::new(key(1), &[0x0100], 1)).unwrap();
        cams.register(CamSlot::new(key(2), &[0x0100], 1)).unwrap();

        assert_eq!(cams.find_by_caid(AdapterId(0), 0x0100), Some(key(1)));
        assert_eq!(cams.find_by_caid(AdapterId(3), 0x0100), None);
    }

    #[test]
    fn test_update_touches_every_duplicate() {
        let mut cams = CamRegistry::new();
        cams.register(CamSlot::new(key(0), &[0x0100], 2)).unwrap();
        cams.register(CamSlot::new(key(0), &[0x0100], 2)).unwrap();
        cams.update(key(0), |s| s.needs_full_resend = true);
        assert!(cams.iter().all(|s| s.needs_full_resend));
    }

    #[test]
    fn test_update_caps_each_duplicate_at_its_capacity() {
        let mut cams = CamRegistry::new();
        cams.register(CamSlot::new(key(0), &[0x0100], 4)).unwrap();
        cams.register(CamSlot::new(key(0), &[0x0100], 1)).unwrap();

        cams.update(key(0), |s| s.active_programs = 3);

        let active: Vec<usize> = cams.iter().map(|s| s.active_programs).collect();
        assert_eq!(active, vec![3, 1]);
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut services = ServiceRegistry::new();
        assert!(services.start(ServiceHandle(1)).unwrap());
        assert!(!services.start(ServiceHandle(1)).unwrap());
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn test_clear_assignments_keeps_services() {
        let mut services = ServiceRegistry::new();
        for h in 1..=3 {
            services.start(ServiceHandle(h)).unwrap();
        }
        services.get_mut(ServiceHandle(1)).unwrap().assigned_slot = Some(key(0));
        services.get_mut(ServiceHandle(3)).unwrap().assigned_slot = Some(key(0));
        services.get_mut(ServiceHandle(2)).unwrap().assigned_slot = Some(key(1));

        let cleared = services.clear_assignments(key(0));
        assert_eq!(cleared, vec![ServiceHandle(1), ServiceHandle(3)]);
        assert_eq!(services.len(), 3);
        assert_eq!(services.count_assigned(key(0)), 0);
        assert_eq!(services.count_assigned(key(1)), 1);
    }

    #[test]
    fn test_assigned_to_keeps_start_order() {
        let mut services = ServiceRegistry::new();
        for h in [5, 2, 9] {
            services.start(ServiceHandle(h)).unwrap();
            services.get_mut(ServiceHandle(h)).unwrap().assigned_slot = Some(key(0));
        }
        let order: Vec<u32> = services.assigned_to(key(0)).map(|s| s.handle.0).collect();
        assert_eq!(order, vec![5, 2, 9]);
    }
}
