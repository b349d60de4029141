//! Process-local virtualization of device-resident handles.
//!
//! The table is an arena of generation-tagged slots: a `LocalHandle` is an
//! (index, generation) pair, and releasing a slot bumps its generation so a
//! stale handle can never resolve to a reused slot. Well-known permanent
//! handles are pre-registered at construction with their protocol-defined
//! names (the 4-byte big-endian handle value).

use core::fmt;

use thiserror::Error;
use zeroize::Zeroize;

use crate::core::wire::constants::{handle_type, reserved};

/// Opaque process-local reference to a device-resident or well-known object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle {
    index: u32,
    generation: u32,
}

impl LocalHandle {
    const fn well_known(index: u32) -> Self {
        LocalHandle { index, generation: 0 }
    }
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalHandle({}:{})", self.index, self.generation)
    }
}

/// Classification of a device handle value by its type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleClass {
    Transient,
    Persistent,
    Permanent,
    Session,
}

/// Classify a raw device handle by its top byte.
#[must_use]
pub fn classify(device_handle: u32) -> Option<HandleClass> {
    #[allow(clippy::cast_possible_truncation)]
    let ty = (device_handle >> 24) as u8;
    match ty {
        handle_type::TRANSIENT => Some(HandleClass::Transient),
        handle_type::PERSISTENT => Some(HandleClass::Persistent),
        handle_type::PERMANENT => Some(HandleClass::Permanent),
        handle_type::HMAC_SESSION | handle_type::POLICY_SESSION => Some(HandleClass::Session),
        _ => None,
    }
}

/// Errors from handle-table operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("unknown or released handle")]
    Unknown,
    #[error("device handle {0:#010x} is already mapped by a live local handle")]
    Aliased(u32),
    #[error("device handle {0:#010x} has no recognized handle type")]
    Unclassified(u32),
    #[error("well-known handles cannot be released or rebound")]
    Reserved,
    #[error("object name is already bound and cannot change")]
    NameBound,
}

/// Resolved view of one live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedHandle<'a> {
    pub device: u32,
    /// Name digest binding the handle to its public data; for permanent
    /// handles this is the 4-byte big-endian handle value.
    pub name: &'a [u8],
    pub class: HandleClass,
}

#[derive(Debug)]
struct Slot {
    device: u32,
    name: Vec<u8>,
    class: HandleClass,
    generation: u32,
    live: bool,
}

/// Exclusive owner of the local-handle -> device-handle mapping.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleTable {
    pub const OWNER: LocalHandle = LocalHandle::well_known(0);
    pub const NULL_HIERARCHY: LocalHandle = LocalHandle::well_known(1);
    pub const PLATFORM: LocalHandle = LocalHandle::well_known(2);
    pub const ENDORSEMENT: LocalHandle = LocalHandle::well_known(3);
    pub const LOCKOUT: LocalHandle = LocalHandle::well_known(4);

    const WELL_KNOWN: [u32; 5] = [
        reserved::RH_OWNER,
        reserved::RH_NULL,
        reserved::RH_PLATFORM,
        reserved::RH_ENDORSEMENT,
        reserved::RH_LOCKOUT,
    ];

    /// Create a table with the permanent hierarchy handles pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let slots = Self::WELL_KNOWN
            .iter()
            .map(|&device| Slot {
                device,
                name: device.to_be_bytes().to_vec(),
                class: HandleClass::Permanent,
                generation: 0,
                live: true,
            })
            .collect();
        HandleTable {
            slots,
            free: Vec::new(),
        }
    }

    fn is_well_known(handle: LocalHandle) -> bool {
        (handle.index as usize) < Self::WELL_KNOWN.len()
    }

    /// Register a device-allocated handle and return its local handle.
    ///
    /// `name` may be empty for objects whose name digest is not yet known
    /// (it can be bound exactly once via [`HandleTable::bind_name`]).
    ///
    /// # Errors
    /// * `HandleError::Aliased` if a live local handle already maps the same
    ///   device handle; two locals must never alias one live device object.
    /// * `HandleError::Unclassified` if the device handle value has no
    ///   recognized type prefix.
    pub fn allocate(&mut self, device: u32, name: Vec<u8>) -> Result<LocalHandle, HandleError> {
        let class = classify(device).ok_or(HandleError::Unclassified(device))?;
        if self.slots.iter().any(|s| s.live && s.device == device) {
            return Err(HandleError::Aliased(device));
        }
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.device = device;
            slot.name = name;
            slot.class = class;
            slot.live = true;
            return Ok(LocalHandle {
                index,
                generation: slot.generation,
            });
        }
        let index = u32::try_from(self.slots.len()).map_err(|_| HandleError::Unknown)?;
        self.slots.push(Slot {
            device,
            name,
            class,
            generation: 0,
            live: true,
        });
        Ok(LocalHandle {
            index,
            generation: 0,
        })
    }

    /// Look up a live handle.
    ///
    /// # Errors
    /// `HandleError::Unknown` for released, stale-generation or never-issued
    /// handles; stale data is never returned.
    pub fn resolve(&self, handle: LocalHandle) -> Result<ResolvedHandle<'_>, HandleError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(HandleError::Unknown)?;
        if !slot.live || slot.generation != handle.generation {
            return Err(HandleError::Unknown);
        }
        Ok(ResolvedHandle {
            device: slot.device,
            name: &slot.name,
            class: slot.class,
        })
    }

    /// Bind the name digest of a handle allocated without one.
    ///
    /// # Errors
    /// `HandleError::NameBound` if a non-empty name is already present: a
    /// handle's name, once bound, never changes.
    pub fn bind_name(&mut self, handle: LocalHandle, name: Vec<u8>) -> Result<(), HandleError> {
        let slot = self.live_slot_mut(handle)?;
        if !slot.name.is_empty() {
            return Err(HandleError::NameBound);
        }
        slot.name = name;
        Ok(())
    }

    /// Repoint a live handle at a new device handle (object relocation).
    ///
    /// The handle class follows the new device value. The name is preserved,
    /// since relocation does not change an object's public area.
    ///
    /// # Errors
    /// * `HandleError::Reserved` for well-known entries.
    /// * `HandleError::Aliased` if another live handle maps `new_device`.
    pub fn rebind(&mut self, handle: LocalHandle, new_device: u32) -> Result<(), HandleError> {
        if Self::is_well_known(handle) {
            return Err(HandleError::Reserved);
        }
        let class = classify(new_device).ok_or(HandleError::Unclassified(new_device))?;
        if self
            .slots
            .iter()
            .enumerate()
            .any(|(i, s)| s.live && s.device == new_device && i as u32 != handle.index)
        {
            return Err(HandleError::Aliased(new_device));
        }
        let slot = self.live_slot_mut(handle)?;
        slot.device = new_device;
        slot.class = class;
        Ok(())
    }

    /// Drop a handle and zero its cached metadata.
    ///
    /// The slot's generation is bumped immediately, so the released handle
    /// (and any copy of it) fails to resolve from this point on, even before
    /// the slot index is reused.
    ///
    /// # Errors
    /// * `HandleError::Reserved` for well-known entries.
    /// * `HandleError::Unknown` if the handle is not live.
    pub fn release(&mut self, handle: LocalHandle) -> Result<(), HandleError> {
        if Self::is_well_known(handle) {
            return Err(HandleError::Reserved);
        }
        let slot = self.live_slot_mut(handle)?;
        slot.name.zeroize();
        slot.name.clear();
        slot.device = 0;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    /// Number of live entries (including the well-known ones).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    fn live_slot_mut(&mut self, handle: LocalHandle) -> Result<&mut Slot, HandleError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(HandleError::Unknown)?;
        if !slot.live || slot.generation != handle.generation {
            return Err(HandleError::Unknown);
        }
        Ok(slot)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_handles_resolve_with_value_names() {
        let t = HandleTable::new();
        let owner = t.resolve(HandleTable::OWNER).unwrap();
        assert_eq!(owner.device, reserved::RH_OWNER);
        assert_eq!(owner.name, reserved::RH_OWNER.to_be_bytes());
        assert_eq!(owner.class, HandleClass::Permanent);
    }

    #[test]
    fn allocate_resolve_release_cycle() {
        let mut t = HandleTable::new();
        let h = t.allocate(0x8000_0001, vec![0xAB; 34]).unwrap();
        let r = t.resolve(h).unwrap();
        assert_eq!(r.device, 0x8000_0001);
        assert_eq!(r.class, HandleClass::Transient);

        t.release(h).unwrap();
        assert_eq!(t.resolve(h).unwrap_err(), HandleError::Unknown);
        assert_eq!(t.release(h).unwrap_err(), HandleError::Unknown);
    }

    #[test]
    fn released_slot_reuse_does_not_resurrect_old_handle() {
        let mut t = HandleTable::new();
        let old = t.allocate(0x8000_0001, Vec::new()).unwrap();
        t.release(old).unwrap();
        let new = t.allocate(0x8000_0002, Vec::new()).unwrap();
        // Same slot index, different generation.
        assert_ne!(old, new);
        assert_eq!(t.resolve(old).unwrap_err(), HandleError::Unknown);
        assert_eq!(t.resolve(new).unwrap().device, 0x8000_0002);
    }

    #[test]
    fn no_two_live_handles_alias_one_device_handle() {
        let mut t = HandleTable::new();
        let _a = t.allocate(0x8000_0001, Vec::new()).unwrap();
        let err = t.allocate(0x8000_0001, Vec::new()).unwrap_err();
        assert_eq!(err, HandleError::Aliased(0x8000_0001));
    }

    #[test]
    fn fresh_allocations_never_equal_live_handles() {
        let mut t = HandleTable::new();
        let mut live = vec![
            t.allocate(0x8000_0001, Vec::new()).unwrap(),
            t.allocate(0x8000_0002, Vec::new()).unwrap(),
        ];
        t.release(live[0]).unwrap();
        let fresh = t.allocate(0x8000_0003, Vec::new()).unwrap();
        live.remove(0);
        assert!(live.iter().all(|h| *h != fresh));
    }

    #[test]
    fn rebind_relocates_and_reclassifies() {
        let mut t = HandleTable::new();
        let h = t.allocate(0x8000_0001, vec![0x01]).unwrap();
        t.rebind(h, 0x8100_0000).unwrap();
        let r = t.resolve(h).unwrap();
        assert_eq!(r.device, 0x8100_0000);
        assert_eq!(r.class, HandleClass::Persistent);
        assert_eq!(r.name, &[0x01], "name survives relocation");
    }

    #[test]
    fn rebind_alias_check_spares_self() {
        let mut t = HandleTable::new();
        let h = t.allocate(0x8000_0001, Vec::new()).unwrap();
        t.rebind(h, 0x8000_0001).unwrap();
        let other = t.allocate(0x8000_0002, Vec::new()).unwrap();
        assert_eq!(
            t.rebind(other, 0x8000_0001).unwrap_err(),
            HandleError::Aliased(0x8000_0001)
        );
    }

    #[test]
    fn well_known_entries_cannot_be_released_or_rebound() {
        let mut t = HandleTable::new();
        assert_eq!(t.release(HandleTable::OWNER).unwrap_err(), HandleError::Reserved);
        assert_eq!(
            t.rebind(HandleTable::PLATFORM, 0x8000_0001).unwrap_err(),
            HandleError::Reserved
        );
    }

    #[test]
    fn name_binds_exactly_once() {
        let mut t = HandleTable::new();
        let h = t.allocate(0x8000_0001, Vec::new()).unwrap();
        t.bind_name(h, vec![0xCD; 34]).unwrap();
        assert_eq!(t.resolve(h).unwrap().name, &[0xCD; 34][..]);
        assert_eq!(
            t.bind_name(h, vec![0xEF; 34]).unwrap_err(),
            HandleError::NameBound
        );
    }

    #[test]
    fn unclassified_device_handle_rejected() {
        let mut t = HandleTable::new();
        let err = t.allocate(0x1200_0000, Vec::new()).unwrap_err();
        assert_eq!(err, HandleError::Unclassified(0x1200_0000));
    }
}
