// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest bus address allocation. One allocator per VM; mutations happen
//! under the domain's operation flow, the internal lock only guards the
//! bookkeeping map.

use std::collections::HashMap;
use std::sync::Mutex;

use vmm_types::config::PciAddress;
use vmm_types::{Result, VmmError};

/// Slots 0..=2 are owned by the board (host bridge, ISA bridge, VGA).
const FIRST_USABLE_SLOT: u8 = 3;
const LAST_SLOT: u8 = 31;

#[derive(Debug, Default)]
pub struct PciAddressAllocator {
    /// Slot -> bitmask of occupied functions.
    used: Mutex<HashMap<(u16, u8, u8), u8>>,
}

impl PciAddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a specific address, failing if the function is taken.
    pub fn reserve(&self, addr: PciAddress) -> Result<()> {
        let mut used = self.used.lock().unwrap();
        let functions = used.entry(addr.slot_key()).or_insert(0);
        let bit = 1u8 << addr.function;
        if *functions & bit != 0 {
            return Err(VmmError::InternalError(format!(
                "PCI address {} is already in use",
                addr
            )));
        }
        *functions |= bit;
        Ok(())
    }

    /// Allocate the lowest free slot on bus 0, function 0.
    pub fn assign(&self) -> Result<PciAddress> {
        let mut used = self.used.lock().unwrap();
        for slot in FIRST_USABLE_SLOT..=LAST_SLOT {
            let key = (0u16, 0u8, slot);
            let functions = used.entry(key).or_insert(0);
            if *functions == 0 {
                *functions = 1;
                return Ok(PciAddress::new(0, 0, slot, 0));
            }
        }
        Err(VmmError::InternalError(
            "no free PCI slot available".to_string(),
        ))
    }

    pub fn release(&self, addr: PciAddress) {
        let mut used = self.used.lock().unwrap();
        if let Some(functions) = used.get_mut(&addr.slot_key()) {
            *functions &= !(1u8 << addr.function);
            if *functions == 0 {
                used.remove(&addr.slot_key());
            }
        }
    }

    /// How many functions currently occupy the slot of `addr`. Hot-unplug
    /// of any function of a multifunction slot is refused.
    pub fn functions_in_slot(&self, addr: PciAddress) -> u32 {
        self.used
            .lock()
            .unwrap()
            .get(&addr.slot_key())
            .map(|f| f.count_ones())
            .unwrap_or(0)
    }

    pub fn in_use(&self, addr: PciAddress) -> bool {
        self.used
            .lock()
            .unwrap()
            .get(&addr.slot_key())
            .map(|f| f & (1u8 << addr.function) != 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_skips_board_slots() {
        let alloc = PciAddressAllocator::new();
        let addr = alloc.assign().unwrap();
        assert_eq!(addr.to_string(), "0000:00:03.0");
        let next = alloc.assign().unwrap();
        assert_eq!(next.to_string(), "0000:00:04.0");
    }

    #[test]
    fn test_reserve_conflict() {
        let alloc = PciAddressAllocator::new();
        let addr = PciAddress::new(0, 0, 4, 0);
        alloc.reserve(addr).unwrap();
        assert!(alloc.reserve(addr).is_err());
        alloc.release(addr);
        alloc.reserve(addr).unwrap();
    }

    #[test]
    fn test_multifunction_count() {
        let alloc = PciAddressAllocator::new();
        alloc.reserve(PciAddress::new(0, 0, 4, 0)).unwrap();
        alloc.reserve(PciAddress::new(0, 0, 4, 1)).unwrap();
        assert_eq!(alloc.functions_in_slot(PciAddress::new(0, 0, 4, 0)), 2);
        alloc.release(PciAddress::new(0, 0, 4, 1));
        assert_eq!(alloc.functions_in_slot(PciAddress::new(0, 0, 4, 0)), 1);
    }

    #[test]
    fn test_release_frees_for_assignment() {
        let alloc = PciAddressAllocator::new();
        let a = alloc.assign().unwrap();
        alloc.release(a);
        assert_eq!(alloc.assign().unwrap(), a);
    }
}
