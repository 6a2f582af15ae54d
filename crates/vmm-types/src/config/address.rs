// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A guest bus address assigned to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum DeviceAddress {
    Pci(PciAddress),
    Ccw(CcwAddress),
    VirtioS390,
    Usb(UsbPort),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    #[serde(default)]
    pub multifunction: bool,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Self {
        PciAddress {
            domain,
            bus,
            slot,
            function,
            multifunction: false,
        }
    }

    /// The slot identity, ignoring the function: two addresses on the same
    /// slot may host functions of one multifunction device.
    pub fn slot_key(&self) -> (u16, u8, u8) {
        (self.domain, self.bus, self.slot)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = || -> Option<PciAddress> {
            let (rest, function) = s.rsplit_once('.')?;
            let mut it = rest.split(':');
            let domain = u16::from_str_radix(it.next()?, 16).ok()?;
            let bus = u8::from_str_radix(it.next()?, 16).ok()?;
            let slot = u8::from_str_radix(it.next()?, 16).ok()?;
            if it.next().is_some() {
                return None;
            }
            Some(PciAddress::new(
                domain,
                bus,
                slot,
                u8::from_str_radix(function, 16).ok()?,
            ))
        };
        parse().ok_or_else(|| format!("malformed PCI address: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CcwAddress {
    pub cssid: u8,
    pub ssid: u8,
    pub devno: u16,
}

impl fmt::Display for CcwAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}.{:04x}", self.cssid, self.ssid, self.devno)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbPort {
    pub bus: u8,
    pub port: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_display_and_parse() {
        let addr = PciAddress::new(0, 0, 4, 0);
        assert_eq!(addr.to_string(), "0000:00:04.0");
        let parsed: PciAddress = "0000:00:04.0".parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("0000:00:zz.0".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_slot_key_ignores_function() {
        let f0 = PciAddress::new(0, 0, 4, 0);
        let f1 = PciAddress::new(0, 0, 4, 1);
        assert_eq!(f0.slot_key(), f1.slot_key());
    }
}
