// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use super::DeviceAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NetKind {
    Bridge,
    Direct,
    Network,
    Ethernet,
    User,
}

/// Network-fabric membership metadata for direct (macvtap) interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VportProfile {
    pub kind: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    /// Opaque association data carried through migration cookies.
    #[serde(default)]
    pub port_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetBandwidth {
    #[serde(default)]
    pub inbound_average_kbps: Option<u64>,
    #[serde(default)]
    pub inbound_peak_kbps: Option<u64>,
    #[serde(default)]
    pub outbound_average_kbps: Option<u64>,
    #[serde(default)]
    pub outbound_peak_kbps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub kind: NetKind,
    /// Canonical lower-case MAC, the stable identity of the interface.
    pub mac: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub ifname: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub bandwidth: Option<NetBandwidth>,
    #[serde(default = "default_link_active")]
    pub link_active: bool,
    #[serde(default)]
    pub vport: Option<VportProfile>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
}

fn default_link_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_active_default() {
        let text = r#"{"kind":"bridge","mac":"52:54:00:12:34:56","bridge":"br0"}"#;
        let net: NetConfig = serde_json::from_str(text).unwrap();
        assert!(net.link_active);
        assert_eq!(net.kind, NetKind::Bridge);
    }
}
