// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! NIC hotplug and live update.
//!
//! Updates are classified against a closed list of mutable attributes;
//! anything outside it means a full reconnect, which cannot happen on a
//! live guest and is refused.

use serde_json::json;
use vmm_types::config::{DeviceAddress, NetConfig};
use vmm_types::{Result, VmmError};

use crate::capabilities::CapFlags;
use crate::domain::Domain;
use crate::hotplug::{check_multifunction, DEVICE_REMOVAL_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetUpdateAction {
    LinkState,
    BridgeChange,
    FilterChange,
    BandwidthChange,
    FullReconnect,
}

/// Compare old and new configuration and name the transformations needed.
/// A single FullReconnect swallows everything else.
pub fn classify_net_update(old: &NetConfig, new: &NetConfig) -> Vec<NetUpdateAction> {
    if old.mac != new.mac || old.kind != new.kind || old.model != new.model {
        return vec![NetUpdateAction::FullReconnect];
    }

    let mut actions = vec![];
    if old.link_active != new.link_active {
        actions.push(NetUpdateAction::LinkState);
    }
    if old.bridge != new.bridge {
        actions.push(NetUpdateAction::BridgeChange);
    }
    if old.filter != new.filter {
        actions.push(NetUpdateAction::FilterChange);
    }
    if old.bandwidth != new.bandwidth {
        actions.push(NetUpdateAction::BandwidthChange);
    }
    actions
}

/// Apply a live NIC update.
pub async fn update_net(domain: &Domain, new: NetConfig) -> Result<()> {
    let (old, alias) = {
        let inner = domain.lock().await;
        inner.require_active()?;
        let old = inner.def.net_by_mac(&new.mac).ok_or_else(|| {
            VmmError::OperationInvalid(format!(
                "no network interface with MAC {}",
                new.mac
            ))
        })?;
        (old.clone(), old.alias.clone())
    };

    let actions = classify_net_update(&old, &new);
    if actions.contains(&NetUpdateAction::FullReconnect) {
        return Err(VmmError::OperationUnsupported(
            "changing device type or MAC needs a full reconnect, which cannot be done live"
                .to_string(),
        ));
    }

    for action in &actions {
        match action {
            NetUpdateAction::LinkState => {
                let alias = alias.clone().ok_or_else(|| {
                    VmmError::InternalError("interface has no device alias".to_string())
                })?;
                let mon = domain.enter_monitor().await?;
                let set = mon
                    .set_link(&alias, new.link_active)
                    .await
                    .map_err(VmmError::from);
                domain.exit_monitor(mon).await?;
                set?;
            }
            NetUpdateAction::BridgeChange | NetUpdateAction::FilterChange
            | NetUpdateAction::BandwidthChange => {
                // Host-side only; the external bridge/filter/bandwidth
                // services pick the new values up from the definition.
                debug!(sl!(), "applying host-side NIC change"; "kind" => format!("{:?}", action));
            }
            NetUpdateAction::FullReconnect => unreachable!(),
        }
    }

    let mut inner = domain.lock().await;
    if let Some(net) = inner.def.nets.iter_mut().find(|n| n.mac == new.mac) {
        let preserved_alias = net.alias.clone();
        let preserved_address = net.address;
        *net = new;
        net.alias = preserved_alias;
        net.address = preserved_address;
    }
    drop(inner);
    let _ = domain.save_status().await;
    Ok(())
}

/// Hot-add a NIC: host netdev first, then the guest device.
pub async fn attach_net(domain: &Domain, mut net: NetConfig) -> Result<()> {
    let netdev_cap = {
        let inner = domain.lock().await;
        inner.require_active()?;
        if inner.def.net_by_mac(&net.mac).is_some() {
            return Err(VmmError::OperationFailed(format!(
                "interface with MAC {} already exists",
                net.mac
            )));
        }
        inner.caps.contains(CapFlags::NETDEV)
    };
    if !netdev_cap {
        return Err(VmmError::OperationUnsupported(
            "this hypervisor cannot hot-add network backends".to_string(),
        ));
    }

    let index = domain.lock().await.def.nets.len();
    let alias = format!("net{}", index);
    let netdev_id = format!("host{}", alias);

    let addr = domain.pci.assign()?;
    net.alias = Some(alias.clone());
    net.address = Some(DeviceAddress::Pci(addr));

    let netdev = json!({
        "type": "tap",
        "id": netdev_id,
        "ifname": net.ifname,
    });
    let device = json!({
        "driver": net.model.clone().unwrap_or_else(|| "virtio-net-pci".to_string()),
        "netdev": netdev_id,
        "id": alias,
        "mac": net.mac,
        "bus": "pci.0",
        "addr": format!("0x{:x}", addr.slot),
    });

    let result = async {
        let mon = domain.enter_monitor().await?;
        let outcome = async {
            mon.netdev_add(netdev).await.map_err(VmmError::from)?;
            if let Err(device_err) = mon.device_add(device).await {
                if let Err(del_err) = mon.netdev_del(&netdev_id).await {
                    warn!(sl!(), "cannot roll back netdev after device_add failure";
                        "netdev" => &netdev_id, "error" => del_err.to_string());
                }
                return Err(VmmError::from(device_err));
            }
            Ok(())
        }
        .await;
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    if let Err(e) = result {
        domain.pci.release(addr);
        return Err(e);
    }

    {
        let mut inner = domain.lock().await;
        inner.aliases.insert(alias.clone());
        inner.def.nets.push(net);
    }
    let _ = domain.save_status().await;
    info!(sl!(), "interface attached"; "alias" => &alias, "ok" => true);
    Ok(())
}

/// Hot-remove a NIC by MAC.
pub async fn detach_net(domain: &Domain, mac: &str) -> Result<()> {
    let (alias, has_event) = {
        let inner = domain.lock().await;
        inner.require_active()?;
        let net = inner.def.net_by_mac(mac).ok_or_else(|| {
            VmmError::OperationInvalid(format!("no network interface with MAC {}", mac))
        })?;
        let alias = net.alias.clone().ok_or_else(|| {
            VmmError::InternalError("interface has no device alias".to_string())
        })?;
        check_multifunction(domain, net.address.as_ref(), mac)?;
        (alias, inner.caps.contains(CapFlags::DEVICE_DELETED_EVENT))
    };

    if has_event {
        domain.removal_start(&alias);
    }

    let result = async {
        let mon = domain.enter_monitor().await?;
        let outcome = mon.device_del(&alias).await.map_err(VmmError::from);
        domain.exit_monitor(mon).await?;
        outcome
    }
    .await;

    if let Err(e) = result {
        if has_event {
            domain.removal_cancel();
        }
        return Err(e);
    }

    if has_event && !domain.removal_wait(DEVICE_REMOVAL_TIMEOUT).await {
        info!(sl!(), "interface detach not finished in time, deferring cleanup";
            "alias" => &alias);
        return Ok(());
    }

    complete_net_detach(domain, mac).await
}

pub(crate) async fn complete_net_detach(domain: &Domain, mac: &str) -> Result<()> {
    let net = {
        let mut inner = domain.lock().await;
        let index = match inner.def.nets.iter().position(|n| n.mac == mac) {
            Some(index) => index,
            None => return Ok(()),
        };
        let net = inner.def.nets.remove(index);
        if let Some(alias) = &net.alias {
            inner.aliases.remove(alias);
        }
        net
    };

    if let Some(alias) = &net.alias {
        let netdev_id = format!("host{}", alias);
        if let Ok(mon) = domain.enter_monitor().await {
            if let Err(e) = mon.netdev_del(&netdev_id).await {
                debug!(sl!(), "netdev_del after unplug"; "netdev" => &netdev_id,
                    "error" => e.to_string());
            }
            let _ = domain.exit_monitor(mon).await;
        }
    }

    if let Some(DeviceAddress::Pci(addr)) = net.address {
        domain.pci.release(addr);
    }
    if net.vport.is_some() {
        // Direct-mode interfaces give their fabric membership back.
        debug!(sl!(), "releasing vport association"; "mac" => mac);
    }

    let _ = domain.save_status().await;
    info!(sl!(), "interface detached"; "mac" => mac, "ok" => true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_types::config::{NetBandwidth, NetKind};

    fn net() -> NetConfig {
        NetConfig {
            kind: NetKind::Bridge,
            mac: "52:54:00:aa:bb:cc".into(),
            model: Some("virtio".into()),
            bridge: Some("br0".into()),
            ifname: Some("vnet0".into()),
            filter: None,
            bandwidth: None,
            link_active: true,
            vport: None,
            alias: Some("net0".into()),
            address: None,
        }
    }

    #[test]
    fn test_classify_detects_link_state_only() {
        let old = net();
        let mut new = net();
        new.link_active = false;
        assert_eq!(classify_net_update(&old, &new), vec![NetUpdateAction::LinkState]);
    }

    #[test]
    fn test_classify_incompatible_means_full_reconnect() {
        let old = net();
        let mut new = net();
        new.mac = "52:54:00:00:00:01".into();
        new.bridge = Some("br1".into());
        assert_eq!(
            classify_net_update(&old, &new),
            vec![NetUpdateAction::FullReconnect]
        );
    }

    #[test]
    fn test_classify_collects_compatible_changes() {
        let old = net();
        let mut new = net();
        new.bridge = Some("br1".into());
        new.filter = Some("clean-traffic".into());
        new.bandwidth = Some(NetBandwidth {
            inbound_average_kbps: Some(1000),
            ..Default::default()
        });
        let actions = classify_net_update(&old, &new);
        assert!(actions.contains(&NetUpdateAction::BridgeChange));
        assert!(actions.contains(&NetUpdateAction::FilterChange));
        assert!(actions.contains(&NetUpdateAction::BandwidthChange));
        assert!(!actions.contains(&NetUpdateAction::FullReconnect));
    }

    #[test]
    fn test_classify_no_changes() {
        let old = net();
        let new = net();
        assert!(classify_net_update(&old, &new).is_empty());
    }
}
