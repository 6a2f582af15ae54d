// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Typed wrappers around the command set the daemon consumes.

use std::os::unix::io::RawFd;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::channel::QmpChannel;
use crate::error::MonitorError;

type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub status: String,
    pub running: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub qemu: VersionTriple,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuInfo {
    #[serde(rename = "CPU", default)]
    pub cpu: Option<u32>,
    #[serde(rename = "thread_id")]
    pub thread_id: i32,
    #[serde(rename = "qom_path", default)]
    pub qom_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IoThreadInfo {
    pub id: String,
    #[serde(rename = "thread-id")]
    pub thread_id: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrateRamInfo {
    pub total: u64,
    pub remaining: u64,
    pub transferred: u64,
    #[serde(default)]
    pub duplicate: u64,
    #[serde(default)]
    pub normal: u64,
    #[serde(rename = "normal-bytes", default)]
    pub normal_bytes: u64,
    #[serde(default)]
    pub mbps: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrateDiskInfo {
    pub total: u64,
    pub remaining: u64,
    pub transferred: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrateXbzrleInfo {
    #[serde(rename = "cache-size", default)]
    pub cache_size: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub pages: u64,
    #[serde(rename = "cache-miss", default)]
    pub cache_miss: u64,
    #[serde(default)]
    pub overflow: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrateInfo {
    #[serde(default = "default_migrate_status")]
    pub status: String,
    #[serde(default)]
    pub ram: Option<MigrateRamInfo>,
    #[serde(default)]
    pub disk: Option<MigrateDiskInfo>,
    #[serde(rename = "xbzrle-cache", default)]
    pub xbzrle_cache: Option<MigrateXbzrleInfo>,
    #[serde(rename = "total-time", default)]
    pub total_time_ms: u64,
    #[serde(rename = "downtime", default)]
    pub downtime_ms: Option<u64>,
    #[serde(rename = "setup-time", default)]
    pub setup_time_ms: Option<u64>,
}

fn default_migrate_status() -> String {
    "inactive".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockJobInfo {
    #[serde(rename = "type")]
    pub job_type: String,
    pub device: String,
    pub len: u64,
    pub offset: u64,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub speed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpiceMigrationInfo {
    #[serde(default)]
    pub migrated: bool,
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| MonitorError::Protocol(format!("unexpected reply shape: {}", e)))
}

impl QmpChannel {
    // ------------------------------------------------------------------
    // VM lifecycle
    // ------------------------------------------------------------------

    pub async fn cont(&self) -> Result<()> {
        self.send("cont", None, None).await.map(|_| ())
    }

    /// Stop all vCPUs ("stop" on the wire; named to avoid clashing with
    /// stopping the whole VM).
    pub async fn stop_cpus(&self) -> Result<()> {
        self.send("stop", None, None).await.map(|_| ())
    }

    pub async fn quit(&self) -> Result<()> {
        self.send("quit", None, None).await.map(|_| ())
    }

    pub async fn system_reset(&self) -> Result<()> {
        self.send("system_reset", None, None).await.map(|_| ())
    }

    pub async fn system_powerdown(&self) -> Result<()> {
        self.send("system_powerdown", None, None).await.map(|_| ())
    }

    pub async fn system_wakeup(&self) -> Result<()> {
        self.send("system_wakeup", None, None).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Device hotplug
    // ------------------------------------------------------------------

    pub async fn device_add(&self, props: Value) -> Result<()> {
        self.send("device_add", Some(props), None).await.map(|_| ())
    }

    pub async fn device_del(&self, id: &str) -> Result<()> {
        self.send("device_del", Some(json!({ "id": id })), None)
            .await
            .map(|_| ())
    }

    pub async fn drive_add(&self, props: Value) -> Result<()> {
        self.send("drive_add", Some(props), None).await.map(|_| ())
    }

    pub async fn drive_del(&self, id: &str) -> Result<()> {
        self.send("drive_del", Some(json!({ "id": id })), None)
            .await
            .map(|_| ())
    }

    pub async fn object_add(&self, qom_type: &str, id: &str, props: Value) -> Result<()> {
        let mut args = json!({ "qom-type": qom_type, "id": id });
        if let (Some(args_map), Some(props_map)) = (args.as_object_mut(), props.as_object()) {
            for (k, v) in props_map {
                args_map.insert(k.clone(), v.clone());
            }
        }
        self.send("object_add", Some(args), None).await.map(|_| ())
    }

    pub async fn object_del(&self, id: &str) -> Result<()> {
        self.send("object_del", Some(json!({ "id": id })), None)
            .await
            .map(|_| ())
    }

    pub async fn chardev_add(&self, id: &str, backend: Value) -> Result<Value> {
        self.send(
            "chardev-add",
            Some(json!({ "id": id, "backend": backend })),
            None,
        )
        .await
    }

    pub async fn chardev_remove(&self, id: &str) -> Result<()> {
        self.send("chardev-remove", Some(json!({ "id": id })), None)
            .await
            .map(|_| ())
    }

    pub async fn netdev_add(&self, props: Value) -> Result<()> {
        self.send("netdev_add", Some(props), None).await.map(|_| ())
    }

    pub async fn netdev_del(&self, id: &str) -> Result<()> {
        self.send("netdev_del", Some(json!({ "id": id })), None)
            .await
            .map(|_| ())
    }

    pub async fn set_link(&self, name: &str, up: bool) -> Result<()> {
        self.send("set_link", Some(json!({ "name": name, "up": up })), None)
            .await
            .map(|_| ())
    }

    /// Open the tray / detach the medium of a removable drive.
    pub async fn eject(&self, device: &str, force: bool) -> Result<()> {
        self.send(
            "eject",
            Some(json!({ "device": device, "force": force })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Insert new media into a removable drive.
    pub async fn change_media(&self, device: &str, target: &str, format: Option<&str>) -> Result<()> {
        let mut args = json!({ "device": device, "target": target });
        if let Some(format) = format {
            args["arg"] = json!(format);
        }
        self.send("change", Some(args), None).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Kick off the background migration stream. `blk`/`inc` mirror the
    /// non-shared-disk flags; they must be cleared when the disks travel
    /// through the NBD side channel instead.
    pub async fn migrate(&self, uri: &str, blk: bool, inc: bool) -> Result<()> {
        self.send(
            "migrate",
            Some(json!({ "uri": uri, "blk": blk, "inc": inc, "detach": true })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Migrate to a file descriptor previously planted with `getfd`.
    pub async fn migrate_to_fd(&self, fdname: &str) -> Result<()> {
        self.send(
            "migrate",
            Some(json!({ "uri": format!("fd:{}", fdname), "blk": false, "inc": false, "detach": true })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn migrate_cancel(&self) -> Result<()> {
        self.send("migrate_cancel", None, None).await.map(|_| ())
    }

    pub async fn migrate_set_speed(&self, bps: u64) -> Result<()> {
        self.send("migrate-set-speed", Some(json!({ "value": bps })), None)
            .await
            .map(|_| ())
    }

    pub async fn migrate_set_downtime(&self, seconds: f64) -> Result<()> {
        self.send(
            "migrate-set-downtime",
            Some(json!({ "value": seconds })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn migrate_set_cache_size(&self, bytes: u64) -> Result<()> {
        self.send(
            "migrate-set-cache-size",
            Some(json!({ "value": bytes })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn migrate_set_capabilities(&self, caps: &[(&str, bool)]) -> Result<()> {
        let list: Vec<Value> = caps
            .iter()
            .map(|(name, state)| json!({ "capability": name, "state": state }))
            .collect();
        self.send(
            "migrate-set-capabilities",
            Some(json!({ "capabilities": list })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// The capability names the hypervisor understands, from
    /// query-migrate-capabilities. Unsupported on old versions; the caller
    /// treats that as "none".
    pub async fn query_migrate_capabilities(&self) -> Result<Vec<String>> {
        let reply = self.send("query-migrate-capabilities", None, None).await?;
        let mut names = vec![];
        if let Some(list) = reply.as_array() {
            for entry in list {
                if let Some(name) = entry.get("capability").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub async fn query_migrate(&self) -> Result<MigrateInfo> {
        let reply = self.send("query-migrate", None, None).await?;
        from_value(reply)
    }

    pub async fn query_spice_migration(&self) -> Result<SpiceMigrationInfo> {
        let reply = self.send("query-spice", None, None).await?;
        from_value(reply)
    }

    pub async fn nbd_server_start(&self, host: &str, port: u16) -> Result<()> {
        self.send(
            "nbd-server-start",
            Some(json!({ "addr": { "type": "inet", "data": { "host": host, "port": port.to_string() } } })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn nbd_server_add(&self, device: &str, writable: bool) -> Result<()> {
        self.send(
            "nbd-server-add",
            Some(json!({ "device": device, "writable": writable })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn nbd_server_stop(&self) -> Result<()> {
        self.send("nbd-server-stop", None, None).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    pub async fn block_resize(&self, device: &str, size: u64) -> Result<()> {
        self.send(
            "block_resize",
            Some(json!({ "device": device, "size": size })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn query_blockstats(&self) -> Result<Value> {
        self.send("query-blockstats", None, None).await
    }

    pub async fn drive_mirror(
        &self,
        device: &str,
        target: &str,
        format: Option<&str>,
        speed: u64,
    ) -> Result<()> {
        let mut args = json!({
            "device": device,
            "target": target,
            "mode": "existing",
            "sync": "full",
        });
        if speed > 0 {
            args["speed"] = json!(speed);
        }
        if let Some(format) = format {
            args["format"] = json!(format);
        }
        self.send("drive-mirror", Some(args), None).await.map(|_| ())
    }

    pub async fn query_block_jobs(&self) -> Result<Vec<BlockJobInfo>> {
        let reply = self.send("query-block-jobs", None, None).await?;
        from_value(reply)
    }

    pub async fn block_job_cancel(&self, device: &str) -> Result<()> {
        self.send("block-job-cancel", Some(json!({ "device": device })), None)
            .await
            .map(|_| ())
    }

    pub async fn block_job_set_speed(&self, device: &str, speed: u64) -> Result<()> {
        self.send(
            "block-job-set-speed",
            Some(json!({ "device": device, "speed": speed })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn block_commit(&self, device: &str, top: &str, base: Option<&str>) -> Result<()> {
        let mut args = json!({ "device": device, "top": top });
        if let Some(base) = base {
            args["base"] = json!(base);
        }
        self.send("block-commit", Some(args), None).await.map(|_| ())
    }

    /// Atomically apply a group of block actions; used for multi-disk
    /// snapshots.
    pub async fn transaction(&self, actions: Vec<Value>) -> Result<()> {
        self.send("transaction", Some(json!({ "actions": actions })), None)
            .await
            .map(|_| ())
    }

    pub async fn snapshot_blkdev(&self, device: &str, file: &str, format: &str) -> Result<()> {
        self.send(
            "snapshot_blkdev",
            Some(json!({ "device": device, "snapshot-file": file, "format": format })),
            None,
        )
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Graphics
    // ------------------------------------------------------------------

    pub async fn set_password(&self, protocol: &str, password: &str, connected: &str) -> Result<()> {
        self.send(
            "set_password",
            Some(json!({ "protocol": protocol, "password": password, "connected": connected })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn expire_password(&self, protocol: &str, time: &str) -> Result<()> {
        self.send(
            "expire_password",
            Some(json!({ "protocol": protocol, "time": time })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn change_vnc_password(&self, password: &str) -> Result<()> {
        self.send(
            "change-vnc-password",
            Some(json!({ "password": password })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Hand connected SPICE clients the coordinates of the migration
    /// destination for seamless relocation.
    pub async fn client_migrate_info(
        &self,
        protocol: &str,
        hostname: &str,
        port: i32,
        tls_port: i32,
        cert_subject: Option<&str>,
    ) -> Result<()> {
        let mut args = json!({ "protocol": protocol, "hostname": hostname });
        if port > 0 {
            args["port"] = json!(port);
        }
        if tls_port > 0 {
            args["tls-port"] = json!(tls_port);
        }
        if let Some(subject) = cert_subject {
            args["cert-subject"] = json!(subject);
        }
        self.send("client_migrate_info", Some(args), None)
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn query_status(&self) -> Result<StatusInfo> {
        let reply = self.send("query-status", None, None).await?;
        from_value(reply)
    }

    pub async fn query_cpus(&self) -> Result<Vec<CpuInfo>> {
        let reply = self.send("query-cpus", None, None).await?;
        from_value(reply)
    }

    pub async fn query_kvm_enabled(&self) -> Result<bool> {
        let reply = self.send("query-kvm", None, None).await?;
        Ok(reply.get("enabled").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn query_version(&self) -> Result<VersionInfo> {
        let reply = self.send("query-version", None, None).await?;
        from_value(reply)
    }

    pub async fn query_machines(&self) -> Result<Value> {
        self.send("query-machines", None, None).await
    }

    pub async fn query_chardev(&self) -> Result<Value> {
        self.send("query-chardev", None, None).await
    }

    pub async fn query_iothreads(&self) -> Result<Vec<IoThreadInfo>> {
        let reply = self.send("query-iothreads", None, None).await?;
        from_value(reply)
    }

    pub async fn query_commands(&self) -> Result<Vec<String>> {
        let reply = self.send("query-commands", None, None).await?;
        let mut names = vec![];
        if let Some(list) = reply.as_array() {
            for entry in list {
                if let Some(name) = entry.get("name").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub async fn query_events(&self) -> Result<Vec<String>> {
        let reply = self.send("query-events", None, None).await?;
        let mut names = vec![];
        if let Some(list) = reply.as_array() {
            for entry in list {
                if let Some(name) = entry.get("name").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub async fn query_rx_filter(&self, name: &str) -> Result<Value> {
        self.send("query-rx-filter", Some(json!({ "name": name })), None)
            .await
    }

    pub async fn query_tpm_models(&self) -> Result<Value> {
        self.send("query-tpm-models", None, None).await
    }

    pub async fn qom_list(&self, path: &str) -> Result<Vec<(String, String)>> {
        let reply = self
            .send("qom-list", Some(json!({ "path": path })), None)
            .await?;
        let mut out = vec![];
        if let Some(list) = reply.as_array() {
            for entry in list {
                let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
                let ty = entry.get("type").and_then(Value::as_str).unwrap_or("");
                out.push((name.to_string(), ty.to_string()));
            }
        }
        Ok(out)
    }

    pub async fn qom_get(&self, path: &str, property: &str) -> Result<Value> {
        self.send(
            "qom-get",
            Some(json!({ "path": path, "property": property })),
            None,
        )
        .await
    }

    pub async fn qom_set(&self, path: &str, property: &str, value: Value) -> Result<()> {
        self.send(
            "qom-set",
            Some(json!({ "path": path, "property": property, "value": value })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// The options the hypervisor binary advertises, cached per channel.
    pub async fn command_line_options(&self) -> Result<Value> {
        if let Some(cached) = self.inner().options_cache.lock().unwrap().clone() {
            return Ok(cached);
        }
        let reply = self.send("query-command-line-options", None, None).await?;
        *self.inner().options_cache.lock().unwrap() = Some(reply.clone());
        Ok(reply)
    }

    /// Discover the QOM path of the balloon device and cache it for the
    /// lifetime of this channel.
    pub async fn find_balloon_path(&self) -> Result<Option<String>> {
        if let Some(cached) = self.inner().balloon_path.lock().unwrap().clone() {
            return Ok(Some(cached));
        }
        for parent in &["/machine/peripheral", "/machine/peripheral-anon"] {
            let children = match self.qom_list(parent).await {
                Ok(children) => children,
                Err(e) if e.is_command_not_found() => return Ok(None),
                Err(e) => return Err(e),
            };
            for (name, ty) in children {
                if ty.contains("balloon") {
                    let path = format!("{}/{}", parent, name);
                    *self.inner().balloon_path.lock().unwrap() = Some(path.clone());
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // File descriptor management
    // ------------------------------------------------------------------

    /// Plant a descriptor in the hypervisor under `name`. Every successful
    /// getfd must eventually be paired with closefd.
    pub async fn getfd(&self, name: &str, fd: RawFd) -> Result<()> {
        self.send("getfd", Some(json!({ "fdname": name })), Some(fd))
            .await
            .map(|_| ())
    }

    pub async fn closefd(&self, name: &str) -> Result<()> {
        self.send("closefd", Some(json!({ "fdname": name })), None)
            .await
            .map(|_| ())
    }

    pub async fn add_fd(&self, fdset: Option<i64>, fd: RawFd) -> Result<Value> {
        let args = match fdset {
            Some(id) => json!({ "fdset-id": id }),
            None => json!({}),
        };
        self.send("add-fd", Some(args), Some(fd)).await
    }

    pub async fn remove_fd(&self, fdset: i64) -> Result<()> {
        self.send("remove-fd", Some(json!({ "fdset-id": fdset })), None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_info_parses_partial_reply() {
        let info: MigrateInfo = serde_json::from_value(json!({
            "status": "active",
            "ram": { "total": 100, "remaining": 60, "transferred": 40 },
            "total-time": 1200
        }))
        .unwrap();
        assert_eq!(info.status, "active");
        assert_eq!(info.ram.as_ref().unwrap().remaining, 60);
        assert!(info.disk.is_none());
        assert_eq!(info.total_time_ms, 1200);
    }

    #[test]
    fn test_block_job_info_parses() {
        let jobs: Vec<BlockJobInfo> = serde_json::from_value(json!([
            { "type": "mirror", "device": "drive-virtio-disk0", "len": 1024, "offset": 1024, "busy": false, "speed": 0 }
        ]))
        .unwrap();
        assert_eq!(jobs[0].device, "drive-virtio-disk0");
        assert_eq!(jobs[0].len, jobs[0].offset);
    }
}
