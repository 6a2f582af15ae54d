// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Unsolicited event dispatch.
//!
//! The reader task pushes events into an ordered queue; a dedicated
//! dispatcher task invokes the handler outside every channel lock, so
//! handlers are free to take the domain lock or issue further monitor calls
//! (through a nested job slot).

use serde_json::Value;

/// One unsolicited message from the hypervisor.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
    /// Seconds + microseconds as reported by the peer.
    pub seconds: Option<i64>,
    pub microseconds: Option<i64>,
}

impl QmpEvent {
    pub fn from_value(value: &Value) -> Option<QmpEvent> {
        let name = value.get("event")?.as_str()?.to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let ts = value.get("timestamp");
        Some(QmpEvent {
            name,
            data,
            seconds: ts.and_then(|t| t.get("seconds")).and_then(Value::as_i64),
            microseconds: ts
                .and_then(|t| t.get("microseconds"))
                .and_then(Value::as_i64),
        })
    }
}

/// Handlers for the lifecycle edges a domain cares about. All methods have
/// no-op defaults; implementors override what they consume. Handlers run
/// with a channel reference held but no channel lock, in the order the
/// hypervisor emitted the events.
#[async_trait::async_trait]
pub trait DomainEventHandler: Send + Sync {
    async fn shutdown(&self) {}
    async fn reset(&self) {}
    async fn powerdown(&self) {}
    async fn stop(&self) {}
    async fn resume(&self) {}
    async fn guest_panicked(&self) {}
    async fn watchdog(&self, _action: &str) {}
    async fn io_error(&self, _device: &str, _action: &str, _reason: Option<&str>) {}
    async fn graphics(&self, _name: &str, _data: &Value) {}
    async fn tray_moved(&self, _alias: &str, _open: bool) {}
    async fn pm_wakeup(&self) {}
    async fn pm_suspend(&self) {}
    async fn pm_suspend_disk(&self) {}
    async fn rtc_change(&self, _offset: i64) {}
    async fn block_job_completed(&self, _device: &str, _job_type: &str, _error: Option<&str>) {}
    async fn balloon_change(&self, _actual: u64) {}
    async fn device_deleted(&self, _alias: &str) {}
    async fn rx_filter_changed(&self, _alias: &str) {}
    async fn serial_changed(&self, _id: &str, _connected: bool) {}
    /// The channel hit EOF or a fatal error and is unusable.
    async fn eof(&self) {}
}

/// Decode one event and invoke the matching handler method.
pub(crate) async fn dispatch_event(handler: &dyn DomainEventHandler, event: &QmpEvent) {
    let data = &event.data;
    let str_field = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or("");

    match event.name.as_str() {
        "SHUTDOWN" => handler.shutdown().await,
        "RESET" => handler.reset().await,
        "POWERDOWN" => handler.powerdown().await,
        "STOP" => handler.stop().await,
        "RESUME" => handler.resume().await,
        "GUEST_PANICKED" => handler.guest_panicked().await,
        "WATCHDOG" => handler.watchdog(str_field("action")).await,
        "BLOCK_IO_ERROR" => {
            let reason = data.get("reason").and_then(Value::as_str);
            handler
                .io_error(str_field("device"), str_field("action"), reason)
                .await
        }
        "VNC_CONNECTED" | "VNC_INITIALIZED" | "VNC_DISCONNECTED" | "SPICE_CONNECTED"
        | "SPICE_INITIALIZED" | "SPICE_DISCONNECTED" | "SPICE_MIGRATE_COMPLETED" => {
            handler.graphics(&event.name, data).await
        }
        "DEVICE_TRAY_MOVED" => {
            let open = data
                .get("tray-open")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            handler.tray_moved(str_field("device"), open).await
        }
        "WAKEUP" => handler.pm_wakeup().await,
        "SUSPEND" => handler.pm_suspend().await,
        "SUSPEND_DISK" => handler.pm_suspend_disk().await,
        "RTC_CHANGE" => {
            let offset = data.get("offset").and_then(Value::as_i64).unwrap_or(0);
            handler.rtc_change(offset).await
        }
        "BLOCK_JOB_COMPLETED" | "BLOCK_JOB_CANCELLED" | "BLOCK_JOB_ERROR" => {
            let error = data.get("error").and_then(Value::as_str);
            handler
                .block_job_completed(str_field("device"), str_field("type"), error)
                .await
        }
        "BALLOON_CHANGE" => {
            let actual = data.get("actual").and_then(Value::as_u64).unwrap_or(0);
            handler.balloon_change(actual).await
        }
        "DEVICE_DELETED" => {
            // Events for devices without an id carry only the QOM path and
            // cannot be matched to an alias.
            if let Some(alias) = data.get("device").and_then(Value::as_str) {
                handler.device_deleted(alias).await
            }
        }
        "NIC_RX_FILTER_CHANGED" => handler.rx_filter_changed(str_field("name")).await,
        "VSERPORT_CHANGE" => {
            let connected = data.get("open").and_then(Value::as_bool).unwrap_or(false);
            handler.serial_changed(str_field("id"), connected).await
        }
        _ => {
            trace!(sl!(), "unhandled monitor event"; "event" => &event.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DomainEventHandler for Recorder {
        async fn device_deleted(&self, alias: &str) {
            self.deleted.lock().unwrap().push(alias.to_string());
        }
    }

    #[tokio::test]
    async fn test_device_deleted_dispatch() {
        let handler = Recorder::default();
        let event = QmpEvent::from_value(&serde_json::json!({
            "event": "DEVICE_DELETED",
            "data": { "device": "virtio-disk0", "path": "/machine/peripheral/virtio-disk0" },
            "timestamp": { "seconds": 1, "microseconds": 2 }
        }))
        .unwrap();
        dispatch_event(&handler, &event).await;
        assert_eq!(*handler.deleted.lock().unwrap(), vec!["virtio-disk0"]);
    }

    #[tokio::test]
    async fn test_device_deleted_without_id_is_ignored() {
        let handler = Recorder::default();
        let event = QmpEvent::from_value(&serde_json::json!({
            "event": "DEVICE_DELETED",
            "data": { "path": "/machine/peripheral-anon/device[0]" }
        }))
        .unwrap();
        dispatch_event(&handler, &event).await;
        assert!(handler.deleted.lock().unwrap().is_empty());
    }
}
