// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Wiring of unsolicited monitor events into domain state.
//!
//! The handler holds a weak domain reference: the domain owns the channel,
//! the channel's dispatcher only borrows the domain while delivering. None
//! of these paths acquires a job slot; they mutate state under the domain
//! lock only.

use std::sync::Weak;

use monitor::DomainEventHandler;
use vmm_types::state::{DomainEvent, DomainState, StateReason, SuspendedReason};

use crate::domain::Domain;
use crate::hotplug;

pub struct DomainMonitorHandler {
    pub domain: Weak<Domain>,
}

impl DomainMonitorHandler {
    fn get(&self) -> Option<std::sync::Arc<Domain>> {
        self.domain.upgrade()
    }
}

#[async_trait::async_trait]
impl DomainEventHandler for DomainMonitorHandler {
    async fn stop(&self) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        let suspended = {
            let mut inner = domain.lock().await;
            if inner.state == DomainState::Running {
                inner.set_state(DomainState::Paused, StateReason::Unknown);
                true
            } else {
                false
            }
        };
        if suspended {
            let _ = domain.save_status().await;
            domain
                .emit_event(DomainEvent::Suspended {
                    reason: SuspendedReason::Paused,
                })
                .await;
        }
    }

    async fn resume(&self) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        let resumed = {
            let mut inner = domain.lock().await;
            if inner.state == DomainState::Paused {
                inner.set_state(DomainState::Running, StateReason::User);
                true
            } else {
                false
            }
        };
        if resumed {
            let _ = domain.save_status().await;
            domain
                .emit_event(DomainEvent::Resumed {
                    reason: vmm_types::state::ResumedReason::Unpaused,
                })
                .await;
        }
    }

    async fn shutdown(&self) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        let mut inner = domain.lock().await;
        if inner.state.is_active() {
            inner.set_state(DomainState::Stopping, StateReason::Shutdown);
        }
    }

    async fn guest_panicked(&self) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        let mut inner = domain.lock().await;
        if inner.state == DomainState::Running {
            inner.set_state(DomainState::Paused, StateReason::Crashed);
        }
    }

    async fn watchdog(&self, action: &str) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        if action == "pause" {
            let mut inner = domain.lock().await;
            if inner.state == DomainState::Running {
                inner.set_state(DomainState::Paused, StateReason::Watchdog);
            }
        } else {
            info!(sl!(), "watchdog fired"; "action" => action);
        }
    }

    async fn io_error(&self, device: &str, action: &str, reason: Option<&str>) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        warn!(sl!(), "guest I/O error";
            "device" => device, "action" => action,
            "reason" => reason.unwrap_or(""));
        if action == "stop" {
            let suspended = {
                let mut inner = domain.lock().await;
                if inner.state == DomainState::Running {
                    inner.set_state(DomainState::Paused, StateReason::IoError);
                    true
                } else {
                    false
                }
            };
            if suspended {
                let _ = domain.save_status().await;
                domain
                    .emit_event(DomainEvent::Suspended {
                        reason: SuspendedReason::IoError,
                    })
                    .await;
            }
        }
    }

    async fn tray_moved(&self, alias: &str, open: bool) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        {
            let mut inner = domain.lock().await;
            if open {
                inner.tray_open.insert(alias.to_string());
            } else {
                inner.tray_open.remove(alias);
            }
        }
        domain.tray_cond.notify_waiters();
    }

    async fn device_deleted(&self, alias: &str) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        // A waiter armed for this alias finishes the detach itself; an
        // unsolicited event (timed-out wait, guest-initiated unplug) is
        // cleaned up right here.
        if !domain.removal_notify(alias) {
            if let Err(e) = hotplug::remove_device_by_alias(&domain, alias).await {
                warn!(sl!(), "deferred device cleanup failed";
                    "alias" => alias, "error" => e.to_string());
            }
        }
    }

    async fn balloon_change(&self, actual: u64) {
        debug!(sl!(), "balloon changed"; "actual" => actual);
    }

    async fn rtc_change(&self, offset: i64) {
        debug!(sl!(), "RTC offset changed"; "offset" => offset);
    }

    async fn eof(&self) {
        let domain = match self.get() {
            Some(d) => d,
            None => return,
        };
        let mut inner = domain.lock().await;
        inner.monitor_dead = true;
        if inner.state.is_active() {
            warn!(sl!(), "monitor EOF while domain is active";
                "name" => &inner.def.name);
        }
    }
}
