// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The destination half of a migration.

use std::sync::Arc;

use hypervisor::{CapFlags, Domain};
use jobs::{AsyncJob, AsyncJobTicket};
use vmm_types::migrate::{MigrateFlags, MigrationPhase};
use vmm_types::state::{
    DomainEvent, DomainState, ResumedReason, StartedReason, StateReason, StoppedReason,
};
use vmm_types::{Result, VmmError};

use crate::cookie::{CookieNbd, MigrationCookie};
use crate::nbd;
use crate::uri::MigrateUri;
use crate::MigrationContext;

/// A migration-in job on the destination daemon.
pub struct DestMigration {
    domain: Arc<Domain>,
    ctx: Arc<MigrationContext>,
    ticket: AsyncJobTicket,
    flags: MigrateFlags,
    listen_port: Option<u16>,
}

impl DestMigration {
    /// Phase prepare: validate the incoming cookie, start the hypervisor
    /// paused with an incoming listener, optionally serve NBD exports for
    /// the disks the source will copy, and answer with our cookie and the
    /// URI the source must aim at.
    pub async fn prepare(
        domain: Arc<Domain>,
        ctx: Arc<MigrationContext>,
        cookie_in: &MigrationCookie,
        flags: MigrateFlags,
        uri_in: Option<&str>,
    ) -> Result<(DestMigration, MigrationCookie, String)> {
        // Refuse guests "arriving" from this very host.
        cookie_in.check_remote_host(&ctx.hostname, ctx.host_uuid)?;
        {
            let inner = domain.lock().await;
            cookie_in.check_name(&inner.def.name)?;
        }
        cookie_in.check_lockstate(domain.ctx.lock_manager.driver_name())?;

        let ticket = domain.jobs.begin_async_job(AsyncJob::MigrationIn).await?;
        let mut this = DestMigration {
            domain,
            ctx,
            ticket,
            flags,
            listen_port: None,
        };

        let result = this.prepare_locked(cookie_in, uri_in).await;
        match result {
            Ok((cookie_out, uri_out)) => Ok((this, cookie_out, uri_out)),
            Err(e) => {
                this.release_port();
                this.domain.jobs.end_async_job(this.ticket).await;
                Err(e)
            }
        }
    }

    async fn prepare_locked(
        &mut self,
        cookie_in: &MigrationCookie,
        uri_in: Option<&str>,
    ) -> Result<(MigrationCookie, String)> {
        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Prepare)
            .await?;

        let def = self.domain.lock().await.def.clone();

        let mut cookie_out = MigrationCookie::new(
            &def.name,
            def.uuid,
            &self.ctx.hostname,
            self.ctx.host_uuid,
        );

        if self.flags.contains(MigrateFlags::OFFLINE) {
            // Definition-only transfer: nothing to boot.
            return Ok((cookie_out, String::new()));
        }

        // Where the hypervisor listens for the stream.
        let uri = match uri_in {
            Some(uri) => {
                let parsed = MigrateUri::parse(uri)?;
                if parsed.port().is_some() {
                    parsed
                } else {
                    parsed.with_port(self.claim_port()?)
                }
            }
            None => MigrateUri::Tcp {
                host: self.ctx.hostname.clone(),
                port: Some(self.claim_port()?),
            },
        };
        let incoming = uri.to_incoming_uri(&self.ctx.listen_address);

        // Pre-create the images the source plans to copy, sized as the
        // cookie reports them.
        if self
            .flags
            .intersects(MigrateFlags::NON_SHARED_DISK | MigrateFlags::NON_SHARED_INC)
        {
            if let Some(nbd_section) = &cookie_in.nbd {
                nbd::precreate_disks(&def, nbd_section)?;
            }
        }

        self.domain.boot_process(&def, true, Some(&incoming)).await?;
        // Kill the half-arrived guest if the controlling client vanishes.
        self.domain.set_autodestroy(true);

        {
            let inner = self.domain.lock().await;
            if self.ctx.listen_address.contains(':')
                && !inner.caps.contains(CapFlags::IPV6_MIGRATION)
            {
                return Err(VmmError::OperationUnsupported(
                    "this hypervisor cannot listen on IPv6 addresses".to_string(),
                ));
            }
        }

        if self
            .flags
            .intersects(MigrateFlags::NON_SHARED_DISK | MigrateFlags::NON_SHARED_INC)
        {
            let caps = self.domain.lock().await.caps;
            if caps.contains(CapFlags::NBD_SERVER) {
                let port = nbd::start_nbd_server(
                    &self.domain,
                    &self.ticket,
                    &self.ctx.listen_address,
                    &self.ctx.ports,
                )
                .await?;
                cookie_out.set_nbd(CookieNbd {
                    port,
                    disks: vec![],
                });
            }
        }

        if let Some(graphics) = MigrationCookie::graphics_from_def(&def) {
            cookie_out.set_graphics(graphics);
        }

        // The URI the source aims at: our hostname plus the chosen port.
        let uri_out = match uri {
            MigrateUri::Tcp { port, .. } => {
                format!("tcp:{}:{}", self.ctx.hostname, port.unwrap_or(0))
            }
            MigrateUri::Rdma { port, .. } => {
                format!("rdma:{}:{}", self.ctx.hostname, port.unwrap_or(0))
            }
            MigrateUri::Unix { .. } => uri.to_hypervisor_uri(),
        };

        let _ = self.domain.save_status().await;
        Ok((cookie_out, uri_out))
    }

    fn claim_port(&mut self) -> Result<u16> {
        let port = self.ctx.ports.acquire()?;
        self.listen_port = Some(port);
        Ok(port)
    }

    fn release_port(&mut self) {
        if let Some(port) = self.listen_port.take() {
            self.ctx.ports.release(port);
        }
    }

    /// Phase finish3: the stream ended. On success the guest starts
    /// running here (unless the caller asked for paused); on failure the
    /// half-arrived process is destroyed. The source's cookie carries the
    /// completed-job statistics.
    pub async fn finish(
        mut self,
        cookie_in: Option<&MigrationCookie>,
        success: bool,
    ) -> Result<Option<MigrationCookie>> {
        self.domain
            .jobs
            .set_phase(&self.ticket, MigrationPhase::Finish3)
            .await?;

        if let Some(stats) = cookie_in.and_then(|c| c.statistics.clone()) {
            self.domain.jobs.store_completed(stats).await;
        }

        let result = if success {
            self.finish_success().await
        } else {
            self.finish_failure().await.map(|_| None)
        };

        self.release_port();
        let ticket = self.ticket;
        self.domain.jobs.end_async_job(ticket).await;
        result
    }

    async fn finish_success(&mut self) -> Result<Option<MigrationCookie>> {
        nbd::stop_nbd_server(&self.domain, &self.ticket).await;

        if self.flags.contains(MigrateFlags::PERSIST_DEST) {
            self.domain.set_persistent(true);
        }

        // Direct-mode interfaces re-associate with the fabric here.
        {
            let inner = self.domain.lock().await;
            for net in &inner.def.nets {
                if net.vport.is_some() {
                    debug!(sl!(), "associating vport profile"; "mac" => &net.mac);
                }
            }
        }

        if !self.flags.contains(MigrateFlags::PAUSED) {
            let mon = self.domain.enter_monitor_async(&self.ticket).await?;
            let resumed = mon.cont().await.map_err(VmmError::from);
            self.domain.exit_monitor(mon).await?;
            resumed?;
            let mut inner = self.domain.lock().await;
            inner.set_state(DomainState::Running, StateReason::Migration);
        } else {
            let mut inner = self.domain.lock().await;
            inner.set_state(DomainState::Paused, StateReason::Migration);
        }

        self.domain.set_autodestroy(false);
        let _ = self.domain.save_status().await;

        self.domain
            .emit_event(DomainEvent::Started {
                reason: StartedReason::Migrated,
            })
            .await;
        if !self.flags.contains(MigrateFlags::PAUSED) {
            self.domain
                .emit_event(DomainEvent::Resumed {
                    reason: ResumedReason::Migrated,
                })
                .await;
        }

        let mut cookie = {
            let inner = self.domain.lock().await;
            MigrationCookie::new(
                &inner.def.name,
                inner.def.uuid,
                &self.ctx.hostname,
                self.ctx.host_uuid,
            )
        };
        if let Some(stats) = self.domain.jobs.completed_stats().await {
            cookie.set_statistics(stats);
        }
        Ok(Some(cookie))
    }

    async fn finish_failure(&mut self) -> Result<()> {
        nbd::stop_nbd_server(&self.domain, &self.ticket).await;
        if self.domain.is_active().await {
            self.domain.stop_process(StoppedReason::Failed).await?;
        }
        Ok(())
    }
}
