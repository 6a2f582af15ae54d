// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Peer-to-peer migration: the source daemon holds the connection to the
//! destination daemon itself and drives every phase, so the API client
//! never talks to the destination.

use std::sync::Arc;

use hypervisor::Domain;
use vmm_types::config::DomainConfig;
use vmm_types::migrate::MigrateFlags;
use vmm_types::Result;

use crate::cookie::MigrationCookie;
use crate::source::SourceMigration;
use crate::uri::MigrateUri;
use crate::MigrationContext;

/// What the remote daemon speaks. Parameter-style and positional v3 differ
/// only in how the transport encodes the calls; the phase structure is the
/// same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProtocol {
    V2,
    V3,
    V3Params,
}

/// The connection to a destination daemon.
#[async_trait::async_trait]
pub trait DestinationPeer: Send + Sync {
    fn protocol(&self) -> PeerProtocol {
        PeerProtocol::V3
    }

    /// Run prepare on the destination. Returns its cookie and the URI the
    /// source hypervisor must connect to.
    async fn prepare(
        &self,
        def: DomainConfig,
        cookie: MigrationCookie,
        flags: MigrateFlags,
    ) -> Result<(MigrationCookie, String)>;

    /// Run finish on the destination. `cancelled` tells it to tear the
    /// half-arrived guest down instead of starting it.
    async fn finish(
        &self,
        name: &str,
        cookie: MigrationCookie,
        flags: MigrateFlags,
        cancelled: bool,
    ) -> Result<Option<MigrationCookie>>;

    /// Keep-alive probe used by the progress loop.
    async fn alive(&self) -> bool {
        true
    }
}

/// Drive a whole peer-to-peer migration from the source side.
pub async fn migrate_to_peer(
    domain: Arc<Domain>,
    ctx: Arc<MigrationContext>,
    peer: &dyn DestinationPeer,
    flags: MigrateFlags,
    dname: Option<&str>,
) -> Result<()> {
    let source = SourceMigration::start(domain.clone(), ctx, flags).await?;
    let result = drive(&source, &domain, peer, flags, dname).await;
    source.finish().await;
    result
}

async fn drive(
    source: &SourceMigration,
    domain: &Arc<Domain>,
    peer: &dyn DestinationPeer,
    flags: MigrateFlags,
    dname: Option<&str>,
) -> Result<()> {
    let begin_cookie = source.begin(dname).await?;
    let name = dname
        .map(|n| n.to_string())
        .unwrap_or_else(|| begin_cookie.name.clone());
    let def = {
        let inner = domain.lock().await;
        let mut def = inner.def.clone();
        def.name = name.clone();
        def
    };

    let (prepare_cookie, uri_out) = peer.prepare(def, begin_cookie, flags).await?;

    if flags.contains(MigrateFlags::OFFLINE) {
        // Definition-only: no stream, straight to finish.
        peer.finish(&name, prepare_cookie, flags, false).await?;
        return source.confirm(false).await;
    }

    let uri = MigrateUri::parse(&uri_out)?;

    match peer.protocol() {
        PeerProtocol::V2 => {
            // The legacy protocol has no confirm round; perform kills the
            // source copy on success.
            match source.perform2(&prepare_cookie, &uri, Some(peer)).await {
                Ok(()) => {
                    peer.finish(&name, prepare_cookie, flags, false).await?;
                    Ok(())
                }
                Err(e) => {
                    let _ = peer.finish(&name, prepare_cookie, flags, true).await;
                    Err(e)
                }
            }
        }
        PeerProtocol::V3 | PeerProtocol::V3Params => {
            match source.perform(&prepare_cookie, &uri, Some(peer)).await {
                Ok(perform_cookie) => {
                    match peer.finish(&name, perform_cookie, flags, false).await {
                        Ok(_) => source.confirm(false).await,
                        Err(e) => {
                            // The destination could not take over: our copy
                            // is still the live one.
                            warn!(sl!(), "destination finish failed, rolling back";
                                "error" => e.to_string());
                            let _ = source.confirm(true).await;
                            Err(e)
                        }
                    }
                }
                Err(e) => {
                    let _ = peer
                        .finish(&name, failure_cookie(source, domain).await, flags, true)
                        .await;
                    let _ = source.confirm(true).await;
                    Err(e)
                }
            }
        }
    }
}

async fn failure_cookie(source: &SourceMigration, domain: &Arc<Domain>) -> MigrationCookie {
    let ctx = source.context();
    let inner = domain.lock().await;
    MigrationCookie::new(&inner.def.name, inner.def.uuid, &ctx.hostname, ctx.host_uuid)
}
