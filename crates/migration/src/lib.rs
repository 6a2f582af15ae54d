// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live migration between two daemons.
//!
//! The source walks begin3 -> perform3 -> perform3_done -> confirm3 (or its
//! cancelled twin); the destination walks prepare -> finish3. The legacy
//! two-phase protocol collapses the middle into perform2/finish2. Cookies
//! carry side-channel metadata both ways at every boundary; non-shared
//! disks travel through the hypervisor's NBD server ahead of the main
//! memory stream.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "migration");

mod cookie;
mod dest;
mod nbd;
mod peer;
mod progress;
mod recover;
mod sharedfs;
mod source;
mod tunnel;
mod uri;

pub use cookie::{
    CookieGraphics, CookieLockstate, CookieNbd, CookieNbdDisk, CookieNetIf, CookieNetwork,
    MigrationCookie,
};
pub use dest::DestMigration;
pub use peer::{migrate_to_peer, DestinationPeer, PeerProtocol};
pub use recover::{decide_recovery, RecoveryAction};
pub use source::SourceMigration;
pub use tunnel::{run_tunnel, TunnelCommand};
pub use uri::MigrateUri;

use std::sync::Arc;

use resource::PortAllocator;
use uuid::Uuid;

/// Daemon-wide migration collaborators and identity.
pub struct MigrationContext {
    /// Our fully-qualified hostname, advertised in cookies and default
    /// migration URIs.
    pub hostname: String,
    pub host_uuid: Uuid,
    /// Address incoming listeners and the NBD server bind to.
    pub listen_address: String,
    pub ports: Arc<PortAllocator>,
}
