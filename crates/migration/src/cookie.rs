// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The structured side-channel document exchanged at every migration
//! phase. Each cookie names the feature sections it carries and which of
//! them the receiver MUST understand; unknown optional sections pass
//! through silently, unknown mandatory ones refuse the migration.

use jobs::JobStats;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vmm_types::config::{DomainConfig, GraphicsConfig, GraphicsKind};
use vmm_types::{Result, VmmError};

/// Feature sections this implementation understands.
pub const KNOWN_FEATURES: &[&str] = &[
    "graphics",
    "lockstate",
    "persistent",
    "network",
    "nbd",
    "statistics",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieGraphics {
    pub kind: String,
    pub port: i32,
    pub tls_port: i32,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub tls_subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieLockstate {
    pub driver: String,
    #[serde(default)]
    pub lease: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieNetIf {
    #[serde(default)]
    pub vport_type: Option<String>,
    #[serde(default)]
    pub port_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieNetwork {
    pub interfaces: Vec<CookieNetIf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieNbdDisk {
    /// Guest target of the disk, e.g. "vda".
    pub target: String,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieNbd {
    pub port: u16,
    #[serde(default)]
    pub disks: Vec<CookieNbdDisk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCookie {
    /// Domain name as the sender knows it (the original name when the
    /// domain was renamed for migration).
    pub name: String,
    pub uuid: Uuid,
    /// The sending host's identity; the receiver uses it to refuse
    /// migrating onto the very same host.
    pub remote_hostname: String,
    pub remote_hostuuid: Uuid,

    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub features_mandatory: Vec<String>,

    #[serde(default)]
    pub graphics: Option<CookieGraphics>,
    #[serde(default)]
    pub lockstate: Option<CookieLockstate>,
    #[serde(default)]
    pub persistent: Option<DomainConfig>,
    #[serde(default)]
    pub network: Option<CookieNetwork>,
    #[serde(default)]
    pub nbd: Option<CookieNbd>,
    #[serde(default)]
    pub statistics: Option<JobStats>,
}

impl MigrationCookie {
    pub fn new(name: &str, uuid: Uuid, hostname: &str, host_uuid: Uuid) -> Self {
        MigrationCookie {
            name: name.to_string(),
            uuid,
            remote_hostname: hostname.to_string(),
            remote_hostuuid: host_uuid,
            features: vec![],
            features_mandatory: vec![],
            graphics: None,
            lockstate: None,
            persistent: None,
            network: None,
            nbd: None,
            statistics: None,
        }
    }

    fn add_feature(&mut self, name: &str, mandatory: bool) {
        if !self.features.iter().any(|f| f == name) {
            self.features.push(name.to_string());
        }
        if mandatory && !self.features_mandatory.iter().any(|f| f == name) {
            self.features_mandatory.push(name.to_string());
        }
    }

    pub fn set_graphics(&mut self, graphics: &GraphicsConfig) {
        self.graphics = Some(CookieGraphics {
            kind: graphics.kind.to_string(),
            port: graphics.port,
            tls_port: graphics.tls_port,
            listen: graphics.listen.clone(),
            tls_subject: graphics.tls_subject.clone(),
        });
        self.add_feature("graphics", false);
    }

    /// Lock state travels mandatory: a receiver with a different lock
    /// driver must not silently drop the lease.
    pub fn set_lockstate(&mut self, driver: &str, lease: Option<String>) {
        self.lockstate = Some(CookieLockstate {
            driver: driver.to_string(),
            lease,
        });
        self.add_feature("lockstate", true);
    }

    pub fn set_persistent(&mut self, def: DomainConfig) {
        self.persistent = Some(def);
        self.add_feature("persistent", true);
    }

    pub fn set_network(&mut self, network: CookieNetwork) {
        self.network = Some(network);
        self.add_feature("network", false);
    }

    pub fn set_nbd(&mut self, nbd: CookieNbd) {
        self.nbd = Some(nbd);
        self.add_feature("nbd", false);
    }

    pub fn set_statistics(&mut self, stats: JobStats) {
        self.statistics = Some(stats);
        self.add_feature("statistics", false);
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| VmmError::InternalError(format!("encoding migration cookie: {}", e)))
    }

    /// Parse a received cookie. Refuses unknown mandatory features; unknown
    /// optional features and unknown document keys pass through.
    pub fn decode(text: &str) -> Result<MigrationCookie> {
        let cookie: MigrationCookie = serde_json::from_str(text)
            .map_err(|e| VmmError::OperationFailed(format!("malformed migration cookie: {}", e)))?;
        for feature in &cookie.features_mandatory {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(VmmError::ConfigUnsupported(format!(
                    "unsupported mandatory migration cookie feature {}",
                    feature
                )));
            }
        }
        Ok(cookie)
    }

    /// Local-host migration is forbidden: refuse any cookie stamped with
    /// our own identity.
    pub fn check_remote_host(&self, my_hostname: &str, my_host_uuid: Uuid) -> Result<()> {
        if self.remote_hostuuid == my_host_uuid || self.remote_hostname == my_hostname {
            return Err(VmmError::InternalError(format!(
                "Attempt to migrate guest to the same host {}",
                self.remote_hostname
            )));
        }
        Ok(())
    }

    /// The name must match what the receiver expects for this domain.
    pub fn check_name(&self, expected: &str) -> Result<()> {
        if self.name != expected {
            return Err(VmmError::OperationFailed(format!(
                "migration cookie is for domain {} but {} was expected",
                self.name, expected
            )));
        }
        Ok(())
    }

    /// Validate the lockstate section against the receiving daemon's lock
    /// driver.
    pub fn check_lockstate(&self, my_driver: &str) -> Result<()> {
        if let Some(lockstate) = &self.lockstate {
            if lockstate.driver != my_driver {
                return Err(VmmError::ConfigUnsupported(format!(
                    "source uses lock manager {} but this host runs {}",
                    lockstate.driver, my_driver
                )));
            }
        }
        Ok(())
    }

    /// Seed a graphics section from the first relocatable display.
    pub fn graphics_from_def(def: &DomainConfig) -> Option<&GraphicsConfig> {
        def.graphics
            .iter()
            .find(|g| matches!(g.kind, GraphicsKind::Spice | GraphicsKind::Vnc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie() -> MigrationCookie {
        MigrationCookie::new(
            "vm1",
            Uuid::parse_str("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaa01").unwrap(),
            "host-a",
            Uuid::parse_str("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaa01").unwrap(),
        )
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut c = cookie();
        c.set_nbd(CookieNbd {
            port: 49153,
            disks: vec![CookieNbdDisk {
                target: "vda".into(),
                capacity: 10_737_418_240,
            }],
        });
        c.set_lockstate("nop", None);
        let decoded = MigrationCookie::decode(&c.encode().unwrap()).unwrap();
        assert_eq!(decoded, c);
        assert_eq!(decoded.nbd.as_ref().unwrap().disks[0].capacity, 10_737_418_240);
        assert!(decoded.features_mandatory.contains(&"lockstate".to_string()));
    }

    #[test]
    fn test_unknown_optional_feature_is_ignored() {
        let mut c = cookie();
        c.features.push("shiny-new-thing".into());
        let decoded = MigrationCookie::decode(&c.encode().unwrap()).unwrap();
        assert!(decoded.features.contains(&"shiny-new-thing".to_string()));
    }

    #[test]
    fn test_unknown_mandatory_feature_is_refused() {
        let mut c = cookie();
        c.features.push("shiny-new-thing".into());
        c.features_mandatory.push("shiny-new-thing".into());
        let err = MigrationCookie::decode(&c.encode().unwrap()).unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }

    #[test]
    fn test_same_host_is_refused() {
        let c = cookie();
        let my_uuid = Uuid::parse_str("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaa01").unwrap();
        let err = c.check_remote_host("host-a", my_uuid).unwrap_err();
        assert_eq!(err.code(), "internal-error");
        assert_eq!(
            err.to_string(),
            "internal error: Attempt to migrate guest to the same host host-a"
        );

        let other_uuid = Uuid::parse_str("bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbb02").unwrap();
        c.check_remote_host("host-b", other_uuid).unwrap();
    }

    #[test]
    fn test_name_mismatch() {
        let c = cookie();
        assert!(c.check_name("vm1").is_ok());
        assert!(c.check_name("other").is_err());
    }

    #[test]
    fn test_lockstate_driver_mismatch() {
        let mut c = cookie();
        c.set_lockstate("sanlock", Some("lease".into()));
        assert!(c.check_lockstate("sanlock").is_ok());
        let err = c.check_lockstate("nop").unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
    }
}
