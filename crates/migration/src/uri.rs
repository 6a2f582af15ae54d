// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Migration URI handling: `tcp:host:port`, the legacy `tcp://host:port`
//! spelling, `rdma://host:port` and `unix:/path`.

use std::path::PathBuf;

use vmm_types::{Result, VmmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateUri {
    Tcp { host: String, port: Option<u16> },
    Rdma { host: String, port: Option<u16> },
    Unix { path: PathBuf },
}

fn split_host_port(rest: &str) -> Result<(String, Option<u16>)> {
    // IPv6 literals are bracketed: [::1]:49152
    if let Some(stripped) = rest.strip_prefix('[') {
        let end = stripped.find(']').ok_or_else(|| {
            VmmError::ArgumentUnsupported(format!("malformed IPv6 address in URI: {}", rest))
        })?;
        let host = stripped[..end].to_string();
        let tail = &stripped[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if tail.is_empty() => None,
            None => {
                return Err(VmmError::ArgumentUnsupported(format!(
                    "trailing garbage after IPv6 address: {}",
                    rest
                )))
            }
        };
        return Ok((host, port));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
        _ => Ok((rest.to_string(), None)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| VmmError::ArgumentUnsupported(format!("bad migration port: {}", s)))
}

impl MigrateUri {
    /// Parse a caller-supplied migration URI. The legacy `tcp://` spelling
    /// is rewritten to the well-formed scheme.
    pub fn parse(s: &str) -> Result<MigrateUri> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(VmmError::ArgumentUnsupported(
                    "unix migration URI needs a path".to_string(),
                ));
            }
            return Ok(MigrateUri::Unix {
                path: PathBuf::from(path),
            });
        }
        if let Some(rest) = s.strip_prefix("rdma://") {
            let (host, port) = split_host_port(rest)?;
            return Ok(MigrateUri::Rdma { host, port });
        }
        // Legacy compatibility: tcp://host:port means tcp:host:port.
        if let Some(rest) = s.strip_prefix("tcp://").or_else(|| s.strip_prefix("tcp:")) {
            let (host, port) = split_host_port(rest)?;
            if host.is_empty() {
                return Err(VmmError::ArgumentUnsupported(format!(
                    "migration URI {} has no host",
                    s
                )));
            }
            return Ok(MigrateUri::Tcp { host, port });
        }
        Err(VmmError::ArgumentUnsupported(format!(
            "unsupported migration URI scheme: {}",
            s
        )))
    }

    /// The default URI a source constructs when the caller omitted one.
    /// Requires a real FQDN: "localhost" would make the hypervisors talk
    /// to themselves.
    pub fn default_for_host(hostname: &str, port: u16) -> Result<MigrateUri> {
        if hostname.starts_with("localhost") {
            return Err(VmmError::ConfigUnsupported(format!(
                "hostname {} resolves to the local host; migration needs an FQDN",
                hostname
            )));
        }
        Ok(MigrateUri::Tcp {
            host: hostname.to_string(),
            port: Some(port),
        })
    }

    pub fn with_port(self, new_port: u16) -> MigrateUri {
        match self {
            MigrateUri::Tcp { host, .. } => MigrateUri::Tcp {
                host,
                port: Some(new_port),
            },
            MigrateUri::Rdma { host, .. } => MigrateUri::Rdma {
                host,
                port: Some(new_port),
            },
            uri => uri,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            MigrateUri::Tcp { port, .. } | MigrateUri::Rdma { port, .. } => *port,
            MigrateUri::Unix { .. } => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            MigrateUri::Tcp { host, .. } | MigrateUri::Rdma { host, .. } => Some(host),
            MigrateUri::Unix { .. } => None,
        }
    }

    pub fn is_rdma(&self) -> bool {
        matches!(self, MigrateUri::Rdma { .. })
    }

    fn format_host(host: &str) -> String {
        if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        }
    }

    /// The directive handed to the hypervisor (`migrate` on the source,
    /// `-incoming` on the destination).
    pub fn to_hypervisor_uri(&self) -> String {
        match self {
            MigrateUri::Tcp { host, port } => format!(
                "tcp:{}:{}",
                Self::format_host(host),
                port.unwrap_or(0)
            ),
            MigrateUri::Rdma { host, port } => format!(
                "rdma:{}:{}",
                Self::format_host(host),
                port.unwrap_or(0)
            ),
            MigrateUri::Unix { path } => format!("unix:{}", path.display()),
        }
    }

    /// The listen directive for the destination hypervisor.
    pub fn to_incoming_uri(&self, listen_address: &str) -> String {
        match self {
            MigrateUri::Tcp { port, .. } => format!(
                "tcp:{}:{}",
                Self::format_host(listen_address),
                port.unwrap_or(0)
            ),
            MigrateUri::Rdma { port, .. } => format!(
                "rdma:{}:{}",
                Self::format_host(listen_address),
                port.unwrap_or(0)
            ),
            MigrateUri::Unix { path } => format!("unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_tcp() {
        let uri = MigrateUri::parse("tcp:host-b:49152").unwrap();
        assert_eq!(
            uri,
            MigrateUri::Tcp {
                host: "host-b".into(),
                port: Some(49152)
            }
        );
        assert_eq!(uri.to_hypervisor_uri(), "tcp:host-b:49152");
    }

    #[test]
    fn test_legacy_tcp_spelling_is_rewritten() {
        let uri = MigrateUri::parse("tcp://host-b:49152").unwrap();
        assert_eq!(uri.to_hypervisor_uri(), "tcp:host-b:49152");
    }

    #[test]
    fn test_parse_tcp_without_port() {
        let uri = MigrateUri::parse("tcp:host-b").unwrap();
        assert_eq!(uri.port(), None);
        assert_eq!(uri.with_port(49153).to_hypervisor_uri(), "tcp:host-b:49153");
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let uri = MigrateUri::parse("tcp:[fe80::1]:49152").unwrap();
        assert_eq!(uri.host(), Some("fe80::1"));
        assert_eq!(uri.to_hypervisor_uri(), "tcp:[fe80::1]:49152");
    }

    #[test]
    fn test_rdma_and_unix() {
        assert!(MigrateUri::parse("rdma://host-b:49152").unwrap().is_rdma());
        let uri = MigrateUri::parse("unix:/run/vmmd/mig.sock").unwrap();
        assert_eq!(uri.to_hypervisor_uri(), "unix:/run/vmmd/mig.sock");
    }

    #[test]
    fn test_unknown_scheme() {
        let err = MigrateUri::parse("ftp://host-b").unwrap_err();
        assert_eq!(err.code(), "argument-unsupported");
    }

    #[test]
    fn test_default_uri_refuses_localhost() {
        let err = MigrateUri::default_for_host("localhost.localdomain", 49152).unwrap_err();
        assert_eq!(err.code(), "config-unsupported");
        let uri = MigrateUri::default_for_host("host-a.example.com", 49152).unwrap();
        assert_eq!(uri.to_hypervisor_uri(), "tcp:host-a.example.com:49152");
    }
}
