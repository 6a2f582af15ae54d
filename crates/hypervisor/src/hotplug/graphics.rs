// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live graphics reconfiguration. Only the password, its expiry and the
//! connected-clients policy can change on a running guest.

use vmm_types::config::{GraphicsConfig, GraphicsKind, PasswordConnected};
use vmm_types::{Result, VmmError};

use crate::domain::Domain;

fn connected_arg(connected: PasswordConnected) -> &'static str {
    match connected {
        PasswordConnected::Keep => "keep",
        PasswordConnected::Disconnect => "disconnect",
        PasswordConnected::Fail => "fail",
    }
}

/// Apply a graphics update to the running guest.
pub async fn update_graphics(domain: &Domain, new: GraphicsConfig) -> Result<()> {
    let old = {
        let inner = domain.lock().await;
        inner.require_active()?;
        inner
            .def
            .graphics
            .iter()
            .find(|g| g.kind == new.kind)
            .cloned()
            .ok_or_else(|| {
                VmmError::OperationInvalid(format!(
                    "domain has no {} graphics to change",
                    new.kind
                ))
            })?
    };

    if old.port != new.port
        || old.tls_port != new.tls_port
        || old.autoport != new.autoport
        || old.listen != new.listen
        || old.keymap != new.keymap
    {
        return Err(VmmError::OperationUnsupported(format!(
            "cannot change port, listen address or keymap of {} graphics on a running domain",
            new.kind
        )));
    }

    let protocol = match new.kind {
        GraphicsKind::Vnc => "vnc",
        GraphicsKind::Spice => "spice",
        GraphicsKind::Sdl => {
            return Err(VmmError::OperationUnsupported(
                "SDL graphics have no runtime-changeable properties".to_string(),
            ))
        }
    };

    let password = new.passwd.clone().unwrap_or_default();
    let connected = connected_arg(new.connected);
    let expiry = new.passwd_valid_to.clone();

    let mon = domain.enter_monitor().await?;
    let outcome: Result<()> = async {
        mon.set_password(protocol, &password, connected)
            .await
            .map_err(VmmError::from)?;
        if let Some(expiry) = &expiry {
            mon.expire_password(protocol, expiry)
                .await
                .map_err(VmmError::from)?;
        }
        Ok(())
    }
    .await;
    domain.exit_monitor(mon).await?;
    outcome?;

    let mut inner = domain.lock().await;
    if let Some(graphics) = inner.def.graphics.iter_mut().find(|g| g.kind == new.kind) {
        graphics.passwd = new.passwd;
        graphics.passwd_valid_to = new.passwd_valid_to;
        graphics.connected = new.connected;
    }
    drop(inner);
    let _ = domain.save_status().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_arg_mapping() {
        assert_eq!(connected_arg(PasswordConnected::Keep), "keep");
        assert_eq!(connected_arg(PasswordConnected::Disconnect), "disconnect");
        assert_eq!(connected_arg(PasswordConnected::Fail), "fail");
    }
}
