// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GraphicsKind {
    Vnc,
    Spice,
    Sdl,
}

/// What the server does with established clients when the password changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordConnected {
    Keep,
    Disconnect,
    Fail,
}

impl Default for PasswordConnected {
    fn default() -> Self {
        PasswordConnected::Keep
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsConfig {
    pub kind: GraphicsKind,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub tls_port: i32,
    #[serde(default)]
    pub autoport: bool,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub keymap: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
    /// RFC 3339 expiry; "now" disables the password immediately.
    #[serde(default)]
    pub passwd_valid_to: Option<String>,
    #[serde(default)]
    pub connected: PasswordConnected,
    /// TLS x509 distinguished name, advertised to relocating clients.
    #[serde(default)]
    pub tls_subject: Option<String>,
}
