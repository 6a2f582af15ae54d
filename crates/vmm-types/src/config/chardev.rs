// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum ChardevBackend {
    /// A host character device node passed through directly.
    Dev { path: PathBuf },
    Pty,
    Socket { path: PathBuf },
    File { path: PathBuf },
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChardevConfig {
    pub id: String,
    #[serde(flatten)]
    pub backend: ChardevBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum RngBackend {
    /// Reads entropy from a host device node, /dev/random by default.
    Random { path: PathBuf },
    Egd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngConfig {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(flatten)]
    pub backend: RngBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum TpmBackend {
    Passthrough { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmConfig {
    #[serde(flatten)]
    pub backend: TpmBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundConfig {
    pub model: String,
}
