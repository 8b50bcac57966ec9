//! Daemon configuration (spec §1 ambient config volume).
//!
//! Loaded from TOML, the same way the teacher loads its mount export
//! table — one `serde`-derived struct, `toml::from_str`, reread on
//! `REREAD_CONFIG` rather than process restart. The config volume
//! itself is addressed as [`crate::rpc::VOLUME_ID_CONFIG`] on the wire.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolumeConfig {
    pub id: u32,
    pub name: String,
    pub mountpoint: String,
    pub master_node: u32,
    pub local_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub zfs_uid: u32,
    pub node: u32,
    pub remote_uid: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    pub zfs_gid: u32,
    pub node: u32,
    pub remote_gid: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub this_node: u32,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Config {
    pub fn from_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|_| ReconcileError::InvalidRequest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn volume(&self, id: u32) -> Option<&VolumeConfig> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn node(&self, id: u32) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
