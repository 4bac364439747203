/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public origin of every locally owned entity, e.g. `https://social.example`.
    pub base_uri: String,
    pub data_dir: Option<String>,
    pub db_file: String,
    /// Default unflatten depth when a caller does not ask for one.
    pub render_depth: u32,
    /// Server-enforced ceiling for requested render depths.
    pub max_render_depth: u32,
    /// Fixed transport timeout for remote fetch and delivery (seconds).
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub queue: QueueConfig,
    /// Lifetime of delivery bearer tokens (seconds).
    pub token_ttl_secs: u64,
    /// Accepted clock skew on inbound signed requests (seconds).
    pub max_date_skew_secs: u64,
    /// RSA modulus size for newly provisioned actors.
    pub actor_key_bits: usize,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// How long a claimed job stays invisible to other workers.
    pub claim_lease_secs: u64,
    /// Optional upper bound on an idle wait; `None` waits for a wake signal only.
    pub idle_poll_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
            claim_lease_secs: 300,
            idle_poll_secs: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_uri: "http://localhost:8787".to_string(),
            data_dir: None,
            db_file: "fedgraph.db".to_string(),
            render_depth: 3,
            max_render_depth: 5,
            http_timeout_secs: 30,
            user_agent: format!("fedgraph/{}", env!("CARGO_PKG_VERSION")),
            queue: QueueConfig::default(),
            token_ttl_secs: 300,
            max_date_skew_secs: 3600,
            actor_key_bits: 2048,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg: ServerConfig = serde_json::from_str(&text)
            .with_context(|| format!("parse config json: {}", path.display()))?;
        cfg.base_uri = cfg.base_uri.trim().trim_end_matches('/').to_string();
        Ok(cfg)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.data_dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        default_data_dir()
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.db_file))
    }

    /// Clamps a requested render depth to the server maximum.
    pub fn effective_depth(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.render_depth)
            .min(self.max_render_depth)
    }

    pub fn base(&self) -> &str {
        self.base_uri.trim_end_matches('/')
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEDGRAPH_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "fedgraph", "Fedgraph")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"base_uri":"https://a.example","queue":{"max_attempts":3}}"#)
                .unwrap();
        assert_eq!(cfg.base_uri, "https://a.example");
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.base_backoff_secs, 5);
        assert_eq!(cfg.render_depth, 3);
    }

    #[test]
    fn depth_is_clamped_to_server_max() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.effective_depth(None), 3);
        assert_eq!(cfg.effective_depth(Some(1)), 1);
        assert_eq!(cfg.effective_depth(Some(50)), 5);
    }
}
