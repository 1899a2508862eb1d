// Scripted Gateway - Path Discovery
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Single source of truth for where the gateway keeps its own state.
// Uses walk-up discovery from binary location before falling back to env.
// Cached via OnceLock for zero-overhead repeated access.
//
// SECURITY NOTE: these are gateway-owned paths only. Project paths are
// never derived here; they go through confine.rs on every request.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static GATEWAY_ROOT_CACHE: OnceLock<PathBuf> = OnceLock::new();

/// Find the gateway root.
///
/// Resolution order:
///   1. Walk up from binary location looking for Cargo.toml
///   2. SCRIPTED_ROOT environment variable
///   3. HOME env + /.scripted-gateway
///   4. Current directory
pub fn gateway_root() -> &'static Path {
    GATEWAY_ROOT_CACHE.get_or_init(|| {
        if let Ok(exe) = std::env::current_exe() {
            if let Ok(canonical) = exe.canonicalize() {
                let mut dir = canonical.parent();
                while let Some(d) = dir {
                    if d.join("Cargo.toml").exists() {
                        return d.to_path_buf();
                    }
                    dir = d.parent();
                }
            }
        }

        if let Ok(root) = std::env::var("SCRIPTED_ROOT") {
            let p = PathBuf::from(&root);
            if p.exists() {
                return p;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".scripted-gateway");
        }

        PathBuf::from(".")
    })
}

/// Default config file: <root>/gateway.json
pub fn default_config_path() -> PathBuf {
    gateway_root().join("gateway.json")
}

/// Default data directory holding PROJECTS.DB
pub fn default_data_dir() -> PathBuf {
    gateway_root().join("LIVE")
}

/// Default static client directory
pub fn default_client_dir() -> PathBuf {
    gateway_root().join("client")
}

/// Project store location inside a data directory
pub fn projects_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("PROJECTS").join("PROJECTS.DB")
}
