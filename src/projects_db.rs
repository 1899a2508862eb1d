// Scripted Gateway - Projects LMDB
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// LMDB-backed project store: token -> project root.
// The registry loads from here at startup and on refresh; the CLI writes.
//
// Database: PROJECTS
// Storage: <data_dir>/PROJECTS/PROJECTS.DB/

use anyhow::Result;
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions};
use std::path::{Path, PathBuf};

const MAX_DB_SIZE: usize = 20 * 1024 * 1024; // 20MB

/// LMDB-backed project store
pub struct ProjectsDb {
    env: Env,
    /// token -> absolute root path
    projects: Database<Str, Str>,
}

impl ProjectsDb {
    /// Open or create projects LMDB at given path
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAX_DB_SIZE)
                .max_dbs(8)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let projects = env.create_database(&mut wtxn, Some("projects"))?;
        wtxn.commit()?;

        log::info!("PROJECTS LMDB opened at {:?}", path);
        Ok(Self { env, projects })
    }

    /// Root for a token
    pub fn get(&self, token: &str) -> Result<Option<PathBuf>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.projects.get(&rtxn, token)?.map(PathBuf::from))
    }

    /// Bind a token to a root
    pub fn set(&self, token: &str, root: &Path) -> Result<()> {
        let root = root.to_string_lossy();
        let mut wtxn = self.env.write_txn()?;
        self.projects.put(&mut wtxn, token, &root)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Drop a token
    pub fn delete(&self, token: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.projects.delete(&mut wtxn, token)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    /// List all entries
    pub fn list_all(&self) -> Result<Vec<(String, PathBuf)>> {
        let rtxn = self.env.read_txn()?;
        let iter = self.projects.iter(&rtxn)?;
        let mut entries = Vec::new();
        for result in iter {
            let (token, root) = result?;
            entries.push((token.to_string(), PathBuf::from(root)));
        }
        Ok(entries)
    }

    /// Number of registered tokens
    pub fn count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.projects.stat(&rtxn)?.entries as u64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
