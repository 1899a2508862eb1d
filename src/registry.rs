// Scripted Gateway - Token Registry
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// In-memory token -> root table. Read-mostly: lookups take a shared lock,
// register/revoke/replace take the write lock. Owned by the server state,
// never a global.

use crate::error::{GatewayError, GatewayResult};
use crate::projects_db::ProjectsDb;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Minimum token length (hex characters)
pub const MIN_TOKEN_LEN: usize = 8;

/// Token shape: `[a-f0-9]{8,}`. Uppercase hex is not a token.
pub fn is_token_shaped(token: &str) -> bool {
    token.len() >= MIN_TOKEN_LEN && token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Default)]
pub struct TokenRegistry {
    roots: RwLock<HashMap<String, PathBuf>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit bindings. Malformed tokens are skipped.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, PathBuf)>,
    {
        let registry = Self::new();
        registry.replace_all(entries);
        registry
    }

    /// Load every binding from the project store
    pub fn load(db: &ProjectsDb) -> anyhow::Result<Self> {
        let registry = Self::from_entries(db.list_all()?);
        log::info!("Token registry loaded: {} project(s)", registry.len());
        Ok(registry)
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, token: &str) -> GatewayResult<PathBuf> {
        if !is_token_shaped(token) {
            return Err(GatewayError::UntrustedToken);
        }
        self.roots
            .read()
            .get(token)
            .cloned()
            .ok_or(GatewayError::UntrustedToken)
    }

    /// Bind a token. Returns false when the token is malformed.
    pub fn register(&self, token: &str, root: &Path) -> bool {
        if !is_token_shaped(token) {
            return false;
        }
        self.roots.write().insert(token.to_string(), root.to_path_buf());
        true
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.roots.write().remove(token).is_some()
    }

    /// Swap the whole table in one write.
    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, PathBuf)>,
    {
        let next: HashMap<String, PathBuf> = entries
            .into_iter()
            .filter(|(token, _)| {
                let ok = is_token_shaped(token);
                if !ok {
                    log::warn!("Skipping malformed token in project store");
                }
                ok
            })
            .collect();
        *self.roots.write() = next;
    }

    /// Re-read the project store and swap it in
    pub fn refresh(&self, db: &ProjectsDb) -> anyhow::Result<()> {
        let entries = db.list_all()?;
        let before = self.len();
        self.replace_all(entries);
        let after = self.len();
        if before != after {
            log::info!("Token registry refreshed: {} -> {} project(s)", before, after);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape() {
        assert!(is_token_shaped("deadbeef"));
        assert!(is_token_shaped("deadbeef0123456789"));
        assert!(!is_token_shaped("deadbee"));
        assert!(!is_token_shaped("DEADBEEF01"));
        assert!(!is_token_shaped("deadbeefxx"));
        assert!(!is_token_shaped(""));
        assert!(!is_token_shaped("files"));
    }

    #[test]
    fn resolve_is_exact_match() {
        let registry = TokenRegistry::new();
        assert!(registry.register("deadbeef01", Path::new("/proj")));

        assert_eq!(registry.resolve("deadbeef01").unwrap(), PathBuf::from("/proj"));
        assert!(matches!(registry.resolve("deadbeef0"), Err(GatewayError::UntrustedToken)));
        assert!(matches!(registry.resolve("deadbeef011"), Err(GatewayError::UntrustedToken)));
        assert!(matches!(registry.resolve("DEADBEEF01"), Err(GatewayError::UntrustedToken)));
    }

    #[test]
    fn revoked_token_is_untrusted() {
        let registry = TokenRegistry::new();
        registry.register("cafebabe", Path::new("/proj"));
        assert!(registry.revoke("cafebabe"));
        assert!(!registry.revoke("cafebabe"));
        assert!(matches!(registry.resolve("cafebabe"), Err(GatewayError::UntrustedToken)));
    }

    #[test]
    fn malformed_tokens_never_register() {
        let registry = TokenRegistry::new();
        assert!(!registry.register("short", Path::new("/proj")));
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_all_swaps_table() {
        let registry = TokenRegistry::from_entries(vec![
            ("aaaaaaaa".to_string(), PathBuf::from("/a")),
            ("NOTATOKEN".to_string(), PathBuf::from("/x")),
        ]);
        assert_eq!(registry.len(), 1);

        registry.replace_all(vec![("bbbbbbbb".to_string(), PathBuf::from("/b"))]);
        assert!(registry.resolve("aaaaaaaa").is_err());
        assert_eq!(registry.resolve("bbbbbbbb").unwrap(), PathBuf::from("/b"));
    }

    #[test]
    fn refresh_picks_up_store_changes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = ProjectsDb::open(&dir.path().join("PROJECTS.DB"))?;
        db.set("deadbeef01", Path::new("/proj"))?;

        let registry = TokenRegistry::load(&db)?;
        assert_eq!(registry.len(), 1);

        db.set("deadbeef02", Path::new("/other"))?;
        db.delete("deadbeef01")?;
        registry.refresh(&db)?;

        assert!(registry.resolve("deadbeef01").is_err());
        assert_eq!(registry.resolve("deadbeef02")?, PathBuf::from("/other"));
        Ok(())
    }
}
