// Scripted Gateway - Library Root
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// All modules exported here for use by the binary and tests.

pub mod paths;
pub mod config;
pub mod error;

// ============================================================================
// ACCESS CONTROL
// ============================================================================

/// PROJECTS: LMDB-backed token store
pub mod projects_db;

/// In-memory token -> root table served to requests
pub mod registry;

/// Path confinement, the single gate to the file system
pub mod confine;

// ============================================================================
// SERVICES
// ============================================================================

pub mod negotiate;
pub mod analysis;
pub mod files;
pub mod commands;
pub mod events;

/// HTTP/WebSocket front
pub mod server;
