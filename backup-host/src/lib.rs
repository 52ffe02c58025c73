//! Local host for the tenant backup engine.
//!
//! Tenant databases are SQLite files pooled with r2d2, archives and tenant
//! objects live on the local filesystem, and settings are kept in each
//! tenant's `tenant_settings` table.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod state;

pub use config::HostConfig;
pub use state::HostState;
