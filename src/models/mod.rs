//! Core data models for the release registry.
//!
//! These entities describe deployments, the per-app-version release
//! pointer, and the immutable packages it points at. They map to SQLite
//! rows via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod deployment;
pub mod deployment_version;
pub mod package;
